//! Currency code helpers.
//!
//! London-listed instruments are commonly quoted in pence (`GBX`, sometimes
//! written `GBp`). Pence are not an ISO currency, so conversions go through
//! GBP with a factor of 100.

/// Intermediate currency every valuation is summed in.
pub const INTERMEDIATE_CURRENCY: &str = "USD";

/// Pence per pound.
pub const PENCE_PER_POUND: f64 = 100.0;

/// True for the pence denominations `GBX` and `GBp`.
pub fn is_pence(code: &str) -> bool {
    let code = code.trim();
    code == "GBp" || code.eq_ignore_ascii_case("GBX")
}

/// Canonical form of a currency code.
///
/// Upper-cases everything except `GBp`, which is folded into `GBX` so both
/// spellings share one cache/table entry.
pub fn normalize(code: &str) -> String {
    if is_pence(code) {
        "GBX".to_string()
    } else {
        code.trim().to_uppercase()
    }
}

/// ISO currency a code settles in (`GBX` → `GBP`).
pub fn settlement_currency(code: &str) -> String {
    if is_pence(code) {
        "GBP".to_string()
    } else {
        normalize(code)
    }
}
