//! Portfolio holdings and the composition fingerprint.

use crate::domain::{currency, Symbol};
use serde::{Deserialize, Serialize};

/// One line of the current portfolio as reported by the holdings source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub symbol: Symbol,
    pub units: f64,
    pub avg_cost: f64,
    /// Currency the symbol is quoted in (and `avg_cost` is expressed in).
    pub currency: String,
}

impl Holding {
    pub fn new(symbol: Symbol, units: f64, avg_cost: f64, currency: &str) -> Self {
        Self {
            symbol,
            units,
            avg_cost,
            currency: currency::normalize(currency),
        }
    }

    fn fingerprint_tuple(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.symbol,
            self.units,
            self.avg_cost,
            currency::normalize(&self.currency)
        )
    }
}

/// A sorted set of holdings plus its stable fingerprint.
///
/// Two compositions with the same holdings in any order share a fingerprint;
/// changing any position's symbol, units, average cost or currency changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioComposition {
    positions: Vec<Holding>,
    fingerprint: String,
}

impl PortfolioComposition {
    pub fn from_holdings(holdings: Vec<Holding>) -> Self {
        let mut positions: Vec<Holding> = holdings
            .into_iter()
            .map(|h| Holding {
                currency: currency::normalize(&h.currency),
                ..h
            })
            .collect();
        positions.sort_by(|a, b| a.fingerprint_tuple().cmp(&b.fingerprint_tuple()));
        let fingerprint = Self::compute_fingerprint(&positions);
        Self {
            positions,
            fingerprint,
        }
    }

    /// SHA-256 over the sorted `symbol:units:avgCost:currency` tuples.
    pub fn compute_fingerprint(positions: &[Holding]) -> String {
        use sha2::{Digest, Sha256};

        let mut tuples: Vec<String> = positions.iter().map(Holding::fingerprint_tuple).collect();
        tuples.sort();

        let mut hasher = Sha256::new();
        for tuple in &tuples {
            hasher.update(tuple.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }

    pub fn positions(&self) -> &[Holding] {
        &self.positions
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Distinct symbols held, sorted.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.positions.iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Distinct (normalized) currencies the positions are quoted in.
    pub fn currencies(&self) -> Vec<String> {
        let mut out: Vec<String> = self.positions.iter().map(|p| p.currency.clone()).collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(symbol: &str, units: f64, avg_cost: f64, currency: &str) -> Holding {
        Holding::new(Symbol::new(symbol), units, avg_cost, currency)
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = PortfolioComposition::from_holdings(vec![
            holding("AAPL", 10.0, 90.0, "USD"),
            holding("VOD.L", 100.0, 75.0, "GBX"),
        ]);
        let b = PortfolioComposition::from_holdings(vec![
            holding("VOD.L", 100.0, 75.0, "GBX"),
            holding("AAPL", 10.0, 90.0, "USD"),
        ]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.positions(), b.positions());
    }

    #[test]
    fn test_fingerprint_changes_on_units() {
        let a = PortfolioComposition::from_holdings(vec![
            holding("AAPL", 10.0, 90.0, "USD"),
            holding("MSFT", 5.0, 300.0, "USD"),
        ]);
        let b = PortfolioComposition::from_holdings(vec![
            holding("AAPL", 11.0, 90.0, "USD"),
            holding("MSFT", 5.0, 300.0, "USD"),
        ]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_on_cost_and_currency() {
        let base = PortfolioComposition::from_holdings(vec![holding("AAPL", 10.0, 90.0, "USD")]);
        let cost = PortfolioComposition::from_holdings(vec![holding("AAPL", 10.0, 91.0, "USD")]);
        let ccy = PortfolioComposition::from_holdings(vec![holding("AAPL", 10.0, 90.0, "EUR")]);
        assert_ne!(base.fingerprint(), cost.fingerprint());
        assert_ne!(base.fingerprint(), ccy.fingerprint());
    }

    #[test]
    fn test_pence_spellings_share_fingerprint() {
        let a = PortfolioComposition::from_holdings(vec![holding("VOD.L", 1.0, 1.0, "GBp")]);
        let b = PortfolioComposition::from_holdings(vec![holding("VOD.L", 1.0, 1.0, "GBX")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_symbols_and_currencies_are_distinct() {
        let c = PortfolioComposition::from_holdings(vec![
            holding("AAPL", 1.0, 1.0, "USD"),
            holding("AAPL", 2.0, 1.0, "USD"),
            holding("SAP", 1.0, 1.0, "EUR"),
        ]);
        assert_eq!(c.symbols(), vec![Symbol::new("AAPL"), Symbol::new("SAP")]);
        assert_eq!(c.currencies(), vec!["EUR".to_string(), "USD".to_string()]);
        assert_eq!(c.len(), 3);
    }
}
