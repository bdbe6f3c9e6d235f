//! Chart projections: what is plotted and over which window.

use crate::domain::{Symbol, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single plotted point. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDataPoint {
    pub date: TimeMs,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
}

/// Which series a chart shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChartKind {
    PortfolioValue,
    PortfolioGains,
    Price(Symbol),
}

impl ChartKind {
    /// Parse a kind from its wire name plus optional symbol (`price` needs one).
    pub fn parse(kind: &str, symbol: Option<&str>) -> Result<Self, ChartParseError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "portfolio_value" | "value" => Ok(ChartKind::PortfolioValue),
            "portfolio_gains" | "gains" => Ok(ChartKind::PortfolioGains),
            "price" => {
                let symbol = symbol
                    .map(Symbol::new)
                    .filter(|s| !s.is_empty())
                    .ok_or(ChartParseError::MissingSymbol)?;
                Ok(ChartKind::Price(symbol))
            }
            other => Err(ChartParseError::UnknownKind(other.to_string())),
        }
    }

    pub fn is_portfolio(&self) -> bool {
        !matches!(self, ChartKind::Price(_))
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartKind::PortfolioValue => write!(f, "portfolio_value"),
            ChartKind::PortfolioGains => write!(f, "portfolio_gains"),
            ChartKind::Price(symbol) => write!(f, "price:{}", symbol),
        }
    }
}

/// Chart window, ordered from shortest to longest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeRange {
    Day,
    Week,
    Month,
    ThreeMonths,
    SixMonths,
    Year,
    FiveYears,
    All,
}

impl TimeRange {
    pub const ALL: [TimeRange; 8] = [
        TimeRange::Day,
        TimeRange::Week,
        TimeRange::Month,
        TimeRange::ThreeMonths,
        TimeRange::SixMonths,
        TimeRange::Year,
        TimeRange::FiveYears,
        TimeRange::All,
    ];

    /// Length in days, `None` for unbounded.
    pub fn days(&self) -> Option<i64> {
        match self {
            TimeRange::Day => Some(1),
            TimeRange::Week => Some(7),
            TimeRange::Month => Some(30),
            TimeRange::ThreeMonths => Some(90),
            TimeRange::SixMonths => Some(180),
            TimeRange::Year => Some(365),
            TimeRange::FiveYears => Some(1825),
            TimeRange::All => None,
        }
    }

    /// Inclusive start (if bounded) of the window ending at `now`.
    pub fn start(&self, now: TimeMs) -> Option<TimeMs> {
        self.days().map(|d| now.plus_days(-d))
    }

    /// Neighbouring ranges a user is likely to switch to next.
    pub fn adjacent(&self) -> Vec<TimeRange> {
        let idx = Self::ALL.iter().position(|r| r == self).unwrap_or(0);
        let mut out = Vec::with_capacity(2);
        if idx > 0 {
            out.push(Self::ALL[idx - 1]);
        }
        if idx + 1 < Self::ALL.len() {
            out.push(Self::ALL[idx + 1]);
        }
        out
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Day => "1d",
            TimeRange::Week => "1w",
            TimeRange::Month => "1m",
            TimeRange::ThreeMonths => "3m",
            TimeRange::SixMonths => "6m",
            TimeRange::Year => "1y",
            TimeRange::FiveYears => "5y",
            TimeRange::All => "all",
        }
    }
}

impl FromStr for TimeRange {
    type Err = ChartParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        TimeRange::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == lower)
            .ok_or(ChartParseError::UnknownRange(lower))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChartParseError {
    #[error("unknown chart kind: {0}")]
    UnknownKind(String),
    #[error("price charts require a symbol")]
    MissingSymbol,
    #[error("unknown time range: {0}")]
    UnknownRange(String),
}
