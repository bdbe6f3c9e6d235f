use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::currency;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub preferred_currency: String,
    pub fx_api_url: Option<String>,
    /// Minimum spacing between accepted ticks of one symbol, on tick timestamps.
    pub tick_min_interval: Duration,
    pub maintenance_interval: Duration,
    pub retention: RetentionPolicy,
    pub valuation: ValuationConfig,
    pub chart_cache: ChartCacheConfig,
    pub memory: MemoryThresholds,
    pub batch: BatchConfig,
}

/// Age boundaries and density rules for the retention passes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub purge_after_days: i64,
    pub aggregate_after_days: i64,
    pub compress_after_days: i64,
    /// Keep every Nth point in the compression band.
    pub compress_keep_every: usize,
    /// Expected points per week; aggregation needs twice this many eligible points.
    pub weekly_ratio: usize,
    pub base_symbol_cap: usize,
    /// `(total points above which, per-symbol cap)`, tightest last.
    pub cap_tiers: Vec<(usize, usize)>,
    pub yield_every_symbols: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            purge_after_days: 1825,
            aggregate_after_days: 365,
            compress_after_days: 30,
            compress_keep_every: 4,
            weekly_ratio: 7,
            base_symbol_cap: 2500,
            cap_tiers: vec![(50_000, 1500), (100_000, 1000)],
            yield_every_symbols: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValuationConfig {
    /// Share of positions that must be priced for a day to be emitted.
    pub min_valid_fraction: f64,
    pub lookup_tolerance_days: i64,
    pub window_days: i64,
    pub window_pause: Duration,
    pub yield_every_days: usize,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            min_valid_fraction: 0.5,
            lookup_tolerance_days: 30,
            window_days: 31,
            window_pause: Duration::from_millis(0),
            yield_every_days: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartCacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub page_size: usize,
}

impl Default for ChartCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 64,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryThresholds {
    pub warning_bytes: u64,
    pub critical_bytes: u64,
    pub emergency_bytes: u64,
    pub sample_interval: Duration,
    pub history_len: usize,
    pub series_cache_entries: usize,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_bytes: 256 * MIB,
            critical_bytes: 384 * MIB,
            emergency_bytes: 512 * MIB,
            sample_interval: Duration::from_secs(30),
            history_len: 60,
            series_cache_entries: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub portfolio_chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub yield_every_chunks: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            portfolio_chunk_size: 100,
            max_concurrent_chunks: 4,
            yield_every_chunks: 10,
        }
    }
}

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), format!("must be {}", expected))
        }),
    }
}

fn positive(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than zero".to_string(),
        ))
    } else {
        Ok(value)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let preferred_currency = env_map
            .get("PREFERRED_CURRENCY")
            .map(|s| currency::normalize(s))
            .unwrap_or_else(|| "USD".to_string());
        if preferred_currency.len() != 3 || !preferred_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::InvalidValue(
                "PREFERRED_CURRENCY".to_string(),
                format!("must be a three-letter code, got {}", preferred_currency),
            ));
        }

        let fx_api_url = env_map
            .get("FX_API_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let tick_min_interval = Duration::from_secs(parse_or(
            &env_map,
            "TICK_MIN_INTERVAL_SECS",
            300u64,
            "a whole number of seconds",
        )?);

        let maintenance_interval = Duration::from_secs(positive(
            "MAINTENANCE_INTERVAL_SECS",
            parse_or(&env_map, "MAINTENANCE_INTERVAL_SECS", 3600u64, "a whole number of seconds")?,
        )?);

        let retention = Self::retention_from_map(&env_map)?;
        let valuation = Self::valuation_from_map(&env_map)?;

        let chart_defaults = ChartCacheConfig::default();
        let chart_cache = ChartCacheConfig {
            ttl: Duration::from_secs(parse_or(
                &env_map,
                "CHART_CACHE_TTL_SECS",
                chart_defaults.ttl.as_secs(),
                "a whole number of seconds",
            )?),
            max_entries: positive(
                "CHART_CACHE_MAX_ENTRIES",
                parse_or(
                    &env_map,
                    "CHART_CACHE_MAX_ENTRIES",
                    chart_defaults.max_entries as u64,
                    "a positive integer",
                )?,
            )? as usize,
            ..chart_defaults
        };

        let memory = Self::memory_from_map(&env_map)?;

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            chunk_size: positive(
                "BATCH_CHUNK_SIZE",
                parse_or(
                    &env_map,
                    "BATCH_CHUNK_SIZE",
                    batch_defaults.chunk_size as u64,
                    "a positive integer",
                )?,
            )? as usize,
            max_concurrent_chunks: positive(
                "BATCH_MAX_CONCURRENT",
                parse_or(
                    &env_map,
                    "BATCH_MAX_CONCURRENT",
                    batch_defaults.max_concurrent_chunks as u64,
                    "a positive integer",
                )?,
            )? as usize,
            ..batch_defaults
        };

        Ok(Config {
            port,
            database_path,
            preferred_currency,
            fx_api_url,
            tick_min_interval,
            maintenance_interval,
            retention,
            valuation,
            chart_cache,
            memory,
            batch,
        })
    }

    fn retention_from_map(env_map: &HashMap<String, String>) -> Result<RetentionPolicy, ConfigError> {
        let defaults = RetentionPolicy::default();
        let purge = parse_or(env_map, "RETENTION_PURGE_DAYS", defaults.purge_after_days, "a number of days")?;
        let aggregate = parse_or(
            env_map,
            "RETENTION_AGGREGATE_DAYS",
            defaults.aggregate_after_days,
            "a number of days",
        )?;
        let compress = parse_or(
            env_map,
            "RETENTION_COMPRESS_DAYS",
            defaults.compress_after_days,
            "a number of days",
        )?;

        if !(0 < compress && compress <= aggregate && aggregate <= purge) {
            return Err(ConfigError::InvalidValue(
                "RETENTION_*_DAYS".to_string(),
                format!(
                    "must satisfy 0 < compress ({}) <= aggregate ({}) <= purge ({})",
                    compress, aggregate, purge
                ),
            ));
        }

        let keep_every = positive(
            "COMPRESSION_KEEP_EVERY",
            parse_or(
                env_map,
                "COMPRESSION_KEEP_EVERY",
                defaults.compress_keep_every as u64,
                "a positive integer",
            )?,
        )? as usize;

        Ok(RetentionPolicy {
            purge_after_days: purge,
            aggregate_after_days: aggregate,
            compress_after_days: compress,
            compress_keep_every: keep_every,
            ..defaults
        })
    }

    fn valuation_from_map(env_map: &HashMap<String, String>) -> Result<ValuationConfig, ConfigError> {
        let defaults = ValuationConfig::default();
        let fraction = parse_or(
            env_map,
            "VALUATION_MIN_VALID_FRACTION",
            defaults.min_valid_fraction,
            "a number between 0 and 1",
        )?;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::InvalidValue(
                "VALUATION_MIN_VALID_FRACTION".to_string(),
                format!("must be between 0 and 1, got {}", fraction),
            ));
        }
        Ok(ValuationConfig {
            min_valid_fraction: fraction,
            ..defaults
        })
    }

    fn memory_from_map(env_map: &HashMap<String, String>) -> Result<MemoryThresholds, ConfigError> {
        let defaults = MemoryThresholds::default();
        let warning = parse_or(env_map, "MEMORY_WARNING_MB", defaults.warning_bytes / MIB, "a number of MiB")?;
        let critical = parse_or(env_map, "MEMORY_CRITICAL_MB", defaults.critical_bytes / MIB, "a number of MiB")?;
        let emergency = parse_or(
            env_map,
            "MEMORY_EMERGENCY_MB",
            defaults.emergency_bytes / MIB,
            "a number of MiB",
        )?;
        if !(0 < warning && warning < critical && critical < emergency) {
            return Err(ConfigError::InvalidValue(
                "MEMORY_*_MB".to_string(),
                format!(
                    "must satisfy 0 < warning ({}) < critical ({}) < emergency ({})",
                    warning, critical, emergency
                ),
            ));
        }
        let sample_secs = positive(
            "MEMORY_SAMPLE_SECS",
            parse_or(
                env_map,
                "MEMORY_SAMPLE_SECS",
                defaults.sample_interval.as_secs(),
                "a whole number of seconds",
            )?,
        )?;

        Ok(MemoryThresholds {
            warning_bytes: warning * MIB,
            critical_bytes: critical * MIB,
            emergency_bytes: emergency * MIB,
            sample_interval: Duration::from_secs(sample_secs),
            ..defaults
        })
    }

    /// Defaults for everything except the database path.
    pub fn with_database_path(database_path: impl Into<String>) -> Self {
        Config {
            port: 8080,
            database_path: database_path.into(),
            preferred_currency: "USD".to_string(),
            fx_api_url: None,
            tick_min_interval: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(3600),
            retention: RetentionPolicy::default(),
            valuation: ValuationConfig::default(),
            chart_cache: ChartCacheConfig::default(),
            memory: MemoryThresholds::default(),
            batch: BatchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.preferred_currency, "USD");
        assert_eq!(config.fx_api_url, None);
        assert_eq!(config.tick_min_interval, Duration::from_secs(300));
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.valuation.min_valid_fraction, 0.5);
        assert_eq!(config.chart_cache.max_entries, 64);
        assert_eq!(config.memory.warning_bytes, 256 * MIB);
        assert_eq!(config.batch.chunk_size, 1000);
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_preferred_currency_is_normalized() {
        let mut env_map = setup_required_env();
        env_map.insert("PREFERRED_CURRENCY".to_string(), "GBp".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.preferred_currency, "GBX");
    }

    #[test]
    fn test_invalid_preferred_currency() {
        let mut env_map = setup_required_env();
        env_map.insert("PREFERRED_CURRENCY".to_string(), "DOLLARS".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PREFERRED_CURRENCY"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_retention_days_must_be_ordered() {
        let mut env_map = setup_required_env();
        env_map.insert("RETENTION_COMPRESS_DAYS".to_string(), "400".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "RETENTION_*_DAYS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_fraction_out_of_range() {
        let mut env_map = setup_required_env();
        env_map.insert("VALUATION_MIN_VALID_FRACTION".to_string(), "1.5".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "VALUATION_MIN_VALID_FRACTION"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_memory_thresholds_must_increase() {
        let mut env_map = setup_required_env();
        env_map.insert("MEMORY_WARNING_MB".to_string(), "600".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "MEMORY_*_MB"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_batch_concurrency_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("BATCH_MAX_CONCURRENT".to_string(), "0".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "BATCH_MAX_CONCURRENT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_fx_url_trailing_slash_trimmed() {
        let mut env_map = setup_required_env();
        env_map.insert("FX_API_URL".to_string(), "https://api.frankfurter.app/".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.fx_api_url.as_deref(), Some("https://api.frankfurter.app"));
    }
}
