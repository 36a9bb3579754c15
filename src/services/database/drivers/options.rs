//! Pool settings read from `DbConfig::options`.

use anyhow::{Result, anyhow};
use sqlx::pool::PoolOptions;
use std::time::Duration;

use crate::services::config::DbConfig;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool knobs shared by every sqlx-backed driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            max_lifetime: None,
        }
    }
}

impl PoolSettings {
    /// Reads `max_connections`, `connect_timeout` (seconds) and
    /// `pool_max_lifetime`. Missing keys keep their defaults.
    pub fn from_config(config: &DbConfig) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(value) = config.option("max_connections") {
            let max: u32 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("max_connections must be a positive integer, got '{}'", value))?;
            if max == 0 {
                return Err(anyhow!("max_connections must be at least 1"));
            }
            settings.max_connections = max;
        }
        if let Some(value) = config.option("connect_timeout") {
            settings.acquire_timeout = parse_duration(value)?;
        }
        if let Some(value) = config.option("pool_max_lifetime") {
            settings.max_lifetime = Some(parse_duration(value)?);
        }
        Ok(settings)
    }

    pub fn apply<DB: sqlx::Database>(&self, options: PoolOptions<DB>) -> PoolOptions<DB> {
        options
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .max_lifetime(self.max_lifetime)
    }
}

/// Parse `45s`, `30m`, `1h`, `1h30m`, `250ms`, `2d` or bare seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(anyhow!("invalid duration '{}'", text));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| anyhow!("invalid duration '{}'", text))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "d" => value.checked_mul(86_400).map(Duration::from_secs),
            _ => return Err(anyhow!("invalid duration unit '{}' in '{}'", unit, text)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| anyhow!("duration '{}' is out of range", text))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::DatabaseKind;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10w").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(parse_duration("18446744073709551615d").is_err());
        assert!(parse_duration("307445734561825861m").is_err());
        assert!(parse_duration("18446744073709551615s1s").is_err());
        assert_eq!(
            parse_duration("7d").unwrap(),
            Duration::from_secs(7 * 86_400)
        );
    }

    #[test]
    fn test_settings_from_options() {
        let mut db = DbConfig::new("a", DatabaseKind::Postgres);
        assert_eq!(PoolSettings::from_config(&db).unwrap(), PoolSettings::default());

        db.options.insert("max_connections".into(), "50".into());
        db.options.insert("connect_timeout".into(), "10".into());
        db.options.insert("pool_max_lifetime".into(), "30m".into());
        let settings = PoolSettings::from_config(&db).unwrap();
        assert_eq!(settings.max_connections, 50);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_lifetime, Some(Duration::from_secs(1800)));

        db.options.insert("max_connections".into(), "0".into());
        assert!(PoolSettings::from_config(&db).is_err());
    }
}
