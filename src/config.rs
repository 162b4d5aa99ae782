// Engine configuration: TOML file plus environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::context_assembler::RankingConfig;
use crate::intent_translator::TranslatorConfig;
use crate::query_cache::CacheConfig;
use crate::query_executor::ExecutorConfig;
use crate::query_validation::ValidatorConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub validator: ValidatorConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub translator: TranslatorConfig,
    pub ranking: RankingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Ok(ttl) = std::env::var("CODERAG_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(
                ttl.parse().context("CODERAG_CACHE_TTL_SECS must be an integer")?,
            );
        }
        if let Ok(max_entries) = std::env::var("CODERAG_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = max_entries
                .parse()
                .context("CODERAG_CACHE_MAX_ENTRIES must be an integer")?;
        }
        if let Ok(timeout) = std::env::var("CODERAG_QUERY_TIMEOUT_MS") {
            config.executor.default_timeout = Duration::from_millis(
                timeout
                    .parse()
                    .context("CODERAG_QUERY_TIMEOUT_MS must be an integer")?,
            );
        }
        if let Ok(limit) = std::env::var("CODERAG_RESULT_LIMIT") {
            config.executor.default_result_limit = limit
                .parse()
                .context("CODERAG_RESULT_LIMIT must be an integer")?;
        }
        if let Ok(hops) = std::env::var("CODERAG_MAX_HOPS") {
            config.validator.max_hops = hops.parse().context("CODERAG_MAX_HOPS must be an integer")?;
        }

        Ok(config)
    }
}

/// Durations written as `"30s"`, `"250ms"` or `"2m"`
pub(crate) mod duration_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, "ms")
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, "s")
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, "m")
        } else {
            return Err(format!(
                "Expected duration string ending with 'ms', 's' or 'm', got '{s}'"
            ));
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|e| format!("Invalid duration '{s}': {e}"))?;
        Ok(match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            _ => Duration::from_secs(
                value
                    .checked_mul(60)
                    .ok_or_else(|| format!("Duration '{s}' is too large"))?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.validator.max_hops, 6);
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.executor.default_timeout, Duration::from_secs(5));
        assert_eq!(config.executor.default_result_limit, 500);
        assert_eq!(config.translator.max_candidates, 3);
    }

    #[test]
    fn test_partial_toml_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[cache]
ttl = "250ms"
max_entries = 16

[executor]
default_timeout = "2s"

[ranking.node_weights]
Method = 2.0
"#
        )?;
        let config = EngineConfig::from_file(file.path())?;
        assert_eq!(config.cache.ttl, Duration::from_millis(250));
        assert_eq!(config.cache.max_entries, 16);
        assert_eq!(config.executor.default_timeout, Duration::from_secs(2));
        assert_eq!(config.ranking.node_weights.get("Method"), Some(&2.0));
        assert_eq!(config.validator, ValidatorConfig::default());
        Ok(())
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(duration_string::parse("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(duration_string::parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(duration_string::parse("2m"), Ok(Duration::from_secs(120)));
        assert!(duration_string::parse("soon").is_err());

        let huge = format!("{}m", u64::MAX / 30);
        let err = duration_string::parse(&huge).unwrap_err();
        assert!(err.contains("too large"), "{err}");
    }

    #[test]
    fn test_round_trip_through_toml() -> Result<()> {
        let config = EngineConfig::default();
        let text = toml::to_string(&config)?;
        let parsed: EngineConfig = toml::from_str(&text)?;
        assert_eq!(parsed, config);
        Ok(())
    }
}
