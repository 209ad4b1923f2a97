use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// How strictly runs are cut off from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkIsolation {
    /// Unshare the network namespace or fail the run with a system error
    Required,
    /// Unshare when the host permits it, otherwise run without
    BestEffort,
    Off,
}

impl FromStr for NetworkIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "required" => Ok(NetworkIsolation::Required),
            "best-effort" | "best_effort" => Ok(NetworkIsolation::BestEffort),
            "off" | "none" => Ok(NetworkIsolation::Off),
            other => Err(format!("unknown network isolation mode: {}", other)),
        }
    }
}

/// Engine and service configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redis_url: String,
    pub port: u16,
    pub languages_path: PathBuf,
    /// Added to the time limit to get the wall-clock watchdog
    pub wall_margin_ms: u64,
    pub max_concurrent_gradings: usize,
    pub max_output_bytes: usize,
    pub compile_time_limit_ms: u32,
    pub compile_memory_limit_mb: u32,
    pub network_isolation: NetworkIsolation,
    pub scratch_root: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        }

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            port: parsed(&lookup, "PORT", 8080),
            languages_path: lookup("ARBITER_LANGUAGES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
            wall_margin_ms: parsed(&lookup, "ARBITER_WALL_MARGIN_MS", 500).max(1),
            max_concurrent_gradings: parsed(
                &lookup,
                "ARBITER_MAX_CONCURRENT_GRADINGS",
                default_parallelism,
            )
            .max(1),
            max_output_bytes: parsed(&lookup, "ARBITER_MAX_OUTPUT_BYTES", 1024 * 1024),
            compile_time_limit_ms: parsed(&lookup, "ARBITER_COMPILE_TIME_LIMIT_MS", 10_000).max(1),
            compile_memory_limit_mb: parsed(&lookup, "ARBITER_COMPILE_MEMORY_LIMIT_MB", 1024)
                .max(1),
            network_isolation: parsed(
                &lookup,
                "ARBITER_NETWORK_ISOLATION",
                NetworkIsolation::BestEffort,
            ),
            scratch_root: lookup("ARBITER_SCRATCH_ROOT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.wall_margin_ms, 500);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.compile_time_limit_ms, 10_000);
        assert_eq!(config.compile_memory_limit_mb, 1024);
        assert_eq!(config.network_isolation, NetworkIsolation::BestEffort);
        assert_eq!(config.languages_path, PathBuf::from("config/languages.json"));
        assert!(config.max_concurrent_gradings >= 1);
        assert!(config.scratch_root.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ARBITER_WALL_MARGIN_MS", "250"),
            ("ARBITER_MAX_CONCURRENT_GRADINGS", "3"),
            ("ARBITER_NETWORK_ISOLATION", "required"),
            ("ARBITER_SCRATCH_ROOT", "/var/tmp/arbiter"),
            ("PORT", "9000"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.wall_margin_ms, 250);
        assert_eq!(config.max_concurrent_gradings, 3);
        assert_eq!(config.network_isolation, NetworkIsolation::Required);
        assert_eq!(config.scratch_root, Some(PathBuf::from("/var/tmp/arbiter")));
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = EngineConfig::from_lookup(|k| match k {
            "ARBITER_WALL_MARGIN_MS" => Some("soon".to_string()),
            "ARBITER_NETWORK_ISOLATION" => Some("maybe".to_string()),
            "ARBITER_MAX_CONCURRENT_GRADINGS" => Some("0".to_string()),
            _ => None,
        });

        assert_eq!(config.wall_margin_ms, 500);
        assert_eq!(config.network_isolation, NetworkIsolation::BestEffort);
        assert_eq!(config.max_concurrent_gradings, 1);
    }
}
