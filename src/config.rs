/// Runtime configuration for the shell and the monitor.
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::drift::DriftConfig;

/// SimConfig holds all simulator configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub cluster_name: String,
    pub node_count: usize,
    pub drift: DriftConfig,
    /// Where the live metrics snapshot is written for `viz`
    pub snapshot_path: PathBuf,
    /// Drift RNG seed; `None` draws from entropy
    pub seed: Option<u64>,
    /// Node the session starts on
    pub start_node: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            cluster_name: "superpod-a".to_string(),
            node_count: 8,
            drift: DriftConfig::default(),
            snapshot_path: PathBuf::from("/tmp/dgxsim_live.json"),
            seed: None,
            start_node: "dgx-00".to_string(),
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let tick_ms: u64 = get("DGXSIM_DRIFT_TICK_MS", "1000").parse().unwrap_or(1000);
        SimConfig {
            cluster_name: get("DGXSIM_CLUSTER_NAME", "superpod-a"),
            node_count: get("DGXSIM_NODES", "8").parse().ok().filter(|n| *n > 0).unwrap_or(8),
            drift: DriftConfig { tick: Duration::from_millis(tick_ms.max(10)), ..DriftConfig::default() },
            snapshot_path: PathBuf::from(get("DGXSIM_SNAPSHOT_PATH", "/tmp/dgxsim_live.json")),
            seed: lookup("DGXSIM_SEED").and_then(|s| s.parse().ok()),
            start_node: "dgx-00".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let cfg = SimConfig::from_lookup(|_| None);
        assert_eq!(cfg.cluster_name, "superpod-a");
        assert_eq!(cfg.node_count, 8);
        assert_eq!(cfg.drift.tick, Duration::from_millis(1000));
        assert_eq!(cfg.seed, None);
    }

    #[test]
    fn overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("DGXSIM_CLUSTER_NAME", "lab"),
            ("DGXSIM_NODES", "zero"),
            ("DGXSIM_DRIFT_TICK_MS", "250"),
            ("DGXSIM_SEED", "42"),
        ]
        .into_iter()
        .collect();
        let cfg = SimConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.cluster_name, "lab");
        assert_eq!(cfg.node_count, 8);
        assert_eq!(cfg.drift.tick, Duration::from_millis(250));
        assert_eq!(cfg.seed, Some(42));
    }
}
