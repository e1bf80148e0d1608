//! Mesh configuration: defaults, optional `vagus.toml`, `VAGUS__*` env overrides.

use crate::bus::BusConfig;
use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;
use crate::remediation::RemediationConfig;
use crate::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_store_path() -> String {
    "./data/vagus".to_string()
}

fn default_scratch_dir() -> String {
    "./data/scratch".to_string()
}

fn default_scratch_max_age_secs() -> u64 {
    86_400
}

/// Top-level configuration for one mesh process.
///
/// Sources, later wins: built-in defaults, an optional TOML file
/// (`VAGUS_CONFIG` path, `vagus.toml` otherwise), then environment variables
/// with the `VAGUS` prefix and `__` section separator.
///
/// | Env | Purpose |
/// |-----|---------|
/// | `VAGUS__STORE_PATH` | sled directory for the skill registry |
/// | `VAGUS__SCRATCH_DIR` | directory governed by the scratch skills |
/// | `VAGUS__BUS__HEARTBEAT_INTERVAL_MS` | liveness beacon period |
/// | `VAGUS__MONITOR__INTERVAL_SECS` | vitals sampling period |
/// | `VAGUS__POOL__INITIAL_CEILING` | starting concurrency ceiling |
/// | `VAGUS__ROUTER__BUS_ENABLED` | prefer bus publishes for bound intents |
/// | `VAGUS__REMEDIATION__THRESHOLD` | minimum intensity that triggers dispatch |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    /// sled directory for skill records and signal bindings.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Directory the `scratch_sweep` / `scratch_purge` skills operate on.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    /// Files older than this are fair game for `scratch_sweep`, seconds.
    #[serde(default = "default_scratch_max_age_secs")]
    pub scratch_max_age_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            monitor: MonitorConfig::default(),
            pool: PoolConfig::default(),
            router: RouterConfig::default(),
            remediation: RemediationConfig::default(),
            store_path: default_store_path(),
            scratch_dir: default_scratch_dir(),
            scratch_max_age_secs: default_scratch_max_age_secs(),
        }
    }
}

impl MeshConfig {
    /// Load config from file and environment. Precedence: env `VAGUS_CONFIG`
    /// path > `vagus.toml` > defaults; `VAGUS__*` variables override either.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("VAGUS_CONFIG").unwrap_or_else(|_| "vagus.toml".to_string());
        let builder = config::Config::builder()
            .set_default("store_path", default_store_path())?
            .set_default("scratch_dir", default_scratch_dir())?
            .set_default("scratch_max_age_secs", default_scratch_max_age_secs() as i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("VAGUS").separator("__"))
            .build()?;

        let loaded: Self = built.try_deserialize()?;
        Ok(loaded.sanitized())
    }

    /// Applies every section's floors. Call after any hand-built config too;
    /// components assume sanitized values.
    pub fn sanitized(mut self) -> Self {
        self.bus = self.bus.sanitized();
        self.monitor = self.monitor.sanitized();
        self.pool = self.pool.sanitized();
        self.router = self.router.sanitized();
        self.remediation = self.remediation.sanitized();
        self.scratch_max_age_secs = self.scratch_max_age_secs.max(60);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    #[test]
    fn defaults_cover_every_section() {
        let cfg = MeshConfig::default().sanitized();
        assert_eq!(cfg.bus.heartbeat_interval_ms, 5_000);
        assert_eq!(cfg.monitor.interval_secs, 30);
        assert_eq!(cfg.pool.initial_ceiling, 8);
        assert!(!cfg.router.bus_enabled);
        assert_eq!(cfg.remediation.cooldown_secs, 300);
        assert_eq!(cfg.store_path, "./data/vagus");
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let toml = r#"
            store_path = "/tmp/vagus-test"

            [pool]
            initial_ceiling = 4

            [router]
            bus_enabled = true
        "#;
        let built = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg: MeshConfig = built.try_deserialize().unwrap();
        let cfg = cfg.sanitized();

        assert_eq!(cfg.store_path, "/tmp/vagus-test");
        assert_eq!(cfg.pool.initial_ceiling, 4);
        assert!(cfg.router.bus_enabled);
        // untouched sections keep their defaults
        assert_eq!(cfg.monitor.interval_secs, 30);
        assert_eq!(cfg.bus.dedup_window_secs, 60);
    }

    #[test]
    fn sanitize_floors_hostile_values() {
        let toml = r#"
            scratch_max_age_secs = 0

            [bus]
            heartbeat_interval_ms = 0
            channel_capacity = 1

            [pool]
            initial_ceiling = 0
            floor = 0
        "#;
        let built = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg: MeshConfig = built.try_deserialize().unwrap();
        let cfg = cfg.sanitized();

        assert_eq!(cfg.bus.heartbeat_interval_ms, 50);
        assert_eq!(cfg.bus.channel_capacity, 8);
        assert_eq!(cfg.pool.floor, 1);
        assert!(cfg.pool.initial_ceiling >= cfg.pool.floor);
        assert_eq!(cfg.scratch_max_age_secs, 60);
    }
}
