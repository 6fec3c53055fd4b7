//! Engine-wide configuration: one place that aggregates every subsystem's
//! tunables, grounded on `performance::config::PerfConfig`'s TOML-file-plus-
//! `serde`-defaults shape. Layering is defaults -> TOML file -> environment
//! variables, the same override order `PerfConfig::from_env` uses, with the
//! individual env var overlay modeled on `vault::orderflow_paper`'s
//! validated-parse-then-overwrite pattern rather than a blanket `envy`-style
//! deserialize, since only a handful of knobs are realistically operator-
//! facing at the shell (the rest belong in the TOML file).
//!
//! There is no `RiskConfig`: `market::risk`'s checks are pure functions over
//! `Order`/`Market` fields (reservation size, tick bounds) with no global
//! tunable, so there is nothing here for it to hold.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::market::amm::AmmConfig;
use crate::market::book::BookConfig;
use crate::market::coordinator::MarketCoordinatorConfig;
use crate::resilience::cache::CacheConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::slo::SloConfig;
use crate::resilience::task_queue::TaskQueueConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the SQLite command/trade/settlement journal.
    pub journal_db_path: String,
    pub book: BookConfig,
    pub amm: AmmConfig,
    pub coordinator: MarketCoordinatorConfig,
    pub breaker: CircuitBreakerConfig,
    pub slo: SloConfig,
    pub cache: CacheConfig,
    pub task_queue: TaskQueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_db_path: "engine.db".to_string(),
            book: BookConfig::default(),
            amm: AmmConfig::default(),
            coordinator: MarketCoordinatorConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            slo: SloConfig::default(),
            cache: CacheConfig::default(),
            task_queue: TaskQueueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Unknown keys are rejected (`deny_unknown_fields`
    /// on every nested config), so a typo in the file surfaces at startup
    /// rather than silently falling back to a default.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Defaults, optionally overridden by the TOML file at `ENGINE_CONFIG_PATH`
    /// (when set and readable), then overridden by individual environment
    /// variables for the knobs most likely to change per-deployment:
    /// journal path, task queue worker count, and breaker cooldown.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut cfg = match std::env::var("ENGINE_CONFIG_PATH") {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::debug!("using default engine config ({}): {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(v) = std::env::var("ENGINE_JOURNAL_DB_PATH") {
            if !v.is_empty() {
                cfg.journal_db_path = v;
            }
        }
        if let Ok(v) = std::env::var("ENGINE_TASK_QUEUE_WORKERS") {
            if let Ok(val) = v.parse::<usize>() {
                if val > 0 {
                    cfg.task_queue.worker_count = val;
                }
            }
        }
        if let Ok(v) = std::env::var("ENGINE_BREAKER_COOLDOWN_MS") {
            if let Ok(val) = v.parse::<u64>() {
                if val > 0 {
                    cfg.breaker.cooldown = std::time::Duration::from_millis(val);
                }
            }
        }
        if let Ok(v) = std::env::var("ENGINE_AMM_FEE_BPS") {
            if let Ok(val) = v.parse::<u32>() {
                if val < 10_000 {
                    cfg.amm.fee_bps = val;
                }
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.journal_db_path, cfg.journal_db_path);
        assert_eq!(parsed.amm.fee_bps, cfg.amm.fee_bps);
        assert_eq!(parsed.task_queue.worker_count, cfg.task_queue.worker_count);
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let bad = r#"
            journal_db_path = "x.db"
            not_a_real_field = 1
        "#;
        assert!(toml::from_str::<EngineConfig>(bad).is_err());
    }

    #[test]
    fn unknown_key_in_nested_table_is_also_rejected() {
        let bad = r#"
            journal_db_path = "x.db"
            [amm]
            fee_bps = 10
            bogus = true
        "#;
        assert!(toml::from_str::<EngineConfig>(bad).is_err());
    }
}
