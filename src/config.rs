// =============================================================================
// Configuration Source — hot-reloadable engine settings with atomic save
// =============================================================================
//
// A single JSON document drives the whole engine: system-wide flags, the
// default grid strategy, and the enabled pair list (each optionally
// overriding the default strategy). The file is read on demand and
// mtime-watched for hot-reload — no filesystem-event dependency, just the
// same `mtime` comparison the original bot polled on every reconciliation
// cycle.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::StartMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_cycle_delay() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grids_quantity() -> u32 {
    4
}

fn default_grid_spread() -> f64 {
    1.0
}

fn default_amount_per_grid() -> f64 {
    20.0
}

fn default_days_keep() -> u32 {
    30
}

// =============================================================================
// GridStrategy
// =============================================================================

/// Tunable parameters for a symbol's grid (sizing, spacing, first-entry mode).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridStrategy {
    /// Number of levels maintained either side of price; must be even, ≥ 2.
    #[serde(default = "default_grids_quantity")]
    pub grids_quantity: u32,

    /// Per-step price delta as a percentage of the reference price.
    #[serde(default = "default_grid_spread")]
    pub grid_spread: f64,

    /// Quote-denominated amount committed per level.
    #[serde(default = "default_amount_per_grid")]
    pub amount_per_grid: f64,

    /// Whether the ladder trails upward as price breaks above the top level.
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,

    /// First-time behaviour when a symbol has never been set up.
    #[serde(default)]
    pub start_mode: StartMode,
}

fn default_true() -> bool {
    true
}

impl Default for GridStrategy {
    fn default() -> Self {
        Self {
            grids_quantity: default_grids_quantity(),
            grid_spread: default_grid_spread(),
            amount_per_grid: default_amount_per_grid(),
            trailing_enabled: true,
            start_mode: StartMode::default(),
        }
    }
}

impl GridStrategy {
    /// Validate the invariants spec.md's Data Model table requires:
    /// `N ≥ 2 and even; s > 0`.
    pub fn validate(&self) -> Result<()> {
        if self.grids_quantity < 2 || self.grids_quantity % 2 != 0 {
            anyhow::bail!(
                "grids_quantity must be even and >= 2, got {}",
                self.grids_quantity
            );
        }
        if self.grid_spread <= 0.0 {
            anyhow::bail!("grid_spread must be > 0, got {}", self.grid_spread);
        }
        Ok(())
    }
}

/// A partial strategy override attached to one pair. Any field left `None`
/// falls back to the system's `default_strategy`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StrategyOverride {
    #[serde(default)]
    pub grids_quantity: Option<u32>,
    #[serde(default)]
    pub grid_spread: Option<f64>,
    #[serde(default)]
    pub amount_per_grid: Option<f64>,
    #[serde(default)]
    pub trailing_enabled: Option<bool>,
    #[serde(default)]
    pub start_mode: Option<StartMode>,
}

impl StrategyOverride {
    /// Merge this override on top of `default`, field by field.
    pub fn apply(&self, default: &GridStrategy) -> GridStrategy {
        GridStrategy {
            grids_quantity: self.grids_quantity.unwrap_or(default.grids_quantity),
            grid_spread: self.grid_spread.unwrap_or(default.grid_spread),
            amount_per_grid: self.amount_per_grid.unwrap_or(default.amount_per_grid),
            trailing_enabled: self.trailing_enabled.unwrap_or(default.trailing_enabled),
            start_mode: self.start_mode.unwrap_or(default.start_mode),
        }
    }
}

// =============================================================================
// SystemConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub use_testnet: bool,

    /// Seconds between full reconciliation passes.
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub telegram_enabled: bool,

    /// Retention window for `prune_old_data`.
    #[serde(default = "default_days_keep")]
    pub days_keep: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            use_testnet: false,
            cycle_delay: default_cycle_delay(),
            log_level: default_log_level(),
            telegram_enabled: false,
            days_keep: default_days_keep(),
        }
    }
}

// =============================================================================
// PairConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub symbol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: Option<StrategyOverride>,
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub default_strategy: GridStrategy,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            default_strategy: GridStrategy::default(),
            pairs: vec![PairConfig {
                symbol: "BTCUSDT".to_string(),
                enabled: true,
                strategy: None,
            }],
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = config.pairs.len(),
            use_testnet = config.system.use_testnet,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "configuration saved (atomic)");
        Ok(())
    }

    /// Resolve the effective `GridStrategy` for `pair`, merging any override
    /// onto `self.default_strategy`.
    pub fn strategy_for(&self, pair: &PairConfig) -> GridStrategy {
        match &pair.strategy {
            Some(ov) => ov.apply(&self.default_strategy),
            None => self.default_strategy,
        }
    }

    pub fn enabled_symbols(&self) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.symbol.clone())
            .collect()
    }
}

// =============================================================================
// Hot-reload watcher
// =============================================================================

/// Tracks a config file's last-seen mtime so the engine can detect changes
/// without re-parsing on every cycle.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_mtime: None,
        }
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok()?.modified().ok()
    }

    /// Initialize the watcher's baseline mtime without returning a config.
    /// Call once at startup after the initial `AppConfig::load`.
    pub fn mark_seen(&mut self) {
        self.last_mtime = self.file_mtime();
    }

    /// If the file's mtime changed since the last check, reparse and return
    /// the new config. On a parse error, the last good configuration is kept
    /// and the error is logged — the config-parse-error policy in spec §7.
    pub fn check_and_reload(&mut self) -> Option<AppConfig> {
        let mtime = self.file_mtime()?;
        if Some(mtime) == self.last_mtime {
            return None;
        }

        match AppConfig::load(&self.path) {
            Ok(cfg) => {
                self.last_mtime = Some(mtime);
                Some(cfg)
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "config reload failed, keeping last good configuration");
                // Advance the watermark anyway so we don't spin re-parsing a
                // known-bad file every cycle until it's fixed.
                self.last_mtime = Some(mtime);
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.default_strategy.grids_quantity, 4);
        assert!((cfg.default_strategy.grid_spread - 1.0).abs() < f64::EPSILON);
        assert!(cfg.default_strategy.trailing_enabled);
        assert_eq!(cfg.system.cycle_delay, 10);
        assert_eq!(cfg.system.days_keep, 30);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.default_strategy.grids_quantity, 4);
        assert!(cfg.pairs.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "pairs": [{"symbol": "ETHUSDT"}] }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.pairs.len(), 1);
        assert_eq!(cfg.pairs[0].symbol, "ETHUSDT");
        assert!(cfg.pairs[0].enabled);
        assert_eq!(cfg.default_strategy.amount_per_grid, 20.0);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.pairs.len(), cfg2.pairs.len());
        assert_eq!(
            cfg.default_strategy.grids_quantity,
            cfg2.default_strategy.grids_quantity
        );
    }

    #[test]
    fn strategy_override_merges_only_present_fields() {
        let cfg = AppConfig::default();
        let pair = PairConfig {
            symbol: "ETHUSDT".to_string(),
            enabled: true,
            strategy: Some(StrategyOverride {
                grid_spread: Some(2.5),
                ..Default::default()
            }),
        };
        let strategy = cfg.strategy_for(&pair);
        assert_eq!(strategy.grid_spread, 2.5);
        assert_eq!(strategy.grids_quantity, cfg.default_strategy.grids_quantity);
    }

    #[test]
    fn grid_strategy_validation_rejects_odd_quantity() {
        let mut s = GridStrategy::default();
        s.grids_quantity = 5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn grid_strategy_validation_rejects_nonpositive_spread() {
        let mut s = GridStrategy::default();
        s.grid_spread = 0.0;
        assert!(s.validate().is_err());
    }
}
