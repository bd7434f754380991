//! Service configuration loading.
//!
//! TOML is the sole config source; `BIND_ADDR` and `LOG_LEVEL` environment
//! variables override at the edges. Every section is optional: an absent
//! file yields the stock engine defaults with an empty token table.
//!
//! # Layout
//! ```toml
//! bind = "0.0.0.0:8080"
//!
//! [engine]
//! hot_capacity = 500
//! warm_capacity = 10000
//! mailbox_capacity = 1024
//! attribute_vocabulary = ["heartrate", "ecg"]
//!
//! [engine.pulse_weights]
//! cpu = 0.45
//! bus = 0.30
//! mailbox = 0.15
//! mem = 0.10
//!
//! [[auth.tokens]]
//! subject = "strap-1"
//! sha256 = "…64 hex chars…"
//!
//! [cold_storage]
//! jsonl_path = "/var/lib/ingestd/cold.jsonl"
//! ```

use sb_core::config::{
    BatchWindow, BatchWindowMap, CoreConfig, LoadMultipliers, LoadThresholds, PulseWeights,
};
use sb_core::vocab::AttributeVocabulary;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One accepted bearer token, stored as its SHA-256 digest.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub subject: String,
    pub sha256: String,
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct IngestdConfig {
    pub bind: String,
    pub core: CoreConfig,
    pub tokens: Vec<TokenEntry>,
    pub cold_storage_path: Option<PathBuf>,
}

impl Default for IngestdConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            core: CoreConfig::default(),
            tokens: Vec::new(),
            cold_storage_path: None,
        }
    }
}

impl IngestdConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        raw.resolve()
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    engine: Option<RawEngine>,
    auth: Option<RawAuth>,
    cold_storage: Option<RawColdStorage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEngine {
    hot_capacity: Option<usize>,
    warm_capacity: Option<usize>,
    mailbox_capacity: Option<usize>,
    attribute_vocabulary: Option<Vec<String>>,
    pulse_weights: Option<RawWeights>,
    load_thresholds: Option<RawThresholds>,
    load_multipliers: Option<RawMultipliers>,
    batch_windows: Option<RawBatchWindows>,
}

#[derive(Debug, Deserialize)]
struct RawWeights {
    cpu: f64,
    bus: f64,
    mailbox: f64,
    mem: f64,
}

#[derive(Debug, Deserialize)]
struct RawThresholds {
    elevated: f64,
    high: f64,
    critical: f64,
}

#[derive(Debug, Deserialize)]
struct RawMultipliers {
    normal: f64,
    elevated: f64,
    high: f64,
    critical: f64,
}

#[derive(Debug, Deserialize)]
struct RawBatchWindow {
    window_ms: u64,
    batch_size: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawBatchWindows {
    high: Option<RawBatchWindow>,
    medium: Option<RawBatchWindow>,
    low: Option<RawBatchWindow>,
    none: Option<RawBatchWindow>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuth {
    tokens: Option<Vec<TokenEntry>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawColdStorage {
    jsonl_path: Option<PathBuf>,
}

impl RawConfig {
    fn resolve(self) -> Result<IngestdConfig, ConfigError> {
        let mut core = CoreConfig::default();

        if let Some(engine) = self.engine {
            if let Some(v) = engine.hot_capacity {
                if v == 0 {
                    return Err(ConfigError::Invalid("hot_capacity must be > 0".to_owned()));
                }
                core.hot_capacity = v;
            }
            if let Some(v) = engine.warm_capacity {
                core.warm_capacity = v;
            }
            if let Some(v) = engine.mailbox_capacity {
                if v == 0 {
                    return Err(ConfigError::Invalid(
                        "mailbox_capacity must be > 0".to_owned(),
                    ));
                }
                core.mailbox_capacity = v;
            }
            if let Some(vocab) = engine.attribute_vocabulary {
                if vocab.is_empty() {
                    return Err(ConfigError::Invalid(
                        "attribute_vocabulary must not be empty".to_owned(),
                    ));
                }
                core.vocabulary = AttributeVocabulary::new(vocab);
            }
            if let Some(w) = engine.pulse_weights {
                if [w.cpu, w.bus, w.mailbox, w.mem].iter().any(|v| *v < 0.0) {
                    return Err(ConfigError::Invalid(
                        "pulse_weights must be non-negative".to_owned(),
                    ));
                }
                core.pulse_weights = PulseWeights {
                    cpu: w.cpu,
                    bus: w.bus,
                    mailbox: w.mailbox,
                    mem: w.mem,
                };
            }
            if let Some(t) = engine.load_thresholds {
                if !(t.elevated <= t.high && t.high <= t.critical) {
                    return Err(ConfigError::Invalid(
                        "load_thresholds must be ordered elevated <= high <= critical".to_owned(),
                    ));
                }
                core.load_thresholds = LoadThresholds {
                    elevated: t.elevated,
                    high: t.high,
                    critical: t.critical,
                };
            }
            if let Some(m) = engine.load_multipliers {
                core.load_multipliers = LoadMultipliers {
                    normal: m.normal,
                    elevated: m.elevated,
                    high: m.high,
                    critical: m.critical,
                };
            }
            if let Some(b) = engine.batch_windows {
                let mut windows = BatchWindowMap::default();
                for (slot, raw) in [
                    (&mut windows.high, b.high),
                    (&mut windows.medium, b.medium),
                    (&mut windows.low, b.low),
                    (&mut windows.none, b.none),
                ] {
                    if let Some(raw) = raw {
                        *slot = BatchWindow {
                            window_ms: raw.window_ms,
                            batch_size: raw.batch_size,
                        };
                    }
                }
                core.batch_windows = windows;
            }
        }

        Ok(IngestdConfig {
            bind: self.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            core,
            tokens: self.auth.and_then(|a| a.tokens).unwrap_or_default(),
            cold_storage_path: self.cold_storage.and_then(|c| c.jsonl_path),
        })
    }
}
