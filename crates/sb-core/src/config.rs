//! Engine configuration with validated defaults.
//!
//! Everything here is plain data; the service layer deserializes its TOML
//! into these types at startup. Capacities and tables default to the values
//! the backpressure and load contracts are specified against.

use crate::vocab::AttributeVocabulary;
use sb_protocol::{AttentionLevel, SystemLoadLevel};
use std::time::Duration;

/// Stock attribute-id vocabulary; deployments override it in config.
pub const DEFAULT_VOCABULARY: [&str; 12] = [
    "heartrate",
    "hr",
    "ecg",
    "imu",
    "geolocation",
    "skeleton",
    "button",
    "pressure",
    "temperature",
    "battery",
    "humidity",
    "luminosity",
];

/// Weights for combining the load-pulse components. Normalized before use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseWeights {
    pub cpu: f64,
    pub bus: f64,
    pub mailbox: f64,
    pub mem: f64,
}

impl Default for PulseWeights {
    fn default() -> Self {
        Self {
            cpu: 0.45,
            bus: 0.30,
            mailbox: 0.15,
            mem: 0.10,
        }
    }
}

impl PulseWeights {
    /// Scale so the components sum to 1.0. A degenerate all-zero table falls
    /// back to the defaults.
    pub fn normalized(self) -> Self {
        let sum = self.cpu + self.bus + self.mailbox + self.mem;
        if sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            cpu: self.cpu / sum,
            bus: self.bus / sum,
            mailbox: self.mailbox / sum,
            mem: self.mem / sum,
        }
    }
}

/// Score thresholds mapping the combined pulse to a load level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadThresholds {
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            elevated: 0.70,
            high: 0.85,
            critical: 0.95,
        }
    }
}

/// Backpressure multiplier per load level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadMultipliers {
    pub normal: f64,
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LoadMultipliers {
    fn default() -> Self {
        Self {
            normal: 1.0,
            elevated: 1.5,
            high: 3.0,
            critical: 5.0,
        }
    }
}

impl LoadMultipliers {
    pub fn for_level(&self, level: SystemLoadLevel) -> f64 {
        match level {
            SystemLoadLevel::Normal => self.normal,
            SystemLoadLevel::Elevated => self.elevated,
            SystemLoadLevel::High => self.high,
            SystemLoadLevel::Critical => self.critical,
        }
    }
}

/// Base batch window and size per attention level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub window_ms: u64,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindowMap {
    pub high: BatchWindow,
    pub medium: BatchWindow,
    pub low: BatchWindow,
    pub none: BatchWindow,
}

impl Default for BatchWindowMap {
    fn default() -> Self {
        Self {
            high: BatchWindow {
                window_ms: 100,
                batch_size: 1,
            },
            medium: BatchWindow {
                window_ms: 500,
                batch_size: 5,
            },
            low: BatchWindow {
                window_ms: 2000,
                batch_size: 10,
            },
            none: BatchWindow {
                window_ms: 5000,
                batch_size: 20,
            },
        }
    }
}

impl BatchWindowMap {
    pub fn for_level(&self, level: AttentionLevel) -> BatchWindow {
        match level {
            AttentionLevel::High => self.high,
            AttentionLevel::Medium => self.medium,
            AttentionLevel::Low => self.low,
            AttentionLevel::None => self.none,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    /// Capacity of bus subscriber mailboxes and actor inboxes.
    pub mailbox_capacity: usize,
    pub pulse_weights: PulseWeights,
    pub load_thresholds: LoadThresholds,
    pub load_multipliers: LoadMultipliers,
    pub batch_windows: BatchWindowMap,
    pub vocabulary: AttributeVocabulary,

    /// Delay between last release and actor teardown (reconnect coalescing).
    pub release_grace: Duration,
    /// Sliding window for counting actor restarts.
    pub restart_window: Duration,
    pub max_restarts: u32,
    pub poison_duration: Duration,
    pub restart_base_delay: Duration,

    pub attention_tick: Duration,
    /// Observer records with no signals and a heartbeat older than this are
    /// evicted.
    pub observer_idle_timeout: Duration,

    pub load_sample_interval: Duration,
    pub cpu_smoothing_samples: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 500,
            warm_capacity: 10_000,
            mailbox_capacity: 1024,
            pulse_weights: PulseWeights::default(),
            load_thresholds: LoadThresholds::default(),
            load_multipliers: LoadMultipliers::default(),
            batch_windows: BatchWindowMap::default(),
            vocabulary: AttributeVocabulary::default(),
            release_grace: Duration::from_millis(50),
            restart_window: Duration::from_secs(10),
            max_restarts: 5,
            poison_duration: Duration::from_secs(30),
            restart_base_delay: Duration::from_millis(100),
            attention_tick: Duration::from_secs(1),
            observer_idle_timeout: Duration::from_secs(60),
            load_sample_interval: Duration::from_secs(2),
            cpu_smoothing_samples: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract_tables() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.hot_capacity, 500);
        assert_eq!(cfg.warm_capacity, 10_000);
        assert_eq!(cfg.mailbox_capacity, 1024);

        let w = cfg.batch_windows;
        assert_eq!((w.high.window_ms, w.high.batch_size), (100, 1));
        assert_eq!((w.medium.window_ms, w.medium.batch_size), (500, 5));
        assert_eq!((w.low.window_ms, w.low.batch_size), (2000, 10));
        assert_eq!((w.none.window_ms, w.none.batch_size), (5000, 20));

        let m = cfg.load_multipliers;
        assert_eq!(m.for_level(SystemLoadLevel::Normal), 1.0);
        assert_eq!(m.for_level(SystemLoadLevel::Elevated), 1.5);
        assert_eq!(m.for_level(SystemLoadLevel::High), 3.0);
        assert_eq!(m.for_level(SystemLoadLevel::Critical), 5.0);
    }

    #[test]
    fn pulse_weights_normalize_to_unit_sum() {
        let w = PulseWeights {
            cpu: 2.0,
            bus: 1.0,
            mailbox: 0.5,
            mem: 0.5,
        }
        .normalized();
        let sum = w.cpu + w.bus + w.mailbox + w.mem;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((w.cpu - 0.5).abs() < 1e-9);
    }

    #[test]
    fn degenerate_weights_fall_back_to_defaults() {
        let w = PulseWeights {
            cpu: 0.0,
            bus: 0.0,
            mailbox: 0.0,
            mem: 0.0,
        }
        .normalized();
        assert_eq!(w, PulseWeights::default());
    }
}
