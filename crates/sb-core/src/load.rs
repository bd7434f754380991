//! System-load monitoring.
//!
//! Every sample interval the monitor reads CPU and memory through a
//! [`SystemSampler`], measures bus and actor-inbox pressure directly, and
//! combines the four with the configured weights. The resulting level is
//! cached (single writer, many readers) and broadcast on `system:load`
//! only when it changes.

use crate::bus::{BusEvent, MessageBus, topics};
use crate::config::{CoreConfig, LoadThresholds, PulseWeights};
use crate::registry::SensorRegistry;
use sb_protocol::SystemLoadLevel;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Inboxes sampled per pass for mailbox pressure.
const MAILBOX_SAMPLE: usize = 20;

/// A full load observation.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct LoadState {
    pub cpu_util: f64,
    pub bus_pressure: f64,
    pub mailbox_pressure: f64,
    pub mem_pressure: f64,
    pub level: SystemLoadLevel,
    pub multiplier: f64,
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

/// Source of CPU and memory readings. The default implementation reads
/// `/proc`; tests inject fixed values.
pub trait SystemSampler: Send + 'static {
    /// Instantaneous process CPU utilization, 0..1 across all cores.
    fn cpu_total(&mut self) -> f64;
    /// Memory pressure, 0..1.
    fn mem_pressure(&mut self) -> f64;
}

/// `/proc`-backed sampler. Off Linux it reports zero rather than guessing.
#[derive(Default)]
pub struct ProcSampler {
    last_cpu: Option<(u64, std::time::Instant)>,
}

/// Kernel USER_HZ for /proc/self/stat tick fields.
#[cfg(target_os = "linux")]
const USER_HZ: f64 = 100.0;

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The comm field may contain spaces; skip past its closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(target_os = "linux")]
fn read_meminfo_kb(key: &str, text: &str) -> Option<f64> {
    text.lines()
        .find(|l| l.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

impl SystemSampler for ProcSampler {
    #[cfg(target_os = "linux")]
    fn cpu_total(&mut self) -> f64 {
        let Some(ticks) = read_cpu_ticks() else {
            return 0.0;
        };
        let now = std::time::Instant::now();
        let util = match self.last_cpu {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                let cores = std::thread::available_parallelism()
                    .map_or(1.0, |n| n.get() as f64);
                if elapsed > 0.0 {
                    let busy = ticks.saturating_sub(prev_ticks) as f64 / USER_HZ;
                    (busy / (elapsed * cores)).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((ticks, now));
        util
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_total(&mut self) -> f64 {
        let _ = &self.last_cpu;
        0.0
    }

    #[cfg(target_os = "linux")]
    fn mem_pressure(&mut self) -> f64 {
        let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
            return 0.0;
        };
        let Some(total) = read_meminfo_kb("MemTotal", &text) else {
            return 0.0;
        };
        if total <= 0.0 {
            return 0.0;
        }
        if let Some(available) = read_meminfo_kb("MemAvailable", &text) {
            return (1.0 - available / total).clamp(0.0, 1.0);
        }
        // Process-ratio heuristic when MemAvailable is absent.
        let resident_kb = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| s.split_whitespace().nth(1)?.parse::<f64>().ok())
            .map_or(0.0, |pages| pages * 4.0);
        (resident_kb / total).clamp(0.0, 1.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn mem_pressure(&mut self) -> f64 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Normalization and combination
// ---------------------------------------------------------------------------

/// Bus mailbox depths -> pressure.
pub fn normalize_bus_pressure(max: usize, mean: f64) -> f64 {
    if max > 500 {
        1.0
    } else if max > 200 {
        0.85
    } else if max > 50 {
        0.7
    } else if mean > 20.0 {
        0.5
    } else if mean > 5.0 {
        0.3
    } else {
        mean / 50.0
    }
}

/// Actor inbox depths -> pressure.
pub fn normalize_mailbox_pressure(max: usize, mean: f64) -> f64 {
    if max > 1000 {
        1.0
    } else if max > 500 {
        0.9
    } else if max > 100 {
        0.75
    } else if mean > 50.0 {
        0.6
    } else if mean > 20.0 {
        0.4
    } else {
        mean / 100.0
    }
}

/// Weighted pulse score, 0..1.
pub fn combine(weights: PulseWeights, cpu: f64, bus: f64, mailbox: f64, mem: f64) -> f64 {
    let w = weights.normalized();
    (w.cpu * cpu + w.bus * bus + w.mailbox * mailbox + w.mem * mem).clamp(0.0, 1.0)
}

pub fn level_for(score: f64, thresholds: &LoadThresholds) -> SystemLoadLevel {
    if score >= thresholds.critical {
        SystemLoadLevel::Critical
    } else if score >= thresholds.high {
        SystemLoadLevel::High
    } else if score >= thresholds.elevated {
        SystemLoadLevel::Elevated
    } else {
        SystemLoadLevel::Normal
    }
}

// ---------------------------------------------------------------------------
// Handle and task
// ---------------------------------------------------------------------------

/// Read access to the latest load observation.
#[derive(Clone)]
pub struct LoadHandle {
    cache: Arc<RwLock<LoadState>>,
}

impl LoadHandle {
    pub fn current(&self) -> LoadState {
        self.cache.read().expect("load cache poisoned").clone()
    }
}

/// Start the monitor task.
pub fn spawn(
    bus: MessageBus,
    registry: SensorRegistry,
    cfg: Arc<CoreConfig>,
    sampler: Box<dyn SystemSampler>,
) -> LoadHandle {
    let cache = Arc::new(RwLock::new(LoadState {
        multiplier: cfg.load_multipliers.normal,
        ..LoadState::default()
    }));
    let handle = LoadHandle {
        cache: Arc::clone(&cache),
    };
    tokio::spawn(run(bus, registry, cfg, sampler, cache));
    handle
}

async fn run(
    bus: MessageBus,
    registry: SensorRegistry,
    cfg: Arc<CoreConfig>,
    mut sampler: Box<dyn SystemSampler>,
    cache: Arc<RwLock<LoadState>>,
) {
    let mut cpu_window: VecDeque<f64> = VecDeque::new();
    let mut interval = tokio::time::interval(cfg.load_sample_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        cpu_window.push_back(sampler.cpu_total().clamp(0.0, 1.0));
        while cpu_window.len() > cfg.cpu_smoothing_samples.max(1) {
            cpu_window.pop_front();
        }
        let cpu = cpu_window.iter().sum::<f64>() / cpu_window.len() as f64;

        let bus_depth = bus.depth_stats();
        let bus_pressure = normalize_bus_pressure(bus_depth.max, bus_depth.mean);

        // Iteration order of the actor table is effectively random; the
        // first MAILBOX_SAMPLE entries are an unbiased-enough sample.
        let depths = registry.inbox_depths();
        let sampled: Vec<usize> = depths.into_iter().take(MAILBOX_SAMPLE).collect();
        let inbox_max = sampled.iter().copied().max().unwrap_or(0);
        let inbox_mean = if sampled.is_empty() {
            0.0
        } else {
            sampled.iter().sum::<usize>() as f64 / sampled.len() as f64
        };
        let mailbox_pressure = normalize_mailbox_pressure(inbox_max, inbox_mean);

        let mem_pressure = sampler.mem_pressure().clamp(0.0, 1.0);

        let score = combine(cfg.pulse_weights, cpu, bus_pressure, mailbox_pressure, mem_pressure);
        let level = level_for(score, &cfg.load_thresholds);
        let state = LoadState {
            cpu_util: cpu,
            bus_pressure,
            mailbox_pressure,
            mem_pressure,
            level,
            multiplier: cfg.load_multipliers.for_level(level),
        };

        let level_changed = {
            let mut cached = cache.write().expect("load cache poisoned");
            let changed = cached.level != state.level;
            *cached = state.clone();
            changed
        };
        if level_changed {
            tracing::info!(?level, score, "system load level changed");
            bus.publish(topics::SYSTEM_LOAD, BusEvent::SystemLoadChanged { state });
        }
    }
}
