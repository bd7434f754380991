//! Observer attention tracking.
//!
//! One task owns every attention record, fed by a signal queue and a 1 s
//! tick. Levels are recomputed on each signal and each tick; changes are
//! published on `attention:<sensor_id>` and mirrored into a read-heavy
//! cache (single writer, many readers).

use crate::bus::{BusEvent, MessageBus, topics};
use crate::config::CoreConfig;
use sb_protocol::{AttentionLevel, BatteryState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;

/// Signals accepted by the tracker, keyed by sensor, attribute and observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttentionSignal {
    RegisterView {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    UnregisterView {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    RegisterHover {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    UnregisterHover {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    RegisterFocus {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    UnregisterFocus {
        sensor_id: String,
        attribute_id: String,
        observer_id: String,
    },
    PinSensor {
        sensor_id: String,
        observer_id: String,
    },
    UnpinSensor {
        sensor_id: String,
        observer_id: String,
    },
    ReportBattery {
        observer_id: String,
        state: BatteryState,
    },
    Heartbeat {
        observer_id: String,
    },
    /// The observer's session ended; all of its records are cleared.
    ObserverGone {
        observer_id: String,
    },
    /// A connector session for this sensor started; the tracker keeps the
    /// sensor's level current even when nobody watches it directly (the
    /// any-view-anywhere rule can rank it `low`).
    TrackSensor {
        sensor_id: String,
    },
    /// The connector session ended.
    UntrackSensor {
        sensor_id: String,
    },
}

// ---------------------------------------------------------------------------
// Tracker state (pure; the task below drives it)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ObserverRecord {
    views: HashSet<String>,
    hovers: HashSet<String>,
    focuses: HashSet<String>,
    pinned: bool,
}

impl ObserverRecord {
    fn is_empty(&self) -> bool {
        self.views.is_empty() && self.hovers.is_empty() && self.focuses.is_empty() && !self.pinned
    }
}

#[derive(Debug)]
struct ObserverInfo {
    battery: BatteryState,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct TrackerState {
    /// sensor_id -> observer_id -> record.
    sensors: HashMap<String, HashMap<String, ObserverRecord>>,
    observers: HashMap<String, ObserverInfo>,
    levels: HashMap<String, AttentionLevel>,
    /// Session refcounts of sensors whose level must stay current.
    tracked: HashMap<String, usize>,
}

impl TrackerState {
    /// Apply one signal; returns the sensors whose level needs recomputing.
    fn apply(&mut self, signal: AttentionSignal, now: Instant) -> Vec<String> {
        // Any signal from an observer counts as liveness.
        let observer_id = match &signal {
            AttentionSignal::RegisterView { observer_id, .. }
            | AttentionSignal::UnregisterView { observer_id, .. }
            | AttentionSignal::RegisterHover { observer_id, .. }
            | AttentionSignal::UnregisterHover { observer_id, .. }
            | AttentionSignal::RegisterFocus { observer_id, .. }
            | AttentionSignal::UnregisterFocus { observer_id, .. }
            | AttentionSignal::PinSensor { observer_id, .. }
            | AttentionSignal::UnpinSensor { observer_id, .. }
            | AttentionSignal::ReportBattery { observer_id, .. }
            | AttentionSignal::Heartbeat { observer_id }
            | AttentionSignal::ObserverGone { observer_id } => Some(observer_id.clone()),
            AttentionSignal::TrackSensor { .. } | AttentionSignal::UntrackSensor { .. } => None,
        };
        if let Some(observer_id) = observer_id
            && !matches!(signal, AttentionSignal::ObserverGone { .. })
        {
            self.observers
                .entry(observer_id.clone())
                .or_insert_with(|| ObserverInfo {
                    battery: BatteryState::Normal,
                    last_heartbeat: now,
                })
                .last_heartbeat = now;
        }

        match signal {
            AttentionSignal::RegisterView {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.views.insert(attribute_id);
            }),
            AttentionSignal::UnregisterView {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.views.remove(&attribute_id);
            }),
            AttentionSignal::RegisterHover {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.hovers.insert(attribute_id);
            }),
            AttentionSignal::UnregisterHover {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.hovers.remove(&attribute_id);
            }),
            AttentionSignal::RegisterFocus {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.focuses.insert(attribute_id);
            }),
            AttentionSignal::UnregisterFocus {
                sensor_id,
                attribute_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.focuses.remove(&attribute_id);
            }),
            AttentionSignal::PinSensor {
                sensor_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.pinned = true;
            }),
            AttentionSignal::UnpinSensor {
                sensor_id,
                observer_id,
            } => self.edit(&sensor_id, &observer_id, |r| {
                r.pinned = false;
            }),
            AttentionSignal::ReportBattery { observer_id, state } => {
                if let Some(info) = self.observers.get_mut(&observer_id) {
                    info.battery = state;
                }
                // Battery affects every sensor this observer touches, plus
                // the global any-view rule.
                self.sensors_touched_by(&observer_id)
            }
            AttentionSignal::Heartbeat { .. } => Vec::new(),
            AttentionSignal::ObserverGone { observer_id } => {
                for records in self.sensors.values_mut() {
                    records.remove(&observer_id);
                }
                self.sensors.retain(|_, records| !records.is_empty());
                self.observers.remove(&observer_id);
                // Losing the last view anywhere can drop other sensors
                // from low to none.
                self.all_known_sensors()
            }
            AttentionSignal::TrackSensor { sensor_id } => {
                *self.tracked.entry(sensor_id.clone()).or_insert(0) += 1;
                vec![sensor_id]
            }
            AttentionSignal::UntrackSensor { sensor_id } => {
                if let Some(count) = self.tracked.get_mut(&sensor_id) {
                    *count -= 1;
                    if *count == 0 {
                        self.tracked.remove(&sensor_id);
                    }
                }
                vec![sensor_id]
            }
        }
    }

    fn edit<F>(&mut self, sensor_id: &str, observer_id: &str, f: F) -> Vec<String>
    where
        F: FnOnce(&mut ObserverRecord),
    {
        let records = self.sensors.entry(sensor_id.to_owned()).or_default();
        let record = records.entry(observer_id.to_owned()).or_default();
        f(record);
        if record.is_empty() {
            records.remove(observer_id);
            if records.is_empty() {
                self.sensors.remove(sensor_id);
            }
        }
        // A view edit can flip the global any-view rule for every sensor.
        self.all_sensor_ids_with(sensor_id)
    }

    fn sensors_touched_by(&self, observer_id: &str) -> Vec<String> {
        self.sensors
            .iter()
            .filter(|(_, records)| records.contains_key(observer_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn all_sensor_ids_with(&self, extra: &str) -> Vec<String> {
        let mut ids = self.all_known_sensors();
        if !ids.iter().any(|id| id == extra) {
            ids.push(extra.to_owned());
        }
        ids
    }

    fn any_view_anywhere(&self) -> bool {
        self.sensors
            .values()
            .any(|records| records.values().any(|r| !r.views.is_empty()))
    }

    /// Derive the level for one sensor from current records.
    fn compute_level(&self, sensor_id: &str) -> AttentionLevel {
        let mut focused_count = 0usize;
        let mut viewing: Vec<&str> = Vec::new();

        if let Some(records) = self.sensors.get(sensor_id) {
            for (observer_id, record) in records {
                if record.pinned {
                    // Pinned forces high regardless of visibility or battery.
                    return AttentionLevel::High;
                }
                if !record.focuses.is_empty() || !record.hovers.is_empty() {
                    focused_count += 1;
                }
                if !record.views.is_empty() {
                    viewing.push(observer_id);
                }
            }
        }

        let base = if focused_count >= 1 && !viewing.is_empty() {
            AttentionLevel::High
        } else if !viewing.is_empty() {
            AttentionLevel::Medium
        } else if self.any_view_anywhere() {
            AttentionLevel::Low
        } else {
            AttentionLevel::None
        };

        if viewing.is_empty() {
            return base;
        }
        let batteries: Vec<BatteryState> = viewing
            .iter()
            .map(|o| {
                self.observers
                    .get(*o)
                    .map_or(BatteryState::Normal, |i| i.battery)
            })
            .collect();
        if batteries.contains(&BatteryState::Critical) {
            base.downgrade(2)
        } else if batteries.iter().all(|b| *b == BatteryState::Low) {
            base.downgrade(1)
        } else {
            base
        }
    }

    /// Recompute one sensor; `Some(level)` when the level changed.
    fn recompute(&mut self, sensor_id: &str) -> Option<AttentionLevel> {
        let level = self.compute_level(sensor_id);
        let previous = self
            .levels
            .get(sensor_id)
            .copied()
            .unwrap_or(AttentionLevel::None);
        if level == AttentionLevel::None
            && !self.sensors.contains_key(sensor_id)
            && !self.tracked.contains_key(sensor_id)
        {
            self.levels.remove(sensor_id);
        } else {
            self.levels.insert(sensor_id.to_owned(), level);
        }
        (level != previous).then_some(level)
    }

    /// Evict observers that fell silent with nothing registered or whose
    /// heartbeat went stale. Returns the sensors affected.
    fn evict_stale(&mut self, idle_timeout: std::time::Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .observers
            .iter()
            .filter(|(observer_id, info)| {
                let idle = now.duration_since(info.last_heartbeat) >= idle_timeout;
                let empty_everywhere = self
                    .sensors
                    .values()
                    .all(|records| records.get(*observer_id).is_none_or(ObserverRecord::is_empty));
                idle && empty_everywhere
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut affected = Vec::new();
        for observer_id in stale {
            affected.extend(self.sensors_touched_by(&observer_id));
            for records in self.sensors.values_mut() {
                records.remove(&observer_id);
            }
            self.observers.remove(&observer_id);
        }
        self.sensors.retain(|_, records| !records.is_empty());
        affected
    }

    /// Sensors with records, a cached level, or a tracking session.
    fn all_known_sensors(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.keys().cloned().collect();
        for id in self.levels.keys().chain(self.tracked.keys()) {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Handle and task
// ---------------------------------------------------------------------------

/// Cloneable front to the tracker task.
#[derive(Clone)]
pub struct AttentionHandle {
    tx: mpsc::Sender<AttentionSignal>,
    cache: Arc<RwLock<HashMap<String, AttentionLevel>>>,
    observer_count: Arc<AtomicUsize>,
}

impl AttentionHandle {
    /// Enqueue a signal. Non-blocking; a saturated tracker drops signals.
    pub fn signal(&self, signal: AttentionSignal) {
        if self.tx.try_send(signal).is_err() {
            tracing::warn!("attention tracker saturated, signal dropped");
        }
    }

    /// Read-heavy cached lookup of a sensor's current level.
    pub fn get_sensor_attention_level(&self, sensor_id: &str) -> AttentionLevel {
        self.cache
            .read()
            .expect("attention cache poisoned")
            .get(sensor_id)
            .copied()
            .unwrap_or_default()
    }

    /// Observers with any live record.
    pub fn observer_count(&self) -> usize {
        self.observer_count.load(Ordering::Relaxed)
    }
}

/// Start the tracker task.
pub fn spawn(bus: MessageBus, cfg: Arc<CoreConfig>) -> AttentionHandle {
    let (tx, rx) = mpsc::channel(1024);
    let cache = Arc::new(RwLock::new(HashMap::new()));
    let observer_count = Arc::new(AtomicUsize::new(0));
    let handle = AttentionHandle {
        tx,
        cache: Arc::clone(&cache),
        observer_count: Arc::clone(&observer_count),
    };
    tokio::spawn(run(bus, cfg, rx, cache, observer_count));
    handle
}

async fn run(
    bus: MessageBus,
    cfg: Arc<CoreConfig>,
    mut rx: mpsc::Receiver<AttentionSignal>,
    cache: Arc<RwLock<HashMap<String, AttentionLevel>>>,
    observer_count: Arc<AtomicUsize>,
) {
    let mut state = TrackerState::default();
    let mut tick = tokio::time::interval(cfg.attention_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let affected = tokio::select! {
            signal = rx.recv() => match signal {
                Some(signal) => state.apply(signal, Instant::now()),
                None => break,
            },
            _ = tick.tick() => {
                let mut affected = state.evict_stale(cfg.observer_idle_timeout, Instant::now());
                affected.extend(state.all_known_sensors());
                affected
            }
        };

        for sensor_id in affected {
            if let Some(level) = state.recompute(&sensor_id) {
                cache
                    .write()
                    .expect("attention cache poisoned")
                    .insert(sensor_id.clone(), level);
                bus.publish(
                    &topics::attention(&sensor_id),
                    BusEvent::AttentionChanged {
                        sensor_id: sensor_id.clone(),
                        level,
                    },
                );
                tracing::debug!(sensor_id = %sensor_id, ?level, "attention level changed");
            }
        }
        observer_count.store(state.observers.len(), Ordering::Relaxed);
    }
}
