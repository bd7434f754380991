//! Sensor registry and supervisor.
//!
//! `locate_or_create` is atomic under one mutex, so concurrent joins for
//! the same id always land on the same actor. Sessions are refcounted;
//! when the last one releases, teardown waits a grace interval (reconnect
//! coalescing) and only fires if nobody subscribed to the sensor's data
//! topic in the meantime.
//!
//! Supervision: the actor run loop executes under `catch_unwind` on a
//! persistent inbox. A panic restarts the actor with empty state after an
//! exponential backoff; more than `max_restarts` panics inside the sliding
//! window poison the id for `poison_duration`.

use crate::actor::{self, ActorContext, SensorActorHandle};
use crate::bus::{MessageBus, topics};
use crate::collab::ColdStorage;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::measurement::SensorMeta;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Backoff ceiling between restarts.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Restart policy
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum RestartDecision {
    Restart(Duration),
    Poison,
}

/// Sliding-window restart accounting with exponential backoff.
struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    base_delay: Duration,
    history: VecDeque<Instant>,
}

impl RestartTracker {
    fn new(max_restarts: u32, window: Duration, base_delay: Duration) -> Self {
        Self {
            max_restarts,
            window,
            base_delay,
            history: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) -> RestartDecision {
        self.history.push_back(now);
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        let count = self.history.len() as u32;
        if count > self.max_restarts {
            return RestartDecision::Poison;
        }
        let exp = count.saturating_sub(1).min(10);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        RestartDecision::Restart(delay.min(MAX_RESTART_DELAY))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ActorEntry {
    handle: SensorActorHandle,
    sessions: HashSet<String>,
    generation: u64,
}

struct RegistryInner {
    actors: HashMap<String, ActorEntry>,
    /// Poisoned ids and when the poison expires.
    poisoned: HashMap<String, Instant>,
    next_generation: u64,
}

/// Locates or creates the actor for a sensor id. Cheap to clone.
#[derive(Clone)]
pub struct SensorRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    ctx: ActorContext,
    cfg: Arc<CoreConfig>,
}

impl SensorRegistry {
    pub fn new(bus: MessageBus, cfg: Arc<CoreConfig>, sink: Arc<dyn ColdStorage>) -> Self {
        let ctx = ActorContext {
            bus,
            vocab: Arc::new(cfg.vocabulary.clone()),
            sink,
            hot_capacity: cfg.hot_capacity,
            warm_capacity: cfg.warm_capacity,
        };
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                actors: HashMap::new(),
                poisoned: HashMap::new(),
                next_generation: 1,
            })),
            ctx,
            cfg,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.ctx.bus
    }

    /// Return the existing actor for `sensor_id` or start one, registering
    /// `session_id` against it. Atomic: concurrent callers with the same id
    /// all receive the same handle.
    pub fn locate_or_create(
        &self,
        sensor_id: &str,
        meta: SensorMeta,
        session_id: &str,
    ) -> Result<SensorActorHandle, CoreError> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");

        if let Some(until) = inner.poisoned.get(sensor_id).copied() {
            if Instant::now() < until {
                return Err(CoreError::ActorPoisoned(sensor_id.to_owned()));
            }
            inner.poisoned.remove(sensor_id);
        }

        if let Some(entry) = inner.actors.get_mut(sensor_id) {
            entry.sessions.insert(session_id.to_owned());
            return Ok(entry.handle.clone());
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (handle, rx) = actor::channel(sensor_id, self.cfg.mailbox_capacity);
        inner.actors.insert(
            sensor_id.to_owned(),
            ActorEntry {
                handle: handle.clone(),
                sessions: HashSet::from([session_id.to_owned()]),
                generation,
            },
        );
        drop(inner);

        tracing::info!(sensor_id, "sensor actor created");
        tokio::spawn(supervise(
            self.clone(),
            sensor_id.to_owned(),
            meta,
            rx,
            generation,
        ));
        Ok(handle)
    }

    /// Look up a running actor without registering a session.
    pub fn locate(&self, sensor_id: &str) -> Option<SensorActorHandle> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .actors
            .get(sensor_id)
            .map(|e| e.handle.clone())
    }

    /// Drop one session's claim on the actor. When the last session is
    /// gone, teardown is scheduled after the grace interval and fires only
    /// if the data topic still has no subscribers.
    pub fn release(&self, sensor_id: &str, session_id: &str) {
        {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            let Some(entry) = inner.actors.get_mut(sensor_id) else {
                return;
            };
            entry.sessions.remove(session_id);
            if !entry.sessions.is_empty() {
                return;
            }
        }
        let registry = self.clone();
        let sensor_id = sensor_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(registry.cfg.release_grace).await;
            registry.finish_release(&sensor_id);
        });
    }

    fn finish_release(&self, sensor_id: &str) {
        let handle = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            let Some(entry) = inner.actors.get(sensor_id) else {
                return;
            };
            // A session reconnected during the grace interval, or an
            // observer is still listening: keep the actor.
            if !entry.sessions.is_empty()
                || self.ctx.bus.subscriber_count(&topics::data(sensor_id)) > 0
            {
                return;
            }
            let handle = entry.handle.clone();
            inner.actors.remove(sensor_id);
            handle
        };
        tracing::info!(sensor_id, "sensor actor released");
        handle.terminate();
    }

    fn poison(&self, sensor_id: &str, generation: u64) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner
            .actors
            .get(sensor_id)
            .is_some_and(|e| e.generation == generation)
        {
            inner.actors.remove(sensor_id);
        }
        inner
            .poisoned
            .insert(sensor_id.to_owned(), Instant::now() + self.cfg.poison_duration);
    }

    fn remove_if_generation(&self, sensor_id: &str, generation: u64) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner
            .actors
            .get(sensor_id)
            .is_some_and(|e| e.generation == generation)
        {
            inner.actors.remove(sensor_id);
        }
    }

    /// Active sensor ids.
    pub fn list(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .actors
            .keys()
            .cloned()
            .collect()
    }

    /// Inbox depth of every running actor, sampled by the load monitor.
    pub fn inbox_depths(&self) -> Vec<usize> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .actors
            .values()
            .map(|e| e.handle.inbox_depth())
            .collect()
    }

    /// Sessions currently registered for a sensor.
    pub fn session_count(&self, sensor_id: &str) -> usize {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .actors
            .get(sensor_id)
            .map_or(0, |e| e.sessions.len())
    }
}

/// Run the actor on its persistent inbox, restarting on panic per policy.
async fn supervise(
    registry: SensorRegistry,
    sensor_id: String,
    meta: SensorMeta,
    mut rx: mpsc::Receiver<actor::SensorCommand>,
    generation: u64,
) {
    let mut tracker = RestartTracker::new(
        registry.cfg.max_restarts,
        registry.cfg.restart_window,
        registry.cfg.restart_base_delay,
    );
    loop {
        let run = AssertUnwindSafe(actor::run(
            sensor_id.clone(),
            meta.clone(),
            &registry.ctx,
            &mut rx,
        ))
        .catch_unwind();
        match run.await {
            Ok(()) => break,
            Err(_panic) => match tracker.record(Instant::now()) {
                RestartDecision::Restart(delay) => {
                    tracing::warn!(
                        sensor_id = %sensor_id,
                        delay_ms = delay.as_millis() as u64,
                        "sensor actor crashed, restarting with empty state"
                    );
                    tokio::time::sleep(delay).await;
                }
                RestartDecision::Poison => {
                    tracing::error!(
                        sensor_id = %sensor_id,
                        "sensor actor exceeded restart budget, poisoning"
                    );
                    registry.poison(&sensor_id, generation);
                    return;
                }
            },
        }
    }
    registry.remove_if_generation(&sensor_id, generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NoopColdStorage;
    use crate::measurement::Measurement;
    use serde_json::json;

    fn registry() -> SensorRegistry {
        let cfg = CoreConfig {
            release_grace: Duration::from_millis(50),
            ..CoreConfig::default()
        };
        SensorRegistry::new(MessageBus::new(64), Arc::new(cfg), Arc::new(NoopColdStorage))
    }

    fn m(ts: i64) -> Measurement {
        Measurement {
            attribute_id: "heartrate".to_owned(),
            payload: json!(70),
            timestamp_ms: ts,
            event: None,
        }
    }

    #[tokio::test]
    async fn concurrent_locate_or_create_yields_one_actor() {
        let registry = registry();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .locate_or_create("S1", SensorMeta::default(), &format!("session-{i}"))
                    .unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| w[0].same_actor(&w[1])));
        assert_eq!(registry.session_count("S1"), 8);
        assert_eq!(registry.list(), vec!["S1".to_owned()]);
    }

    #[tokio::test]
    async fn locate_misses_unknown_ids() {
        let registry = registry();
        assert!(registry.locate("nope").is_none());
    }

    #[tokio::test]
    async fn release_of_last_session_tears_down_after_grace() {
        let registry = registry();
        registry
            .locate_or_create("S1", SensorMeta::default(), "a")
            .unwrap();
        registry.release("S1", "a");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.locate("S1").is_none());
    }

    #[tokio::test]
    async fn reconnect_within_grace_keeps_state() {
        let registry = registry();
        let first = registry
            .locate_or_create("S1", SensorMeta::default(), "a")
            .unwrap();
        first.ingest_one(m(1)).await.unwrap();

        registry.release("S1", "a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = registry
            .locate_or_create("S1", SensorMeta::default(), "b")
            .unwrap();
        assert!(first.same_actor(&second));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // No teardown fired; state (including last) is intact.
        let snapshot = second.snapshot(None).await.unwrap();
        assert_eq!(snapshot.last["heartrate"].timestamp_ms, 1);
    }

    #[tokio::test]
    async fn live_data_subscriber_blocks_teardown() {
        let registry = registry();
        registry
            .locate_or_create("S1", SensorMeta::default(), "a")
            .unwrap();
        let _observer = registry.bus().subscribe(&topics::data("S1"));
        registry.release("S1", "a");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.locate("S1").is_some());
    }

    #[tokio::test]
    async fn poisoned_ids_refuse_joins_until_expiry() {
        let registry = registry();
        registry
            .inner
            .lock()
            .unwrap()
            .poisoned
            .insert("S1".to_owned(), Instant::now() + Duration::from_secs(30));
        let err = registry
            .locate_or_create("S1", SensorMeta::default(), "a")
            .unwrap_err();
        assert_eq!(err, CoreError::ActorPoisoned("S1".to_owned()));

        // Expired poison is cleared on the next join.
        registry
            .inner
            .lock()
            .unwrap()
            .poisoned
            .insert("S2".to_owned(), Instant::now() - Duration::from_millis(1));
        registry
            .locate_or_create("S2", SensorMeta::default(), "a")
            .unwrap();
    }

    #[test]
    fn restart_tracker_backs_off_then_poisons() {
        let mut tracker = RestartTracker::new(5, Duration::from_secs(10), Duration::from_millis(100));
        let t0 = Instant::now();
        assert_eq!(
            tracker.record(t0),
            RestartDecision::Restart(Duration::from_millis(100))
        );
        assert_eq!(
            tracker.record(t0 + Duration::from_millis(10)),
            RestartDecision::Restart(Duration::from_millis(200))
        );
        for i in 0..3 {
            let decision = tracker.record(t0 + Duration::from_millis(20 + i));
            assert!(matches!(decision, RestartDecision::Restart(_)));
        }
        // Sixth crash inside the window exceeds the budget.
        assert_eq!(
            tracker.record(t0 + Duration::from_millis(30)),
            RestartDecision::Poison
        );
    }

    #[test]
    fn restart_tracker_window_slides() {
        let mut tracker = RestartTracker::new(2, Duration::from_secs(10), Duration::from_millis(100));
        let t0 = Instant::now();
        tracker.record(t0);
        tracker.record(t0 + Duration::from_millis(1));
        // Outside the window: the old crashes no longer count.
        assert!(matches!(
            tracker.record(t0 + Duration::from_secs(11)),
            RestartDecision::Restart(_)
        ));
    }
}
