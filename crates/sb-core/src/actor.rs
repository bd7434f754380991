//! The sensor actor: one long-lived task per `sensor_id`, exclusively
//! owning that sensor's state. Every operation is serialized through the
//! actor's inbox; replies travel back on oneshot channels.
//!
//! Validation failures surface to the caller and never kill the actor.
//! Storage and publish failures are counters/logs only; the next ingest
//! proceeds regardless.

use crate::bus::{BusEvent, MessageBus, topics};
use crate::clock;
use crate::collab::ColdStorage;
use crate::error::CoreError;
use crate::measurement::{AttributeMeta, Measurement, SensorMeta, SensorSnapshot};
use crate::store::TieredStore;
use crate::vocab::{AttributeVocabulary, UpdateAction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Evictions buffered before a cold-storage flush.
const SPOOL_FLUSH_THRESHOLD: usize = 128;

/// Counts returned by [`SensorActorHandle::ingest_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

/// Point-in-time counters for one actor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SensorStats {
    pub sensor_id: String,
    pub attributes: usize,
    pub hot_entries: usize,
    pub warm_entries: usize,
    pub ingest_total: u64,
    pub invalid_total: u64,
}

/// Shared collaborators handed to every actor by the registry.
#[derive(Clone)]
pub struct ActorContext {
    pub bus: MessageBus,
    pub vocab: Arc<AttributeVocabulary>,
    pub sink: Arc<dyn ColdStorage>,
    pub hot_capacity: usize,
    pub warm_capacity: usize,
}

/// Operations accepted by the actor inbox.
pub enum SensorCommand {
    IngestOne {
        measurement: Measurement,
        /// Absent for fire-and-forget ingests (ref-less frames).
        reply: Option<oneshot::Sender<Result<(), CoreError>>>,
    },
    IngestBatch {
        measurements: Vec<Measurement>,
        reply: oneshot::Sender<Result<BatchOutcome, CoreError>>,
    },
    UpdateAttributes {
        action: UpdateAction,
        attribute_id: String,
        metadata: serde_json::Map<String, serde_json::Value>,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Snapshot {
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<SensorSnapshot, CoreError>>,
    },
    GetAttribute {
        attribute_id: String,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<usize>,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<Vec<Measurement>, CoreError>>,
    },
    Stats {
        reply: oneshot::Sender<SensorStats>,
    },
    Terminate,
}

/// Cloneable handle to one sensor actor. Valid across supervisor restarts:
/// the inbox channel outlives the state.
#[derive(Clone, Debug)]
pub struct SensorActorHandle {
    sensor_id: Arc<str>,
    tx: mpsc::Sender<SensorCommand>,
}

/// Create the inbox for a new actor. The registry pairs the receiver with
/// [`run`] under its supervision loop.
pub fn channel(sensor_id: &str, inbox_capacity: usize) -> (SensorActorHandle, mpsc::Receiver<SensorCommand>) {
    let (tx, rx) = mpsc::channel(inbox_capacity.max(1));
    (
        SensorActorHandle {
            sensor_id: Arc::from(sensor_id),
            tx,
        },
        rx,
    )
}

impl SensorActorHandle {
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    /// True when both handles feed the same actor inbox.
    pub fn same_actor(&self, other: &SensorActorHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Current inbox depth, sampled by the load monitor.
    pub fn inbox_depth(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    fn send_command(&self, command: SensorCommand) -> Result<(), CoreError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => CoreError::Overflow {
                topic: format!("actor:{}", self.sensor_id),
                count: 1,
            },
            TrySendError::Closed(_) => CoreError::BusUnavailable,
        })
    }

    /// Ingest one measurement and wait for the validation result.
    pub async fn ingest_one(&self, measurement: Measurement) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::IngestOne {
            measurement,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)?
    }

    /// Fire-and-forget ingest; validation failures are counted, not returned.
    pub fn ingest_one_nowait(&self, measurement: Measurement) -> Result<(), CoreError> {
        self.send_command(SensorCommand::IngestOne {
            measurement,
            reply: None,
        })
    }

    /// Ingest a batch. Rejects the whole batch only when every entry fails
    /// validation; otherwise applies the valid subset in submission order.
    pub async fn ingest_batch(
        &self,
        measurements: Vec<Measurement>,
    ) -> Result<BatchOutcome, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::IngestBatch {
            measurements,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)?
    }

    pub async fn update_attributes(
        &self,
        action: UpdateAction,
        attribute_id: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::UpdateAttributes {
            action,
            attribute_id,
            metadata,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)?
    }

    /// Deep-copied state for new observers. `deadline` bounds how stale the
    /// request may be before the actor refuses to serve it.
    pub async fn snapshot(&self, deadline: Option<Instant>) -> Result<SensorSnapshot, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::Snapshot { deadline, reply })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)?
    }

    pub async fn get_attribute(
        &self,
        attribute_id: String,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<Vec<Measurement>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::GetAttribute {
            attribute_id,
            from,
            to,
            limit,
            deadline,
            reply,
        })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)?
    }

    pub async fn stats(&self) -> Result<SensorStats, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(SensorCommand::Stats { reply })?;
        rx.await.map_err(|_| CoreError::BusUnavailable)
    }

    /// Ask the actor to drop its state and exit. Best-effort.
    pub fn terminate(&self) {
        let _ = self.tx.try_send(SensorCommand::Terminate);
    }
}

// ---------------------------------------------------------------------------
// Actor state and run loop
// ---------------------------------------------------------------------------

struct SensorState {
    sensor_id: String,
    meta: SensorMeta,
    attributes: HashMap<String, AttributeMeta>,
    store: TieredStore,
    created_at_ms: i64,
    last_ingest_at_ms: Option<i64>,
    ingest_counts: HashMap<String, u64>,
    invalid_total: u64,
    /// Warm-tier evictions awaiting a cold-storage flush.
    spool: Vec<Measurement>,
}

impl SensorState {
    fn new(sensor_id: String, meta: SensorMeta, ctx: &ActorContext) -> Self {
        Self {
            sensor_id,
            meta,
            attributes: HashMap::new(),
            store: TieredStore::new(ctx.hot_capacity, ctx.warm_capacity),
            created_at_ms: clock::now_wall_ms(),
            last_ingest_at_ms: None,
            ingest_counts: HashMap::new(),
            invalid_total: 0,
            spool: Vec::new(),
        }
    }

    fn ingest_one(&mut self, ctx: &ActorContext, m: Measurement) -> Result<(), CoreError> {
        if let Err(e) = ctx.vocab.validate_measurement(&m) {
            self.invalid_total += 1;
            return Err(e);
        }
        let is_new_attribute = self.note_attribute(&m.attribute_id);
        self.apply(ctx, m.clone());
        ctx.bus.publish(
            &topics::data(&self.sensor_id),
            BusEvent::Measurement {
                sensor_id: self.sensor_id.clone(),
                measurement: m,
            },
        );
        if is_new_attribute {
            self.publish_new_state(ctx);
        }
        Ok(())
    }

    fn ingest_batch(
        &mut self,
        ctx: &ActorContext,
        measurements: Vec<Measurement>,
    ) -> Result<BatchOutcome, CoreError> {
        if measurements.is_empty() {
            return Ok(BatchOutcome {
                accepted: 0,
                rejected: 0,
            });
        }
        let mut valid = Vec::with_capacity(measurements.len());
        let mut rejected = 0usize;
        for m in measurements {
            match ctx.vocab.validate_measurement(&m) {
                Ok(()) => valid.push(m),
                Err(_) => {
                    rejected += 1;
                    self.invalid_total += 1;
                }
            }
        }
        if valid.is_empty() {
            return Err(CoreError::InvalidBatch {
                failed_count: rejected,
            });
        }

        let mut saw_new_attribute = false;
        for m in &valid {
            saw_new_attribute |= self.note_attribute(&m.attribute_id);
            self.apply(ctx, m.clone());
        }
        let accepted = valid.len();
        // Exactly one event carries the accepted list: subscribers get
        // all-or-none visibility of the batch.
        ctx.bus.publish(
            &topics::data(&self.sensor_id),
            BusEvent::MeasurementBatch {
                sensor_id: self.sensor_id.clone(),
                measurements: Arc::new(valid),
            },
        );
        if saw_new_attribute {
            self.publish_new_state(ctx);
        }
        Ok(BatchOutcome { accepted, rejected })
    }

    /// Register an attribute id on first sight. Returns true when new.
    fn note_attribute(&mut self, attribute_id: &str) -> bool {
        if self.attributes.contains_key(attribute_id) {
            return false;
        }
        self.attributes.insert(
            attribute_id.to_owned(),
            AttributeMeta {
                metadata: serde_json::Map::new(),
                added_at_ms: clock::now_wall_ms(),
            },
        );
        true
    }

    /// Store a validated measurement and update counters.
    fn apply(&mut self, ctx: &ActorContext, m: Measurement) {
        self.last_ingest_at_ms = Some(clock::now_wall_ms());
        *self.ingest_counts.entry(m.attribute_id.clone()).or_insert(0) += 1;
        let evicted = self.store.put(m);
        if !evicted.is_empty() {
            self.spool.extend(evicted);
            if self.spool.len() >= SPOOL_FLUSH_THRESHOLD {
                self.flush_spool(ctx);
            }
        }
    }

    fn update_attributes(
        &mut self,
        ctx: &ActorContext,
        action: UpdateAction,
        attribute_id: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CoreError> {
        ctx.vocab.validate(&attribute_id)?;
        match action {
            UpdateAction::Add | UpdateAction::Update => {
                let entry = self
                    .attributes
                    .entry(attribute_id)
                    .or_insert_with(|| AttributeMeta {
                        metadata: serde_json::Map::new(),
                        added_at_ms: clock::now_wall_ms(),
                    });
                entry.metadata = metadata;
            }
            UpdateAction::Remove => {
                self.attributes.remove(&attribute_id);
                self.store.remove_attribute(&attribute_id);
                self.ingest_counts.remove(&attribute_id);
            }
        }
        self.publish_new_state(ctx);
        Ok(())
    }

    fn snapshot(&self) -> SensorSnapshot {
        let last = self
            .attributes
            .keys()
            .filter_map(|id| self.store.last(id).map(|m| (id.clone(), m.clone())))
            .collect();
        SensorSnapshot {
            sensor_id: self.sensor_id.clone(),
            sensor_name: self.meta.sensor_name.clone(),
            sensor_type: self.meta.sensor_type.clone(),
            attributes: self.attributes.clone().into_iter().collect(),
            last,
            created_at_ms: self.created_at_ms,
            last_ingest_at_ms: self.last_ingest_at_ms,
        }
    }

    fn stats(&self) -> SensorStats {
        let store = self.store.stats();
        SensorStats {
            sensor_id: self.sensor_id.clone(),
            attributes: self.attributes.len(),
            hot_entries: store.hot_entries,
            warm_entries: store.warm_entries,
            ingest_total: self.ingest_counts.values().sum(),
            invalid_total: self.invalid_total,
        }
    }

    fn publish_new_state(&self, ctx: &ActorContext) {
        ctx.bus.publish(
            &topics::signal(&self.sensor_id),
            BusEvent::NewState {
                sensor_id: self.sensor_id.clone(),
            },
        );
    }

    fn flush_spool(&mut self, ctx: &ActorContext) {
        if self.spool.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.spool);
        ctx.sink.append(&self.sensor_id, batch);
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() > d)
}

/// Drive one actor over `rx` until `Terminate` or all handles drop.
///
/// The registry calls this under its supervision loop; a panic inside is
/// caught there and the actor restarts with empty state on the same inbox.
pub async fn run(
    sensor_id: String,
    meta: SensorMeta,
    ctx: &ActorContext,
    rx: &mut mpsc::Receiver<SensorCommand>,
) {
    let mut state = SensorState::new(sensor_id, meta, ctx);
    tracing::debug!(sensor_id = %state.sensor_id, "sensor actor started");

    while let Some(command) = rx.recv().await {
        match command {
            SensorCommand::IngestOne { measurement, reply } => {
                let result = state.ingest_one(ctx, measurement);
                if let Err(e) = &result {
                    tracing::debug!(sensor_id = %state.sensor_id, error = %e, "measurement rejected");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SensorCommand::IngestBatch {
                measurements,
                reply,
            } => {
                let _ = reply.send(state.ingest_batch(ctx, measurements));
            }
            SensorCommand::UpdateAttributes {
                action,
                attribute_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(state.update_attributes(ctx, action, attribute_id, metadata));
            }
            SensorCommand::Snapshot { deadline, reply } => {
                let result = if expired(deadline) {
                    Err(CoreError::Timeout)
                } else {
                    Ok(state.snapshot())
                };
                let _ = reply.send(result);
            }
            SensorCommand::GetAttribute {
                attribute_id,
                from,
                to,
                limit,
                deadline,
                reply,
            } => {
                let result = if expired(deadline) {
                    Err(CoreError::Timeout)
                } else {
                    Ok(state.store.range(&attribute_id, from, to, limit))
                };
                let _ = reply.send(result);
            }
            SensorCommand::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            SensorCommand::Terminate => break,
        }
    }

    state.flush_spool(ctx);
    tracing::debug!(sensor_id = %state.sensor_id, "sensor actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NoopColdStorage;
    use serde_json::json;
    use std::time::Duration;

    fn context(bus: &MessageBus) -> ActorContext {
        ActorContext {
            bus: bus.clone(),
            vocab: Arc::new(AttributeVocabulary::default()),
            sink: Arc::new(NoopColdStorage),
            hot_capacity: 4,
            warm_capacity: 4,
        }
    }

    fn spawn(bus: &MessageBus) -> SensorActorHandle {
        let ctx = context(bus);
        let (handle, mut rx) = channel("S1", 64);
        tokio::spawn(async move {
            run("S1".to_owned(), SensorMeta::default(), &ctx, &mut rx).await;
        });
        handle
    }

    fn m(attribute_id: &str, payload: serde_json::Value, ts: i64) -> Measurement {
        Measurement {
            attribute_id: attribute_id.to_owned(),
            payload,
            timestamp_ms: ts,
            event: None,
        }
    }

    #[tokio::test]
    async fn ingest_publishes_and_snapshot_carries_last() {
        let bus = MessageBus::new(64);
        let sub = bus.subscribe("data:S1");
        let actor = spawn(&bus);

        actor.ingest_one(m("heartrate", json!(72), 1000)).await.unwrap();

        match sub.recv().await.unwrap() {
            BusEvent::Measurement { measurement, .. } => {
                assert_eq!(measurement.payload, json!(72));
                assert_eq!(measurement.timestamp_ms, 1000);
            }
            other => panic!("expected measurement event, got {other:?}"),
        }

        let snapshot = actor.snapshot(None).await.unwrap();
        assert_eq!(snapshot.last["heartrate"].payload, json!(72));
        assert!(snapshot.attributes.contains_key("heartrate"));
    }

    #[tokio::test]
    async fn observers_see_ingest_order() {
        let bus = MessageBus::new(64);
        let sub = bus.subscribe("data:S1");
        let actor = spawn(&bus);

        for ts in 1..=20 {
            actor.ingest_one(m("heartrate", json!(ts), ts)).await.unwrap();
        }
        for ts in 1..=20 {
            match sub.recv().await.unwrap() {
                BusEvent::Measurement { measurement, .. } => {
                    assert_eq!(measurement.timestamp_ms, ts);
                }
                other => panic!("expected measurement event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn first_sight_of_an_attribute_publishes_new_state() {
        let bus = MessageBus::new(64);
        let signals = bus.subscribe("signal:S1");
        let actor = spawn(&bus);

        actor.ingest_one(m("heartrate", json!(70), 1)).await.unwrap();
        actor.ingest_one(m("heartrate", json!(71), 2)).await.unwrap();

        assert!(matches!(
            signals.recv().await.unwrap(),
            BusEvent::NewState { sensor_id } if sensor_id == "S1"
        ));
        // Second ingest of a known attribute: no further state churn.
        assert!(signals.try_recv().is_none());
    }

    #[tokio::test]
    async fn invalid_measurement_surfaces_and_actor_survives() {
        let bus = MessageBus::new(64);
        let actor = spawn(&bus);

        let err = actor.ingest_one(m("bogus", json!(0), 1)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidAttributeId(_)));

        actor.ingest_one(m("heartrate", json!(70), 2)).await.unwrap();
        let stats = actor.stats().await.unwrap();
        assert_eq!(stats.ingest_total, 1);
        assert_eq!(stats.invalid_total, 1);
    }

    #[tokio::test]
    async fn mixed_batch_applies_valid_subset_as_one_event() {
        let bus = MessageBus::new(64);
        let sub = bus.subscribe("data:S1");
        let actor = spawn(&bus);

        let outcome = actor
            .ingest_batch(vec![
                m("heartrate", json!(60), 2000),
                m("bogus", json!(0), 2001),
            ])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { accepted: 1, rejected: 1 });

        match sub.recv().await.unwrap() {
            BusEvent::MeasurementBatch { measurements, .. } => {
                assert_eq!(measurements.len(), 1);
                assert_eq!(measurements[0].timestamp_ms, 2000);
            }
            other => panic!("expected batch event, got {other:?}"),
        }
        // The invalid entry produced no separate event.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn all_invalid_batch_is_rejected_atomically() {
        let bus = MessageBus::new(64);
        let sub = bus.subscribe("data:S1");
        let actor = spawn(&bus);

        let err = actor
            .ingest_batch(vec![m("bogus", json!(0), 1), m("nope", json!(1), 2)])
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::InvalidBatch { failed_count: 2 });
        assert!(sub.try_recv().is_none());
        assert_eq!(actor.stats().await.unwrap().ingest_total, 0);
    }

    #[tokio::test]
    async fn update_attributes_mutates_registry_and_signals() {
        let bus = MessageBus::new(64);
        let signals = bus.subscribe("signal:S1");
        let actor = spawn(&bus);

        let mut metadata = serde_json::Map::new();
        metadata.insert("unit".to_owned(), json!("celsius"));
        actor
            .update_attributes(UpdateAction::Add, "temperature".to_owned(), metadata)
            .await
            .unwrap();
        assert!(matches!(
            signals.recv().await.unwrap(),
            BusEvent::NewState { .. }
        ));
        let snapshot = actor.snapshot(None).await.unwrap();
        assert_eq!(snapshot.attributes["temperature"].metadata["unit"], "celsius");

        actor
            .update_attributes(
                UpdateAction::Remove,
                "temperature".to_owned(),
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        let snapshot = actor.snapshot(None).await.unwrap();
        assert!(!snapshot.attributes.contains_key("temperature"));
    }

    #[tokio::test]
    async fn get_attribute_delegates_to_the_store() {
        let bus = MessageBus::new(64);
        let actor = spawn(&bus);
        for ts in 1..=6 {
            actor.ingest_one(m("heartrate", json!(ts), ts)).await.unwrap();
        }
        let range = actor
            .get_attribute("heartrate".to_owned(), Some(2), Some(5), Some(3), None)
            .await
            .unwrap();
        let ts: Vec<i64> = range.iter().map(|m| m.timestamp_ms).collect();
        assert_eq!(ts, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn expired_deadline_refuses_the_query() {
        let bus = MessageBus::new(64);
        let actor = spawn(&bus);
        let stale = Instant::now() - Duration::from_millis(10);
        let err = actor.snapshot(Some(stale)).await.unwrap_err();
        assert_eq!(err, CoreError::Timeout);
    }

    #[tokio::test]
    async fn terminate_ends_the_actor() {
        let bus = MessageBus::new(64);
        let actor = spawn(&bus);
        actor.ingest_one(m("heartrate", json!(1), 1)).await.unwrap();
        actor.terminate();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            actor.ingest_one(m("heartrate", json!(2), 2)).await,
            Err(CoreError::BusUnavailable)
        ));
    }
}
