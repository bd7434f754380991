//! Backpressure computation and per-session dispatch.
//!
//! The config is a pure function of `(attention, load level, multiplier)`;
//! the dispatcher is a reducer over the attention and load topics that
//! pushes a fresh config to its session whenever any field other than the
//! generation timestamp changes. The first config is sent unconditionally.

use crate::attention::AttentionHandle;
use crate::bus::{BusEvent, MessageBus, Subscription, topics};
use crate::clock;
use crate::config::CoreConfig;
use crate::load::LoadHandle;
use sb_protocol::{AttentionLevel, BackpressureConfigPayload, SystemLoadLevel};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Derive the connector config for one sensor.
///
/// Deterministic: identical inputs produce an identical config (the caller
/// supplies the generation timestamp).
pub fn compute_config(
    cfg: &CoreConfig,
    attention: AttentionLevel,
    load_level: SystemLoadLevel,
    multiplier: f64,
    now_ms: i64,
) -> BackpressureConfigPayload {
    let base = cfg.batch_windows.for_level(attention);
    let window_ms = (base.window_ms as f64 * multiplier).round() as u64;
    let paused = load_level == SystemLoadLevel::Critical
        && matches!(attention, AttentionLevel::Low | AttentionLevel::None);
    BackpressureConfigPayload {
        attention_level: attention,
        system_load: load_level,
        paused,
        recommended_batch_window_ms: window_ms,
        recommended_batch_size: base.batch_size,
        load_multiplier: multiplier,
        timestamp: now_ms,
    }
}

/// Field comparison ignoring the generation timestamp.
pub fn config_changed(a: &BackpressureConfigPayload, b: &BackpressureConfigPayload) -> bool {
    a.attention_level != b.attention_level
        || a.system_load != b.system_load
        || a.paused != b.paused
        || a.recommended_batch_window_ms != b.recommended_batch_window_ms
        || a.recommended_batch_size != b.recommended_batch_size
        || a.load_multiplier != b.load_multiplier
}

/// Start a dispatcher for one connector session.
///
/// Subscribes to `attention:<sensor_id>` and `system:load` before reading
/// the current values, so no change can slip between the initial config
/// and the event loop. The receiver yields the initial config followed by
/// every subsequent change; it ends when the session drops the receiver.
pub fn spawn_dispatcher(
    bus: &MessageBus,
    attention: &AttentionHandle,
    load: &LoadHandle,
    cfg: Arc<CoreConfig>,
    sensor_id: &str,
) -> mpsc::Receiver<BackpressureConfigPayload> {
    let attention_sub = bus.subscribe(&topics::attention(sensor_id));
    let load_sub = bus.subscribe(topics::SYSTEM_LOAD);
    let initial_attention = attention.get_sensor_attention_level(sensor_id);
    let initial_load = load.current();

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(run_dispatcher(
        attention_sub,
        load_sub,
        tx,
        cfg,
        initial_attention,
        initial_load.level,
        initial_load.multiplier,
    ));
    rx
}

async fn run_dispatcher(
    attention_sub: Subscription,
    load_sub: Subscription,
    tx: mpsc::Sender<BackpressureConfigPayload>,
    cfg: Arc<CoreConfig>,
    mut attention: AttentionLevel,
    mut load_level: SystemLoadLevel,
    mut multiplier: f64,
) {
    let mut last = compute_config(&cfg, attention, load_level, multiplier, clock::now_wall_ms());
    if tx.send(last.clone()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = attention_sub.recv() => match event {
                Some(BusEvent::AttentionChanged { level, .. }) => attention = level,
                Some(_) => continue,
                None => break,
            },
            event = load_sub.recv() => match event {
                Some(BusEvent::SystemLoadChanged { state }) => {
                    load_level = state.level;
                    multiplier = state.multiplier;
                }
                Some(_) => continue,
                None => break,
            },
        }

        let next = compute_config(&cfg, attention, load_level, multiplier, clock::now_wall_ms());
        if config_changed(&next, &last) {
            if tx.send(next.clone()).await.is_err() {
                break;
            }
            last = next;
        }
    }
}
