//! Read-only HTTP surface: active sensors with their counters, plus bus
//! and load observability.

use crate::state::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct SensorRow {
    sensor_id: String,
    sessions: usize,
    attention_level: sb_protocol::AttentionLevel,
    attributes: usize,
    hot_entries: usize,
    warm_entries: usize,
    ingest_total: u64,
    invalid_total: u64,
}

pub async fn list_sensors(State(state): State<AppState>) -> impl IntoResponse {
    let mut sensors = Vec::new();
    for sensor_id in state.registry.list() {
        let Some(actor) = state.registry.locate(&sensor_id) else {
            continue;
        };
        let Ok(stats) = actor.stats().await else {
            continue;
        };
        sensors.push(SensorRow {
            sessions: state.registry.session_count(&sensor_id),
            attention_level: state.attention.get_sensor_attention_level(&sensor_id),
            sensor_id: stats.sensor_id,
            attributes: stats.attributes,
            hot_entries: stats.hot_entries,
            warm_entries: stats.warm_entries,
            ingest_total: stats.ingest_total,
            invalid_total: stats.invalid_total,
        });
    }
    sensors.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));

    Json(json!({
        "sensors": sensors,
        "observers": state.attention.observer_count(),
        "bus": state.bus.stats(),
        "load": state.load.current(),
    }))
}
