//! Connector sessions: the authenticated frame protocol between edge
//! devices and the engine.
//!
//! Attach protocol: the first frame must be a `join` carrying a bearer
//! token. A `sensor:<id>` join locates-or-creates the sensor actor,
//! starts a backpressure dispatcher for the session, and enters the
//! running loop; a `connector:<id>` join opens a control-only session
//! (ping). Validation errors answer the offending frame and never end the
//! session; disconnects schedule fire-and-forget cleanup with a reconnect
//! coalescing grace.

use crate::state::AppState;
use crate::ws_common::{error_body, maybe_reply, recv_frame_with_timeout, send_frame};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use sb_core::actor::SensorActorHandle;
use sb_core::attention::AttentionSignal;
use sb_core::backpressure::spawn_dispatcher;
use sb_core::error::CoreError;
use sb_core::measurement::{Measurement, SensorMeta};
use sb_core::vocab::UpdateAction;
use sb_protocol::{
    ErrorBody, Frame, JoinPayload, ReplyPayload, Topic, UpdateAttributesPayload, error_codes,
    events,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);
/// Wait before releasing the actor claim, so a reconnecting device lands
/// on the same actor without teardown churn.
const DISCONNECT_GRACE: Duration = Duration::from_millis(50);

pub async fn ws_connector_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connector_socket(socket, state))
}

async fn handle_connector_socket(mut socket: WebSocket, state: AppState) {
    let join_frame = match recv_frame_with_timeout(&mut socket, JOIN_TIMEOUT).await {
        Ok(Some(frame)) if frame.event == events::JOIN => frame,
        Ok(Some(frame)) => {
            maybe_reply(
                &mut socket,
                &frame,
                ReplyPayload::error(ErrorBody::new(
                    error_codes::PROTOCOL_ERROR,
                    "expected join frame",
                )),
            )
            .await;
            return;
        }
        Ok(None) => return,
        Err(()) => {
            warn!("connector handshake failed before join");
            return;
        }
    };

    let join: JoinPayload = match serde_json::from_value(join_frame.payload.clone()) {
        Ok(join) => join,
        Err(_) => {
            maybe_reply(
                &mut socket,
                &join_frame,
                ReplyPayload::error(ErrorBody::new(
                    error_codes::MISSING_FIELDS,
                    "join payload requires connector_id and bearer_token",
                )),
            )
            .await;
            return;
        }
    };

    let subject = match state.verifier.verify(&join.bearer_token) {
        Ok(subject) => subject,
        Err(reason) => {
            info!(connector_id = %join.connector_id, %reason, "connector join refused");
            maybe_reply(
                &mut socket,
                &join_frame,
                ReplyPayload::error(ErrorBody::new(error_codes::UNAUTHORIZED, reason)),
            )
            .await;
            return;
        }
    };

    match Topic::parse(&join_frame.topic) {
        Some(Topic::Sensor(sensor_id)) => {
            run_sensor_session(socket, state, join_frame, join, sensor_id).await;
        }
        Some(Topic::Connector(_)) => {
            if maybe_reply(
                &mut socket,
                &join_frame,
                ReplyPayload::ok(serde_json::json!({ "subject": subject.id })),
            )
            .await
            {
                run_control_session(socket, join.connector_id).await;
            }
        }
        _ => {
            maybe_reply(
                &mut socket,
                &join_frame,
                ReplyPayload::error(ErrorBody::new(
                    error_codes::PROTOCOL_ERROR,
                    "join topic must be sensor:<id> or connector:<id>",
                )),
            )
            .await;
        }
    }
}

/// Control-only attach: the device has no sensor yet but keeps the link
/// warm. Only `ping` is served.
async fn run_control_session(mut socket: WebSocket, connector_id: String) {
    loop {
        match recv_frame_with_timeout(&mut socket, SESSION_TIMEOUT).await {
            Ok(Some(frame)) if frame.event == events::PING => {
                let payload = frame.payload.clone();
                if !maybe_reply(&mut socket, &frame, ReplyPayload::ok(payload)).await {
                    break;
                }
            }
            Ok(Some(frame)) => {
                warn!(connector_id = %connector_id, event = %frame.event, "unknown control frame");
            }
            Ok(None) | Err(()) => break,
        }
    }
}

async fn run_sensor_session(
    mut socket: WebSocket,
    state: AppState,
    join_frame: Frame,
    join: JoinPayload,
    sensor_id: String,
) {
    let session_id = Uuid::new_v4().to_string();
    let meta = SensorMeta {
        sensor_name: join.sensor_name.clone(),
        sensor_type: join.sensor_type.clone(),
        sampling_rate: join.sampling_rate,
        batch_size: join.batch_size,
    };

    let actor = match state.registry.locate_or_create(&sensor_id, meta, &session_id) {
        Ok(actor) => actor,
        Err(e) => {
            maybe_reply(&mut socket, &join_frame, ReplyPayload::error(error_body(&e))).await;
            return;
        }
    };

    // Pre-declared attributes: vocabulary members are registered up front,
    // the rest are dropped with a warning rather than failing the join.
    for attribute_id in &join.attributes {
        if state.cfg.vocabulary.contains(attribute_id) {
            let _ = actor
                .update_attributes(
                    UpdateAction::Add,
                    attribute_id.clone(),
                    serde_json::Map::new(),
                )
                .await;
        } else {
            warn!(sensor_id = %sensor_id, attribute_id = %attribute_id, "declared attribute not in vocabulary");
        }
    }

    if !maybe_reply(
        &mut socket,
        &join_frame,
        ReplyPayload::ok(serde_json::json!({ "session_id": session_id })),
    )
    .await
    {
        state.registry.release(&sensor_id, &session_id);
        return;
    }
    info!(sensor_id = %sensor_id, connector_id = %join.connector_id, "connector joined");
    state.attention.signal(AttentionSignal::TrackSensor {
        sensor_id: sensor_id.clone(),
    });

    // The dispatcher watches attention:<sid> + system:load and yields the
    // initial config unconditionally, then every change.
    let mut config_rx = spawn_dispatcher(
        &state.bus,
        &state.attention,
        &state.load,
        Arc::clone(&state.cfg),
        &sensor_id,
    );

    loop {
        tokio::select! {
            msg = tokio::time::timeout(SESSION_TIMEOUT, socket.recv()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                if !handle_frame(&mut socket, &state, &actor, frame).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(sensor_id = %sensor_id, error = %e, "unparseable frame");
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!(sensor_id = %sensor_id, "connector disconnected");
                        break;
                    }
                    Err(_) => {
                        warn!(sensor_id = %sensor_id, "session timeout");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(sensor_id = %sensor_id, error = %e, "WS error");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
            config = config_rx.recv() => {
                match config {
                    Some(config) => {
                        let frame = Frame::push(
                            format!("sensor:{sensor_id}"),
                            events::BACKPRESSURE_CONFIG,
                            serde_json::to_value(&config).unwrap_or_default(),
                        );
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Fire-and-forget cleanup; the registry applies its own grace and
    // subscriber check before any teardown.
    let registry = state.registry.clone();
    let attention = state.attention.clone();
    tokio::spawn(async move {
        tokio::time::sleep(DISCONNECT_GRACE).await;
        attention.signal(AttentionSignal::UntrackSensor {
            sensor_id: sensor_id.clone(),
        });
        registry.release(&sensor_id, &session_id);
    });
}

/// Dispatch one connector frame. Returns false when the socket is gone.
async fn handle_frame(
    socket: &mut WebSocket,
    state: &AppState,
    actor: &SensorActorHandle,
    frame: Frame,
) -> bool {
    match frame.event.as_str() {
        events::MEASUREMENT => handle_measurement(socket, state, actor, frame).await,
        events::MEASUREMENTS_BATCH => handle_batch(socket, state, actor, frame).await,
        events::UPDATE_ATTRIBUTES => handle_update_attributes(socket, actor, frame).await,
        events::PING => {
            let payload = frame.payload.clone();
            maybe_reply(socket, &frame, ReplyPayload::ok(payload)).await
        }
        other => {
            warn!(sensor_id = %actor.sensor_id(), event = %other, "unknown frame event");
            true
        }
    }
}

async fn handle_measurement(
    socket: &mut WebSocket,
    state: &AppState,
    actor: &SensorActorHandle,
    frame: Frame,
) -> bool {
    let measurement: Measurement = match state.cfg.vocabulary.measurement_from_value(&frame.payload)
    {
        Ok(m) => m,
        Err(e) => {
            debug!(sensor_id = %actor.sensor_id(), error = %e, "measurement rejected");
            return maybe_reply(socket, &frame, ReplyPayload::error(error_body(&e))).await;
        }
    };

    if frame.frame_ref.is_some() {
        let result = actor.ingest_one(measurement).await;
        let reply = match result {
            Ok(()) => ReplyPayload::ok(serde_json::json!({})),
            Err(e) => ReplyPayload::error(error_body(&e)),
        };
        maybe_reply(socket, &frame, reply).await
    } else {
        if let Err(e) = actor.ingest_one_nowait(measurement) {
            debug!(sensor_id = %actor.sensor_id(), error = %e, "ingest dropped");
        }
        true
    }
}

async fn handle_batch(
    socket: &mut WebSocket,
    state: &AppState,
    actor: &SensorActorHandle,
    frame: Frame,
) -> bool {
    let Some(items) = frame.payload.as_array() else {
        return maybe_reply(
            socket,
            &frame,
            ReplyPayload::error(ErrorBody::new(
                error_codes::MISSING_FIELDS,
                "measurements_batch payload must be an array",
            )),
        )
        .await;
    };

    let mut valid = Vec::with_capacity(items.len());
    let mut parse_failed = 0usize;
    for item in items {
        match state.cfg.vocabulary.measurement_from_value(item) {
            Ok(m) => valid.push(m),
            Err(_) => parse_failed += 1,
        }
    }

    if valid.is_empty() {
        // The whole batch is refused only when every entry failed.
        let err = CoreError::InvalidBatch {
            failed_count: parse_failed,
        };
        return maybe_reply(socket, &frame, ReplyPayload::error(error_body(&err))).await;
    }

    let reply = match actor.ingest_batch(valid).await {
        Ok(outcome) => ReplyPayload::ok(serde_json::json!({
            "accepted": outcome.accepted,
            "rejected": outcome.rejected + parse_failed,
        })),
        Err(CoreError::InvalidBatch { failed_count }) => {
            let err = CoreError::InvalidBatch {
                failed_count: failed_count + parse_failed,
            };
            ReplyPayload::error(error_body(&err))
        }
        Err(e) => ReplyPayload::error(error_body(&e)),
    };
    maybe_reply(socket, &frame, reply).await
}

async fn handle_update_attributes(
    socket: &mut WebSocket,
    actor: &SensorActorHandle,
    frame: Frame,
) -> bool {
    let payload: UpdateAttributesPayload = match serde_json::from_value(frame.payload.clone()) {
        Ok(p) => p,
        Err(_) => {
            return maybe_reply(
                socket,
                &frame,
                ReplyPayload::error(ErrorBody::new(
                    error_codes::MISSING_FIELDS,
                    "update_attributes requires action and attribute_id",
                )),
            )
            .await;
        }
    };

    let action: UpdateAction = match payload.action.parse() {
        Ok(action) => action,
        Err(e) => {
            return maybe_reply(socket, &frame, ReplyPayload::error(error_body(&e))).await;
        }
    };

    let result = actor
        .update_attributes(action, payload.attribute_id, payload.metadata)
        .await;
    let reply = match result {
        Ok(()) => ReplyPayload::ok(serde_json::json!({})),
        Err(e) => ReplyPayload::error(error_body(&e)),
    };
    maybe_reply(socket, &frame, reply).await
}
