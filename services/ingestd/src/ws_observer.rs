//! Observer sessions: dashboards and bridges that consume measurement
//! streams and report attention.
//!
//! After an authenticated join, `watch` subscribes the session to a
//! sensor's data and signal topics (replying with the current snapshot)
//! and attention signal frames feed the tracker. Fan-out frames are pumped
//! from bus subscriptions through a bounded outbound queue; a slow socket
//! backs up into the bus mailbox, which drops oldest rather than stalling
//! any publisher.

use crate::state::AppState;
use crate::ws_common::{maybe_reply, recv_frame_with_timeout, send_frame};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use sb_core::attention::AttentionSignal;
use sb_core::bus::{BusEvent, Subscription, topics};
use sb_protocol::{
    AttentionSignalPayload, BatteryPayload, ErrorBody, Frame, MeasurementPayload,
    ObserverJoinPayload, PinPayload, ReplyPayload, WatchPayload, error_codes, events,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);
/// Bound on the deep-copy snapshot served at watch time.
const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(2);

pub async fn ws_observer_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state))
}

struct WatchEntry {
    pumps: Vec<tokio::task::JoinHandle<()>>,
}

impl WatchEntry {
    fn stop(self) {
        for pump in self.pumps {
            pump.abort();
        }
    }
}

async fn handle_observer_socket(mut socket: WebSocket, state: AppState) {
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
        Err(()) => return,
    };

    let join: ObserverJoinPayload = match serde_json::from_value(join_frame.payload.clone()) {
        Ok(join) => join,
        Err(_) => {
            maybe_reply(
                &mut socket,
                &join_frame,
                ReplyPayload::error(ErrorBody::new(
                    error_codes::MISSING_FIELDS,
                    "join payload requires observer_id and bearer_token",
                )),
            )
            .await;
            return;
        }
    };

    if let Err(reason) = state.verifier.verify(&join.bearer_token) {
        info!(observer_id = %join.observer_id, %reason, "observer join refused");
        maybe_reply(
            &mut socket,
            &join_frame,
            ReplyPayload::error(ErrorBody::new(error_codes::UNAUTHORIZED, reason)),
        )
        .await;
        return;
    }
    if !maybe_reply(
        &mut socket,
        &join_frame,
        ReplyPayload::ok(serde_json::json!({})),
    )
    .await
    {
        return;
    }

    let observer_id = join.observer_id;
    info!(observer_id = %observer_id, "observer joined");

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    let mut watched: HashMap<String, WatchEntry> = HashMap::new();

    loop {
        tokio::select! {
            msg = tokio::time::timeout(SESSION_TIMEOUT, socket.recv()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                if !handle_observer_frame(
                                    &mut socket,
                                    &state,
                                    &observer_id,
                                    &out_tx,
                                    &mut watched,
                                    frame,
                                )
                                .await
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(observer_id = %observer_id, error = %e, "unparseable frame");
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Err(_) => {
                        warn!(observer_id = %observer_id, "session timeout");
                        break;
                    }
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(_))) => {}
                }
            }
            frame = out_rx.recv() => {
                // out_tx is held by this loop, so the channel never closes
                // from the far side.
                if let Some(frame) = frame {
                    if !send_frame(&mut socket, &frame).await {
                        break;
                    }
                }
            }
        }
    }

    for (_, entry) in watched.drain() {
        entry.stop();
    }
    state.attention.signal(AttentionSignal::ObserverGone {
        observer_id: observer_id.clone(),
    });
    info!(observer_id = %observer_id, "observer session ended");
}

/// Dispatch one observer frame. Returns false when the socket is gone.
async fn handle_observer_frame(
    socket: &mut WebSocket,
    state: &AppState,
    observer_id: &str,
    out_tx: &mpsc::Sender<Frame>,
    watched: &mut HashMap<String, WatchEntry>,
    frame: Frame,
) -> bool {
    match frame.event.as_str() {
        events::WATCH => {
            let Ok(watch) = serde_json::from_value::<WatchPayload>(frame.payload.clone()) else {
                return maybe_reply(
                    socket,
                    &frame,
                    ReplyPayload::error(ErrorBody::new(
                        error_codes::MISSING_FIELDS,
                        "watch requires sensor_id",
                    )),
                )
                .await;
            };
            let sensor_id = watch.sensor_id;

            if !watched.contains_key(&sensor_id) {
                let data_sub = state.bus.subscribe(&topics::data(&sensor_id));
                let signal_sub = state.bus.subscribe(&topics::signal(&sensor_id));
                let pumps = vec![
                    tokio::spawn(pump(data_sub, out_tx.clone())),
                    tokio::spawn(pump(signal_sub, out_tx.clone())),
                ];
                watched.insert(sensor_id.clone(), WatchEntry { pumps });
            }

            // New observers get the current deep-copied state, when the
            // sensor exists at all.
            let snapshot = match state.registry.locate(&sensor_id) {
                Some(actor) => actor
                    .snapshot(Some(Instant::now() + SNAPSHOT_DEADLINE))
                    .await
                    .ok()
                    .and_then(|s| serde_json::to_value(s).ok())
                    .unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            };
            maybe_reply(
                socket,
                &frame,
                ReplyPayload::ok(serde_json::json!({ "snapshot": snapshot })),
            )
            .await
        }
        events::UNWATCH => {
            let Ok(watch) = serde_json::from_value::<WatchPayload>(frame.payload.clone()) else {
                return maybe_reply(
                    socket,
                    &frame,
                    ReplyPayload::error(ErrorBody::new(
                        error_codes::MISSING_FIELDS,
                        "unwatch requires sensor_id",
                    )),
                )
                .await;
            };
            if let Some(entry) = watched.remove(&watch.sensor_id) {
                entry.stop();
            }
            maybe_reply(socket, &frame, ReplyPayload::ok(serde_json::json!({}))).await
        }
        events::REGISTER_VIEW
        | events::UNREGISTER_VIEW
        | events::REGISTER_HOVER
        | events::UNREGISTER_HOVER
        | events::REGISTER_FOCUS
        | events::UNREGISTER_FOCUS => {
            let Ok(signal) =
                serde_json::from_value::<AttentionSignalPayload>(frame.payload.clone())
            else {
                return maybe_reply(
                    socket,
                    &frame,
                    ReplyPayload::error(ErrorBody::new(
                        error_codes::MISSING_FIELDS,
                        "attention signals require sensor_id and attribute_id",
                    )),
                )
                .await;
            };
            let sensor_id = signal.sensor_id;
            let attribute_id = signal.attribute_id;
            let observer_id = observer_id.to_owned();
            let signal = match frame.event.as_str() {
                events::REGISTER_VIEW => AttentionSignal::RegisterView {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
                events::UNREGISTER_VIEW => AttentionSignal::UnregisterView {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
                events::REGISTER_HOVER => AttentionSignal::RegisterHover {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
                events::UNREGISTER_HOVER => AttentionSignal::UnregisterHover {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
                events::REGISTER_FOCUS => AttentionSignal::RegisterFocus {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
                _ => AttentionSignal::UnregisterFocus {
                    sensor_id,
                    attribute_id,
                    observer_id,
                },
            };
            state.attention.signal(signal);
            maybe_reply(socket, &frame, ReplyPayload::ok(serde_json::json!({}))).await
        }
        events::PIN_SENSOR | events::UNPIN_SENSOR => {
            let Ok(pin) = serde_json::from_value::<PinPayload>(frame.payload.clone()) else {
                return maybe_reply(
                    socket,
                    &frame,
                    ReplyPayload::error(ErrorBody::new(
                        error_codes::MISSING_FIELDS,
                        "pin signals require sensor_id",
                    )),
                )
                .await;
            };
            let signal = if frame.event == events::PIN_SENSOR {
                AttentionSignal::PinSensor {
                    sensor_id: pin.sensor_id,
                    observer_id: observer_id.to_owned(),
                }
            } else {
                AttentionSignal::UnpinSensor {
                    sensor_id: pin.sensor_id,
                    observer_id: observer_id.to_owned(),
                }
            };
            state.attention.signal(signal);
            maybe_reply(socket, &frame, ReplyPayload::ok(serde_json::json!({}))).await
        }
        events::REPORT_BATTERY => {
            let Ok(battery) = serde_json::from_value::<BatteryPayload>(frame.payload.clone())
            else {
                return maybe_reply(
                    socket,
                    &frame,
                    ReplyPayload::error(ErrorBody::new(
                        error_codes::MISSING_FIELDS,
                        "report_battery requires state",
                    )),
                )
                .await;
            };
            state.attention.signal(AttentionSignal::ReportBattery {
                observer_id: observer_id.to_owned(),
                state: battery.state,
            });
            maybe_reply(socket, &frame, ReplyPayload::ok(serde_json::json!({}))).await
        }
        events::HEARTBEAT => {
            state.attention.signal(AttentionSignal::Heartbeat {
                observer_id: observer_id.to_owned(),
            });
            maybe_reply(socket, &frame, ReplyPayload::ok(serde_json::json!({}))).await
        }
        events::PING => {
            let payload = frame.payload.clone();
            maybe_reply(socket, &frame, ReplyPayload::ok(payload)).await
        }
        other => {
            warn!(observer_id = %observer_id, event = %other, "unknown frame event");
            true
        }
    }
}

/// Forward one bus subscription into the session's outbound queue.
async fn pump(sub: Subscription, out: mpsc::Sender<Frame>) {
    while let Some(event) = sub.recv().await {
        let Some(frame) = frame_for(event) else {
            continue;
        };
        if out.send(frame).await.is_err() {
            break;
        }
    }
}

fn wire_measurement(m: &sb_core::measurement::Measurement) -> MeasurementPayload {
    MeasurementPayload {
        attribute_id: m.attribute_id.clone(),
        payload: m.payload.clone(),
        timestamp: m.timestamp_ms,
        event: m.event.clone(),
    }
}

/// Convert a bus event into its fan-out frame.
fn frame_for(event: BusEvent) -> Option<Frame> {
    match event {
        BusEvent::Measurement {
            sensor_id,
            measurement,
        } => Some(Frame::push(
            topics::data(&sensor_id),
            events::MEASUREMENT,
            serde_json::to_value(wire_measurement(&measurement)).ok()?,
        )),
        BusEvent::MeasurementBatch {
            sensor_id,
            measurements,
        } => {
            let items: Vec<MeasurementPayload> =
                measurements.iter().map(wire_measurement).collect();
            Some(Frame::push(
                topics::data(&sensor_id),
                events::MEASUREMENTS_BATCH,
                serde_json::to_value(items).ok()?,
            ))
        }
        BusEvent::NewState { sensor_id } => Some(Frame::push(
            topics::signal(&sensor_id),
            events::SENSOR_STATE,
            serde_json::json!({ "sensor_id": sensor_id }),
        )),
        BusEvent::AttentionChanged { .. } | BusEvent::SystemLoadChanged { .. } => None,
    }
}
