//! Disconnect/reconnect coalescing: a quick reconnect lands on the same
//! actor, preserving state, with no teardown or state churn visible to
//! observers.

use ingestd::AppState;
use ingestd::auth::StaticTokenVerifier;
use sb_core::collab::NoopColdStorage;
use sb_core::config::CoreConfig;
use sb_protocol::events;
use sb_test_utils::FrameClient;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_server() -> SocketAddr {
    let verifier = Arc::new(StaticTokenVerifier::single("device-1", "tok-valid"));
    let state = AppState::new(CoreConfig::default(), verifier, Arc::new(NoopColdStorage));
    let router = ingestd::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

async fn join_connector(addr: SocketAddr, sensor_id: &str) -> FrameClient {
    let mut client = FrameClient::connect(&format!("ws://{addr}/ws/v1/connectors"))
        .await
        .unwrap();
    client
        .request_ok(
            &format!("sensor:{sensor_id}"),
            events::JOIN,
            json!({
                "connector_id": "conn-1",
                "sensor_id": sensor_id,
                "bearer_token": "tok-valid",
            }),
        )
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn quick_reconnect_preserves_actor_state_without_churn() {
    let addr = start_server().await;

    let mut observer = FrameClient::connect(&format!("ws://{addr}/ws/v1/observers"))
        .await
        .unwrap();
    observer
        .request_ok(
            "connector:obs-1",
            events::JOIN,
            json!({"observer_id": "obs-1", "bearer_token": "tok-valid"}),
        )
        .await
        .unwrap();
    observer
        .request_ok("connector:obs-1", events::WATCH, json!({"sensor_id": "S1"}))
        .await
        .unwrap();

    // Session A ingests one measurement, then disconnects.
    let mut session_a = join_connector(addr, "S1").await;
    session_a
        .request_ok(
            "sensor:S1",
            events::MEASUREMENT,
            json!({"attribute_id": "heartrate", "payload": 72, "timestamp": 1000}),
        )
        .await
        .unwrap();
    // Drain the first-sight state signal so later silence is meaningful.
    tokio::time::timeout(
        Duration::from_secs(2),
        observer.next_event(events::SENSOR_STATE),
    )
    .await
    .unwrap()
    .unwrap();
    session_a.close().await.unwrap();

    // Session B arrives well inside the grace interval.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _session_b = join_connector(addr, "S1").await;

    // Past every grace deadline now; the actor must have survived with its
    // state (including `last`) intact.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = observer
        .request_ok("connector:obs-1", events::WATCH, json!({"sensor_id": "S1"}))
        .await
        .unwrap();
    assert_eq!(response["snapshot"]["last"]["heartrate"]["payload"], 72);
    assert_eq!(response["snapshot"]["last"]["heartrate"]["timestamp_ms"], 1000);

    // No NewState churn reached the observer during the handover.
    let silent = tokio::time::timeout(
        Duration::from_millis(200),
        observer.next_event(events::SENSOR_STATE),
    )
    .await;
    assert!(silent.is_err(), "observer saw sensor_state churn");
}

#[tokio::test]
async fn slow_reconnect_gets_a_fresh_actor() {
    let addr = start_server().await;

    let mut session_a = join_connector(addr, "S1").await;
    session_a
        .request_ok(
            "sensor:S1",
            events::MEASUREMENT,
            json!({"attribute_id": "heartrate", "payload": 72, "timestamp": 1000}),
        )
        .await
        .unwrap();
    session_a.close().await.unwrap();

    // Well past the disconnect grace and release grace with no observers:
    // the actor is torn down and the next join starts clean.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut session_b = join_connector(addr, "S1").await;
    let response = session_b
        .request_ok(
            "sensor:S1",
            events::MEASUREMENT,
            json!({"attribute_id": "heartrate", "payload": 80, "timestamp": 2000}),
        )
        .await
        .unwrap();
    assert_eq!(response, json!({}));

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/sensors"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // Only the post-restart ingest is counted.
    assert_eq!(body["sensors"][0]["ingest_total"], 1);
}
