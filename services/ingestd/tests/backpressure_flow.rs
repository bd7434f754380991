//! Backpressure escalation end to end: attention changes and load spikes
//! must reach the connector as fresh configs, including the critical-load
//! pause and its recovery.

use ingestd::AppState;
use ingestd::auth::StaticTokenVerifier;
use sb_core::collab::NoopColdStorage;
use sb_core::config::{CoreConfig, PulseWeights};
use sb_core::load::SystemSampler;
use sb_protocol::{AttentionLevel, BackpressureConfigPayload, events};
use sb_test_utils::FrameClient;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Load sampler whose readings the test adjusts at will.
struct SharedSampler(Arc<Mutex<(f64, f64)>>);

impl SystemSampler for SharedSampler {
    fn cpu_total(&mut self) -> f64 {
        self.0.lock().unwrap().0
    }
    fn mem_pressure(&mut self) -> f64 {
        self.0.lock().unwrap().1
    }
}

fn fast_cfg() -> CoreConfig {
    CoreConfig {
        attention_tick: Duration::from_millis(50),
        load_sample_interval: Duration::from_millis(25),
        cpu_smoothing_samples: 1,
        // CPU-only weighting so the injected sampler decides the level.
        pulse_weights: PulseWeights {
            cpu: 1.0,
            bus: 0.0,
            mailbox: 0.0,
            mem: 0.0,
        },
        ..CoreConfig::default()
    }
}

async fn start_server(cfg: CoreConfig, readings: Arc<Mutex<(f64, f64)>>) -> SocketAddr {
    let verifier = Arc::new(StaticTokenVerifier::single("device-1", "tok-valid"));
    let state = AppState::with_sampler(
        cfg,
        verifier,
        Arc::new(NoopColdStorage),
        Box::new(SharedSampler(readings)),
    );
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

async fn join_observer(addr: SocketAddr, observer_id: &str) -> FrameClient {
    let mut client = FrameClient::connect(&format!("ws://{addr}/ws/v1/observers"))
        .await
        .unwrap();
    client
        .request_ok(
            &format!("connector:{observer_id}"),
            events::JOIN,
            json!({"observer_id": observer_id, "bearer_token": "tok-valid"}),
        )
        .await
        .unwrap();
    client
}

async fn next_config(client: &mut FrameClient) -> BackpressureConfigPayload {
    let frame = tokio::time::timeout(
        Duration::from_secs(3),
        client.next_event(events::BACKPRESSURE_CONFIG),
    )
    .await
    .expect("config within deadline")
    .unwrap();
    serde_json::from_value(frame.payload).unwrap()
}

/// Drain configs until `pred` matches, bounded by a deadline.
async fn config_matching(
    client: &mut FrameClient,
    pred: impl Fn(&BackpressureConfigPayload) -> bool,
) -> BackpressureConfigPayload {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let config = next_config(client).await;
            if pred(&config) {
                return config;
            }
        }
    })
    .await
    .expect("matching config within deadline")
}

#[tokio::test]
async fn registering_a_view_escalates_the_connector_config() {
    let readings = Arc::new(Mutex::new((0.0, 0.0)));
    let addr = start_server(fast_cfg(), readings).await;

    let mut connector = join_connector(addr, "S1").await;
    let initial = next_config(&mut connector).await;
    assert_eq!(initial.attention_level, AttentionLevel::None);
    assert_eq!(initial.recommended_batch_window_ms, 5000);
    assert_eq!(initial.recommended_batch_size, 20);

    let mut observer = join_observer(addr, "obs-1").await;
    observer
        .request_ok(
            "connector:obs-1",
            events::REGISTER_VIEW,
            json!({"sensor_id": "S1", "attribute_id": "heartrate"}),
        )
        .await
        .unwrap();

    let escalated = next_config(&mut connector).await;
    assert_eq!(escalated.attention_level, AttentionLevel::Medium);
    assert_eq!(escalated.recommended_batch_window_ms, 500);
    assert_eq!(escalated.recommended_batch_size, 5);
}

#[tokio::test]
async fn critical_load_pauses_low_attention_feeds_and_recovers() {
    let readings = Arc::new(Mutex::new((0.0, 0.0)));
    let addr = start_server(fast_cfg(), Arc::clone(&readings)).await;

    let mut connector = join_connector(addr, "S1").await;
    let initial = next_config(&mut connector).await;
    assert!(!initial.paused);

    // A viewer on a different sensor ranks S1 low.
    let mut observer = join_observer(addr, "obs-1").await;
    observer
        .request_ok(
            "connector:obs-1",
            events::REGISTER_VIEW,
            json!({"sensor_id": "S2", "attribute_id": "heartrate"}),
        )
        .await
        .unwrap();
    let low = config_matching(&mut connector, |c| {
        c.attention_level == AttentionLevel::Low
    })
    .await;
    assert_eq!(low.recommended_batch_window_ms, 2000);

    // Saturate the sampler: critical load + low attention pauses the feed
    // and stretches the window by the 5x multiplier.
    readings.lock().unwrap().0 = 1.0;
    let paused = config_matching(&mut connector, |c| c.paused).await;
    assert_eq!(paused.recommended_batch_window_ms, 10_000);
    assert_eq!(paused.recommended_batch_size, 10);
    assert_eq!(paused.load_multiplier, 5.0);

    // Recovery: load returns to normal, the pause lifts.
    readings.lock().unwrap().0 = 0.0;
    let resumed = config_matching(&mut connector, |c| !c.paused).await;
    assert_eq!(resumed.attention_level, AttentionLevel::Low);
    assert_eq!(resumed.recommended_batch_window_ms, 2000);
}
