/// Contract golden tests: parse literal JSON frames exactly as a client would
/// send them, serialize back, and verify round-trip fidelity plus the typed
/// payload schema behind each event.
use sb_protocol::*;

/// Helper: deserialize a frame, re-serialize, and assert structural equality.
fn round_trip(json_text: &str) -> Frame {
    let frame: Frame = serde_json::from_str(json_text).expect("frame should deserialize");
    let serialized = serde_json::to_string(&frame).expect("frame should serialize");

    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch");
    frame
}

#[test]
fn join_frame_round_trip() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"join","payload":{"connector_id":"conn-1","sensor_id":"S1","sensor_name":"Chest strap","sensor_type":"biometric","attributes":["heartrate","ecg"],"sampling_rate":250,"batch_size":10,"bearer_token":"tok-abc"},"ref":"1"}"#,
    );
    assert_eq!(frame.event, events::JOIN);
    let join: JoinPayload = serde_json::from_value(frame.payload).expect("join payload schema");
    assert_eq!(join.connector_id, "conn-1");
    assert_eq!(join.sensor_id.as_deref(), Some("S1"));
    assert_eq!(join.attributes, vec!["heartrate", "ecg"]);
    assert_eq!(join.sampling_rate, Some(250));
}

#[test]
fn join_payload_optional_fields_default() {
    let join: JoinPayload = serde_json::from_str(
        r#"{"connector_id":"conn-1","bearer_token":"tok"}"#,
    )
    .expect("minimal join should parse");
    assert_eq!(join.sensor_id, None);
    assert!(join.attributes.is_empty());
}

#[test]
fn measurement_frame_round_trip() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"measurement","payload":{"attribute_id":"heartrate","payload":72,"timestamp":1000}}"#,
    );
    assert_eq!(frame.frame_ref, None);
    let m: MeasurementPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(m.attribute_id, "heartrate");
    assert_eq!(m.payload, serde_json::json!(72));
    assert_eq!(m.timestamp, 1000);
    assert_eq!(m.event, None);
}

#[test]
fn measurement_with_edge_event_round_trip() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"measurement","payload":{"attribute_id":"button","payload":1,"timestamp":2000,"event":"press"}}"#,
    );
    let m: MeasurementPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(m.event.as_deref(), Some("press"));
}

#[test]
fn measurements_batch_is_a_plain_array() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"measurements_batch","payload":[{"attribute_id":"heartrate","payload":60,"timestamp":2000},{"attribute_id":"pressure","payload":1013.2,"timestamp":2001}],"ref":"9"}"#,
    );
    let batch: Vec<MeasurementPayload> = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[1].attribute_id, "pressure");
}

#[test]
fn update_attributes_round_trip() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"update_attributes","payload":{"action":"add","attribute_id":"temperature","metadata":{"unit":"celsius"}},"ref":"2"}"#,
    );
    let upd: UpdateAttributesPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(upd.action, "add");
    assert_eq!(upd.metadata["unit"], "celsius");
}

#[test]
fn backpressure_config_round_trip_uses_spec_field_names() {
    let frame = round_trip(
        r#"{"topic":"sensor:S1","event":"backpressure_config","payload":{"attention_level":"medium","system_load":"normal","paused":false,"recommended_batch_window_ms":500,"recommended_batch_size":5,"load_multiplier":1.0,"timestamp":1700000000000}}"#,
    );
    let cfg: BackpressureConfigPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(cfg.attention_level, AttentionLevel::Medium);
    assert_eq!(cfg.system_load, SystemLoadLevel::Normal);
    assert_eq!(cfg.recommended_batch_window_ms, 500);
    assert_eq!(cfg.recommended_batch_size, 5);
    assert!(!cfg.paused);
}

#[test]
fn reply_ok_and_error_shapes() {
    let ok: ReplyPayload = serde_json::from_str(r#"{"status":"ok","response":{"echo":1}}"#).unwrap();
    assert_eq!(ok.status, ReplyStatus::Ok);

    let err = ReplyPayload::error(ErrorBody {
        code: error_codes::INVALID_BATCH.to_owned(),
        message: "all 3 measurements failed validation".to_owned(),
        failed_count: Some(3),
    });
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["response"]["code"], "invalid_batch");
    assert_eq!(json["response"]["failed_count"], 3);
}

#[test]
fn attention_signal_frames_round_trip() {
    let frame = round_trip(
        r#"{"topic":"connector:obs-1","event":"register_view","payload":{"sensor_id":"S1","attribute_id":"heartrate"}}"#,
    );
    let signal: AttentionSignalPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(signal.sensor_id, "S1");

    let frame = round_trip(
        r#"{"topic":"connector:obs-1","event":"report_battery","payload":{"state":"critical"}}"#,
    );
    let battery: BatteryPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(battery.state, BatteryState::Critical);
}

#[test]
fn levels_serialize_lowercase() {
    assert_eq!(
        serde_json::to_string(&AttentionLevel::High).unwrap(),
        "\"high\""
    );
    assert_eq!(
        serde_json::to_string(&SystemLoadLevel::Critical).unwrap(),
        "\"critical\""
    );
}
