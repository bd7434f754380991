//! Collaborator interfaces the engine consumes: token verification and the
//! cold-storage sink. The engine only depends on the traits; deployments
//! wire in their own implementations.

use crate::measurement::Measurement;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Identity derived from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
}

/// Verifies bearer tokens presented at join time.
///
/// Must be cheap and synchronous; the channel layer calls it inline and
/// does not cache failures.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Subject, String>;
}

/// Fire-and-forget sink for measurements displaced from the warm tier.
///
/// Not required for core correctness; implementations must not block the
/// caller for long and must swallow their own errors.
pub trait ColdStorage: Send + Sync {
    fn append(&self, sensor_id: &str, measurements: Vec<Measurement>);
}

/// Discards everything.
pub struct NoopColdStorage;

impl ColdStorage for NoopColdStorage {
    fn append(&self, _sensor_id: &str, _measurements: Vec<Measurement>) {}
}

/// Append-only JSONL spool file, one object per displaced measurement.
pub struct JsonlColdStorage {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlColdStorage {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ColdStorage for JsonlColdStorage {
    fn append(&self, sensor_id: &str, measurements: Vec<Measurement>) {
        let mut file = self.file.lock().expect("spool mutex poisoned");
        for m in measurements {
            let line = serde_json::json!({
                "sensor_id": sensor_id,
                "attribute_id": m.attribute_id,
                "payload": m.payload,
                "timestamp_ms": m.timestamp_ms,
            });
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(sensor_id, error = %e, "cold storage append failed");
                return;
            }
        }
        if let Err(e) = file.flush() {
            tracing::warn!(sensor_id, error = %e, "cold storage flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(ts: i64) -> Measurement {
        Measurement {
            attribute_id: "heartrate".to_owned(),
            payload: serde_json::json!(70 + ts),
            timestamp_ms: ts,
            event: None,
        }
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.jsonl");
        let sink = JsonlColdStorage::open(&path).unwrap();

        sink.append("S1", vec![m(1), m(2)]);
        sink.append("S1", vec![m(3)]);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["sensor_id"], "S1");
        assert_eq!(first["timestamp_ms"], 1);
    }
}
