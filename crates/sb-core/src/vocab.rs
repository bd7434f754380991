//! Safe-key validation: untrusted wire maps are coerced to closed
//! vocabularies before they touch any long-lived table.
//!
//! Unknown keys are rejected rather than widening the vocabulary; this
//! cements the wire contract and keeps adversarial input from growing the
//! per-sensor identifier tables.

use crate::error::CoreError;
use crate::measurement::Measurement;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

/// Actions accepted by `update_attributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateAction {
    Add,
    Remove,
    Update,
}

impl UpdateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateAction::Add => "add",
            UpdateAction::Remove => "remove",
            UpdateAction::Update => "update",
        }
    }
}

impl FromStr for UpdateAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "add" => Ok(UpdateAction::Add),
            "remove" => Ok(UpdateAction::Remove),
            "update" => Ok(UpdateAction::Update),
            other => Err(CoreError::InvalidAction(other.to_owned())),
        }
    }
}

/// The closed key set of a measurement object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeasurementField {
    AttributeId,
    Payload,
    Timestamp,
    Event,
}

impl MeasurementField {
    /// Required on every measurement; `Event` is optional.
    pub const REQUIRED: [MeasurementField; 3] = [
        MeasurementField::AttributeId,
        MeasurementField::Payload,
        MeasurementField::Timestamp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementField::AttributeId => "attribute_id",
            MeasurementField::Payload => "payload",
            MeasurementField::Timestamp => "timestamp",
            MeasurementField::Event => "event",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "attribute_id" => Some(MeasurementField::AttributeId),
            "payload" => Some(MeasurementField::Payload),
            "timestamp" => Some(MeasurementField::Timestamp),
            "event" => Some(MeasurementField::Event),
            _ => None,
        }
    }
}

/// Coerce an untrusted JSON object to enum keys.
///
/// Rejects unknown keys and requires every field in
/// [`MeasurementField::REQUIRED`]. Idempotent: re-validating the keys of an
/// accepted map yields the same result.
pub fn safe_keys_to_enum(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<BTreeMap<MeasurementField, serde_json::Value>, CoreError> {
    let mut out = BTreeMap::new();
    for (key, value) in map {
        let field =
            MeasurementField::from_key(key).ok_or_else(|| CoreError::UnknownField(key.clone()))?;
        out.insert(field, value.clone());
    }
    let missing: Vec<&str> = MeasurementField::REQUIRED
        .iter()
        .filter(|f| !out.contains_key(f))
        .map(|f| f.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::MissingFields {
            fields: missing.join(", "),
        });
    }
    Ok(out)
}

/// The deployment's closed attribute-id vocabulary. Built once from
/// configuration, immutable at runtime.
#[derive(Debug, Clone)]
pub struct AttributeVocabulary {
    entries: HashSet<String>,
}

/// Attribute kinds whose payloads must be numeric or a structured record.
const NUMERIC_KINDS: [&str; 8] = [
    "heartrate",
    "hr",
    "ecg",
    "imu",
    "pressure",
    "temperature",
    "battery",
    "humidity",
];

impl AttributeVocabulary {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, attribute_id: &str) -> bool {
        self.entries.contains(attribute_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accept `attribute_id` or fail with `InvalidAttributeId`.
    pub fn validate<'a>(&self, attribute_id: &'a str) -> Result<&'a str, CoreError> {
        if self.contains(attribute_id) {
            Ok(attribute_id)
        } else {
            Err(CoreError::InvalidAttributeId(attribute_id.to_owned()))
        }
    }

    /// Full measurement validation: vocabulary membership plus the payload
    /// shape rule for well-known numeric kinds.
    pub fn validate_measurement(&self, m: &Measurement) -> Result<(), CoreError> {
        self.validate(&m.attribute_id)?;
        if NUMERIC_KINDS.contains(&m.attribute_id.as_str())
            && !(m.payload.is_number() || m.payload.is_object() || m.payload.is_array())
        {
            return Err(CoreError::InvalidPayload {
                attribute_id: m.attribute_id.clone(),
            });
        }
        Ok(())
    }

    /// Parse a wire measurement object through the closed key vocabulary.
    pub fn measurement_from_value(
        &self,
        value: &serde_json::Value,
    ) -> Result<Measurement, CoreError> {
        let map = value.as_object().ok_or(CoreError::MissingFields {
            fields: "payload, timestamp, attribute_id".to_owned(),
        })?;
        let fields = safe_keys_to_enum(map)?;

        let attribute_id = fields[&MeasurementField::AttributeId]
            .as_str()
            .ok_or_else(|| CoreError::MissingFields {
                fields: "attribute_id".to_owned(),
            })?;
        let timestamp_ms = fields[&MeasurementField::Timestamp].as_i64().ok_or(
            CoreError::MissingFields {
                fields: "timestamp".to_owned(),
            },
        )?;
        let event = match fields.get(&MeasurementField::Event) {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| CoreError::UnknownField("event".to_owned()))?
                    .to_owned(),
            ),
        };

        let m = Measurement {
            attribute_id: attribute_id.to_owned(),
            payload: fields[&MeasurementField::Payload].clone(),
            timestamp_ms,
            event,
        };
        self.validate_measurement(&m)?;
        Ok(m)
    }
}

impl Default for AttributeVocabulary {
    /// The stock deployment vocabulary.
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_VOCABULARY.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vocab() -> AttributeVocabulary {
        AttributeVocabulary::default()
    }

    #[test]
    fn action_parse_accepts_only_the_three_verbs() {
        assert_eq!("add".parse::<UpdateAction>().unwrap(), UpdateAction::Add);
        assert_eq!(
            "remove".parse::<UpdateAction>().unwrap(),
            UpdateAction::Remove
        );
        assert_eq!(
            "update".parse::<UpdateAction>().unwrap(),
            UpdateAction::Update
        );
        assert!(matches!(
            "delete".parse::<UpdateAction>(),
            Err(CoreError::InvalidAction(a)) if a == "delete"
        ));
    }

    #[test]
    fn safe_keys_rejects_unknown_keys() {
        let map = json!({"attribute_id": "heartrate", "payload": 72, "timestamp": 1, "evil": 1});
        let err = safe_keys_to_enum(map.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::UnknownField(k) if k == "evil"));
    }

    #[test]
    fn safe_keys_requires_all_required_fields() {
        let map = json!({"attribute_id": "heartrate"});
        let err = safe_keys_to_enum(map.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::MissingFields { fields } if fields.contains("payload")));
    }

    #[test]
    fn safe_keys_is_idempotent() {
        let map = json!({"attribute_id": "heartrate", "payload": 72, "timestamp": 1000});
        let once = safe_keys_to_enum(map.as_object().unwrap()).unwrap();
        // Re-validate the accepted key set: same result.
        let back: serde_json::Map<String, serde_json::Value> = once
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
            .collect();
        let twice = safe_keys_to_enum(&back).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn measurement_from_value_happy_path() {
        let m = vocab()
            .measurement_from_value(&json!({
                "attribute_id": "heartrate", "payload": 72, "timestamp": 1000
            }))
            .unwrap();
        assert_eq!(m.attribute_id, "heartrate");
        assert_eq!(m.timestamp_ms, 1000);
        assert_eq!(m.event, None);
    }

    #[test]
    fn measurement_from_value_rejects_unknown_attribute() {
        let err = vocab()
            .measurement_from_value(&json!({
                "attribute_id": "bogus", "payload": 0, "timestamp": 2001
            }))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAttributeId(a) if a == "bogus"));
    }

    #[test]
    fn numeric_kinds_reject_non_numeric_scalar_payloads() {
        let err = vocab()
            .measurement_from_value(&json!({
                "attribute_id": "heartrate", "payload": "fast", "timestamp": 1
            }))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));

        // Structured records are fine.
        vocab()
            .measurement_from_value(&json!({
                "attribute_id": "imu",
                "payload": {"x": 0.1, "y": 0.2, "z": 9.8},
                "timestamp": 1
            }))
            .unwrap();
    }

    #[test]
    fn non_numeric_kinds_accept_opaque_payloads() {
        vocab()
            .measurement_from_value(&json!({
                "attribute_id": "button", "payload": "down", "timestamp": 1, "event": "press"
            }))
            .unwrap();
    }

    #[test]
    fn vocabulary_is_closed_over_construction() {
        let v = AttributeVocabulary::new(["heartrate"]);
        assert!(v.contains("heartrate"));
        assert!(!v.contains("temperature"));
        assert_eq!(v.len(), 1);
    }
}
