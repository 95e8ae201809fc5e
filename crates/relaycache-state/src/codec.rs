//! Read-state wire codec
//!
//! Markers travel as a JSON array of compact entries `{g, k, t, r?}`
//! encrypted to the user's own key. The verbose legacy shape
//! `{group, kind, created_at, tag, ref}` is still accepted on decode.
//! Entries are validated one by one; a bad entry is dropped without
//! failing the batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use relaycache_core::{ConversationRef, Identity, Kind, ReadMarker, Timestamp, ValidationLimits};

use crate::error::{Result, StateError};

/// Tag recorded for compact entries that carry a reference
pub const EVENT_TAG: &str = "e";

/// Compact wire entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Conversation
    pub g: String,
    /// Kind
    pub k: Kind,
    /// Timestamp
    pub t: Timestamp,
    /// Reference, omitted when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
}

impl From<&ReadMarker> for WireEntry {
    fn from(marker: &ReadMarker) -> Self {
        Self {
            g: marker.conversation.as_str().to_owned(),
            k: marker.kind,
            t: marker.created_at,
            r: (!marker.reference.is_empty()).then(|| marker.reference.clone()),
        }
    }
}

impl From<WireEntry> for ReadMarker {
    fn from(entry: WireEntry) -> Self {
        let marker = ReadMarker::new(ConversationRef::new(entry.g), entry.k, entry.t);
        match entry.r {
            Some(reference) => marker.with_reference(EVENT_TAG, reference),
            None => marker,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    group: String,
    kind: Kind,
    created_at: Timestamp,
    #[serde(default)]
    tag: String,
    #[serde(default, rename = "ref")]
    reference: String,
}

impl From<LegacyEntry> for ReadMarker {
    fn from(entry: LegacyEntry) -> Self {
        ReadMarker::new(ConversationRef::new(entry.group), entry.kind, entry.created_at)
            .with_reference(entry.tag, entry.reference)
    }
}

/// Outcome of decoding a payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Entries that passed validation, in payload order
    pub markers: Vec<ReadMarker>,
    /// Number of entries rejected
    pub dropped: usize,
}

/// Detected entry shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Compact,
    Legacy,
}

struct ShapeFields {
    conversation: &'static str,
    kind: &'static str,
    created_at: &'static str,
    strings: &'static [&'static str],
}

impl Shape {
    fn detect(entry: &Map<String, Value>) -> Option<Self> {
        if entry.contains_key("g") {
            Some(Shape::Compact)
        } else if entry.contains_key("group") {
            Some(Shape::Legacy)
        } else {
            None
        }
    }

    fn fields(self) -> ShapeFields {
        match self {
            Shape::Compact => ShapeFields {
                conversation: "g",
                kind: "k",
                created_at: "t",
                strings: &["r"],
            },
            Shape::Legacy => ShapeFields {
                conversation: "group",
                kind: "kind",
                created_at: "created_at",
                strings: &["tag", "ref"],
            },
        }
    }
}

/// Encode markers as compact wire entries
pub fn encode(markers: &[ReadMarker]) -> Vec<WireEntry> {
    markers.iter().map(WireEntry::from).collect()
}

/// Encode markers as the plaintext JSON payload
pub fn encode_json(markers: &[ReadMarker]) -> Result<String> {
    Ok(serde_json::to_string(&encode(markers))?)
}

/// Check one entry of either shape against `limits`
pub fn validate_entry(entry: &Value, now: Timestamp, limits: &ValidationLimits) -> bool {
    let Some(object) = entry.as_object() else {
        return false;
    };
    let Some(shape) = Shape::detect(object) else {
        return false;
    };
    let fields = shape.fields();

    let bounded = |s: &str| s.chars().count() < limits.max_field_len;

    match object.get(fields.conversation).and_then(Value::as_str) {
        Some(conversation) if !conversation.is_empty() && bounded(conversation) => {}
        _ => return false,
    }

    match object.get(fields.kind).and_then(Value::as_u64) {
        Some(kind) if Kind::try_from(kind).is_ok() => {}
        _ => return false,
    }

    match object.get(fields.created_at).and_then(Value::as_i64) {
        Some(ts) if limits.timestamp_in_range(ts, now) => {}
        _ => return false,
    }

    fields.strings.iter().all(|name| match object.get(*name) {
        None => true,
        Some(Value::String(s)) => bounded(s),
        Some(_) => false,
    })
}

fn decode_entry(entry: Value, now: Timestamp, limits: &ValidationLimits) -> Option<ReadMarker> {
    if !validate_entry(&entry, now, limits) {
        return None;
    }
    let shape = entry.as_object().and_then(Shape::detect)?;
    let decoded = match shape {
        Shape::Compact => serde_json::from_value::<WireEntry>(entry).map(ReadMarker::from),
        Shape::Legacy => serde_json::from_value::<LegacyEntry>(entry).map(ReadMarker::from),
    };
    decoded.ok()
}

/// Decode a plaintext payload, dropping invalid entries
pub fn decode(payload: &str, now: Timestamp, limits: &ValidationLimits) -> Result<DecodeReport> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| StateError::MalformedPayload(e.to_string()))?;

    let Value::Array(entries) = value else {
        return Err(StateError::MalformedPayload(
            "top-level value is not an array".to_string(),
        ));
    };

    let mut report = DecodeReport::default();
    for entry in entries {
        match decode_entry(entry, now, limits) {
            Some(marker) => report.markers.push(marker),
            None => report.dropped += 1,
        }
    }

    if report.dropped > 0 {
        warn!(
            kept = report.markers.len(),
            dropped = report.dropped,
            "Dropped invalid read-state entries"
        );
    } else {
        debug!(entries = report.markers.len(), "Decoded read-state payload");
    }

    Ok(report)
}

/// Encode and encrypt markers to the identity's own key
pub async fn encrypt_for_self<I: Identity + ?Sized>(
    identity: &I,
    markers: &[ReadMarker],
) -> Result<String> {
    let plaintext = encode_json(markers)?;
    Ok(identity.encrypt_to_self(&plaintext).await?)
}

/// Decrypt a self-encrypted payload and decode it
pub async fn decrypt_from_self<I: Identity + ?Sized>(
    identity: &I,
    ciphertext: &str,
    now: Timestamp,
    limits: &ValidationLimits,
) -> Result<DecodeReport> {
    let plaintext = identity.decrypt_from_self(ciphertext).await?;
    decode(&plaintext, now, limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: Timestamp = 1_700_000_000;

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    #[test]
    fn test_encode_omits_empty_reference() {
        let markers = vec![
            ReadMarker::new("relay1'group9", 9, NOW),
            ReadMarker::new("a,b", 14, NOW - 5).with_reference("e", "abc"),
        ];
        let json = encode_json(&markers).unwrap();
        assert_eq!(
            json,
            r#"[{"g":"relay1'group9","k":9,"t":1700000000},{"g":"a,b","k":14,"t":1699999995,"r":"abc"}]"#
        );
    }

    #[test]
    fn test_round_trip() {
        let markers = vec![
            ReadMarker::new("relay1'group9", 9, NOW),
            ReadMarker::new("relay1'group9", 7, NOW - 60).with_reference("e", "ev1"),
        ];
        let report = decode(&encode_json(&markers).unwrap(), NOW, &limits()).unwrap();
        assert_eq!(report.dropped, 0);
        assert_eq!(report.markers, markers);
    }

    #[test]
    fn test_legacy_matches_compact() {
        let legacy = json!([
            {"group": "relay1'group9", "kind": 9, "created_at": NOW, "tag": "e", "ref": "ev1"},
            {"group": "relay2'x", "kind": 9, "created_at": NOW - 1, "tag": "", "ref": ""}
        ]);
        let compact = json!([
            {"g": "relay1'group9", "k": 9, "t": NOW, "r": "ev1"},
            {"g": "relay2'x", "k": 9, "t": NOW - 1}
        ]);

        let a = decode(&legacy.to_string(), NOW, &limits()).unwrap();
        let b = decode(&compact.to_string(), NOW, &limits()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mixed_shapes_in_one_payload() {
        let payload = json!([
            {"g": "c1", "k": 9, "t": NOW},
            {"group": "c2", "kind": 9, "created_at": NOW}
        ]);
        let report = decode(&payload.to_string(), NOW, &limits()).unwrap();
        assert_eq!(report.markers.len(), 2);
    }

    #[test]
    fn test_timestamp_boundaries() {
        let at = |t: i64| json!({"g": "c", "k": 9, "t": t});
        assert!(validate_entry(&at(NOW + 300), NOW, &limits()));
        assert!(!validate_entry(&at(NOW + 301), NOW, &limits()));
        assert!(validate_entry(&at(1_577_836_800), NOW, &limits()));
        assert!(!validate_entry(&at(1_577_836_799), NOW, &limits()));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let long = "x".repeat(1000);
        let just_fits = "x".repeat(999);
        assert!(!validate_entry(&json!({"g": long, "k": 9, "t": NOW}), NOW, &limits()));
        assert!(validate_entry(&json!({"g": just_fits, "k": 9, "t": NOW}), NOW, &limits()));
        assert!(!validate_entry(&json!({"g": "c", "k": -1, "t": NOW}), NOW, &limits()));
        assert!(!validate_entry(&json!({"g": "c", "k": 9.5, "t": NOW}), NOW, &limits()));
        assert!(!validate_entry(&json!({"g": "c", "k": "9", "t": NOW}), NOW, &limits()));
        assert!(!validate_entry(&json!({"g": "", "k": 9, "t": NOW}), NOW, &limits()));
        assert!(!validate_entry(&json!({"g": "c", "k": 9, "t": NOW, "r": 5}), NOW, &limits()));
        assert!(!validate_entry(&json!({"kind": 9}), NOW, &limits()));
        assert!(!validate_entry(&json!("c"), NOW, &limits()));
    }

    #[test]
    fn test_invalid_entries_are_counted() {
        let payload = json!([
            {"g": "ok", "k": 9, "t": NOW},
            {"g": "future", "k": 9, "t": NOW + 10_000},
            42
        ]);
        let report = decode(&payload.to_string(), NOW, &limits()).unwrap();
        assert_eq!(report.markers.len(), 1);
        assert_eq!(report.dropped, 2);
    }

    #[test]
    fn test_rejects_non_array_payload() {
        assert!(matches!(
            decode(r#"{"g":"c"}"#, NOW, &limits()),
            Err(StateError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode("not json", NOW, &limits()),
            Err(StateError::MalformedPayload(_))
        ));
    }
}
