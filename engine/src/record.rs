//! Record types: encoded field maps, model status and the persisted local shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An encoded field map, the unit exchanged with every collaborator.
pub type Record = Map<String, Value>;

/// Marker holding the model status in a persisted record.
pub const STATUS_MARKER: &str = "$status";
/// Marker holding the last acknowledged remote snapshot.
pub const SAVED_MARKER: &str = "$saved";
/// Marker holding the payload of an outstanding remote save.
pub const SAVING_MARKER: &str = "$saving";
/// Marker holding the payload of an outstanding live broadcast.
pub const PUBLISH_MARKER: &str = "$publish";

/// Synchronization status of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    /// Local and remote agree.
    #[default]
    Synced,
    /// A remote save is outstanding.
    SavePending,
    /// A remote removal is outstanding.
    RemovePending,
    /// The model is gone everywhere.
    Removed,
}

impl Status {
    /// Whether work remains to be pushed to the remote service.
    pub fn is_pending(self) -> bool {
        matches!(self, Status::SavePending | Status::RemovePending)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Synced => 0,
            Status::SavePending => 1,
            Status::RemovePending => 2,
            Status::Removed => 3,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Synced),
            1 => Ok(Status::SavePending),
            2 => Ok(Status::RemovePending),
            3 => Ok(Status::Removed),
            other => Err(format!("unknown model status: {other}")),
        }
    }
}

/// Which subsystems an action may reach.
///
/// Flags combine: `LOCAL | REST` reaches storage and the REST service but
/// does not publish on the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const LOCAL: Cascade = Cascade(1);
    pub const REST: Cascade = Cascade(2);
    pub const NO_LIVE: Cascade = Cascade(3);
    pub const LIVE: Cascade = Cascade(4);
    pub const NO_REST: Cascade = Cascade(5);
    pub const REMOTE: Cascade = Cascade(6);
    pub const ALL: Cascade = Cascade(7);

    /// Whether any subsystem in `other` is reachable.
    pub fn allows(self, other: Cascade) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade::ALL
    }
}

impl std::ops::BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        Cascade(self.0 | rhs.0)
    }
}

/// The record shape written to local storage.
///
/// Holds the encoded fields plus the hidden markers that drive resumption
/// after a restart.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalRecord {
    pub fields: Record,
    pub status: Status,
    pub saved: Option<Record>,
    pub saving: Option<Record>,
    pub publish: Option<Record>,
}

impl LocalRecord {
    pub fn new(fields: Record, status: Status) -> Self {
        Self {
            fields,
            status,
            ..Self::default()
        }
    }

    /// Flatten into the map handed to storage.
    pub fn to_record(&self) -> Record {
        let mut out = self.fields.clone();
        out.insert(STATUS_MARKER.into(), Value::from(u8::from(self.status)));
        if let Some(saved) = &self.saved {
            out.insert(SAVED_MARKER.into(), Value::Object(saved.clone()));
        }
        if let Some(saving) = &self.saving {
            out.insert(SAVING_MARKER.into(), Value::Object(saving.clone()));
        }
        if let Some(publish) = &self.publish {
            out.insert(PUBLISH_MARKER.into(), Value::Object(publish.clone()));
        }
        out
    }

    /// Split a stored map back into fields and markers.
    ///
    /// Unknown statuses fall back to `Synced`; unknown `$` keys are dropped.
    pub fn from_record(mut record: Record) -> Self {
        let status = record
            .remove(STATUS_MARKER)
            .and_then(|v| v.as_u64())
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| Status::try_from(n).ok())
            .unwrap_or_default();
        let saved = take_object(&mut record, SAVED_MARKER);
        let saving = take_object(&mut record, SAVING_MARKER);
        let publish = take_object(&mut record, PUBLISH_MARKER);
        record.retain(|k, _| !is_marker(k));

        Self {
            fields: record,
            status,
            saved,
            saving,
            publish,
        }
    }
}

fn take_object(record: &mut Record, marker: &str) -> Option<Record> {
    match record.remove(marker) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Whether a property name is a hidden marker rather than a field.
pub fn is_marker(name: &str) -> bool {
    name.starts_with('$')
}

/// Render a key field value as a key component.
///
/// Returns `None` for null and for structured values, which cannot key a model.
pub fn key_component(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether a value counts as "no value" for key and relation purposes.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn status_codes() {
        for status in [
            Status::Synced,
            Status::SavePending,
            Status::RemovePending,
            Status::Removed,
        ] {
            assert_eq!(Status::try_from(u8::from(status)), Ok(status));
        }
        assert!(Status::try_from(9).is_err());
        assert!(Status::SavePending.is_pending());
        assert!(!Status::Removed.is_pending());
    }

    #[test]
    fn status_serializes_as_number() {
        let json = serde_json::to_string(&Status::RemovePending).unwrap();
        assert_eq!(json, "2");
    }

    #[test]
    fn cascade_flags() {
        assert!(Cascade::ALL.allows(Cascade::REST));
        assert!(Cascade::NO_LIVE.allows(Cascade::LOCAL));
        assert!(!Cascade::NO_LIVE.allows(Cascade::LIVE));
        assert!(!Cascade::NONE.allows(Cascade::ALL));
        assert_eq!(Cascade::LOCAL | Cascade::REST, Cascade::NO_LIVE);
    }

    #[test]
    fn local_record_markers() {
        let mut local = LocalRecord::new(record(json!({"id": 1, "name": "a"})), Status::SavePending);
        local.saving = Some(record(json!({"name": "a"})));

        let stored = local.to_record();
        assert_eq!(stored["$status"], json!(1));
        assert_eq!(stored["$saving"], json!({"name": "a"}));
        assert!(!stored.contains_key("$saved"));
        assert!(!stored.contains_key("$publish"));

        let parsed = LocalRecord::from_record(stored);
        assert_eq!(parsed, local);
    }

    #[test]
    fn from_record_drops_unknown_markers() {
        let parsed = LocalRecord::from_record(record(json!({"id": 1, "$weird": true, "$status": 77})));
        assert_eq!(parsed.status, Status::Synced);
        assert_eq!(parsed.fields, record(json!({"id": 1})));
    }

    #[test]
    fn key_components() {
        assert_eq!(key_component(&json!("a")), Some("a".into()));
        assert_eq!(key_component(&json!(12)), Some("12".into()));
        assert_eq!(key_component(&json!(null)), None);
        assert_eq!(key_component(&json!({"x": 1})), None);
    }
}
