//! Collaborator contracts: local storage, REST transport and the live channel.
//!
//! The engine performs no IO of its own. Every call hands over single-fire
//! completion callbacks which may run synchronously, later, or on another
//! thread; the engine makes no assumption either way.

use crate::{Key, Model, Record, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Status reported when the remote service could not be reached at all.
pub const NETWORK_UNREACHABLE: u16 = 0;

pub type PutSuccess = Box<dyn FnOnce(Key, Record) + Send>;
pub type PutFailure = Box<dyn FnOnce(Key, Record, StoreError) + Send>;
pub type GetSuccess = Box<dyn FnOnce(Key, Option<Record>) + Send>;
pub type KeyFailure = Box<dyn FnOnce(Key, StoreError) + Send>;
pub type RemoveSuccess = Box<dyn FnOnce(Key, Option<Record>) + Send>;
pub type AllSuccess = Box<dyn FnOnce(Vec<Record>, Vec<Key>) + Send>;
pub type AllFailure = Box<dyn FnOnce(StoreError) + Send>;

/// Local persistence for one entity type.
///
/// Records must round-trip exactly, hidden `$` markers included.
pub trait Store: Send + Sync {
    fn put(&self, key: Key, record: Record, on_success: PutSuccess, on_failure: PutFailure);
    fn get(&self, key: Key, on_success: GetSuccess, on_failure: KeyFailure);
    fn remove(&self, key: Key, on_success: RemoveSuccess, on_failure: KeyFailure);
    fn all(&self, on_success: AllSuccess, on_failure: AllFailure);
}

pub type RecordSuccess = Box<dyn FnOnce(Option<Record>) + Send>;
pub type RecordFailure = Box<dyn FnOnce(Option<Record>, u16) + Send>;
pub type ListSuccess = Box<dyn FnOnce(Vec<Record>) + Send>;
pub type ListFailure = Box<dyn FnOnce(Vec<Record>, u16) + Send>;

/// Remote transport for one entity type.
///
/// Failures carry the HTTP status, or [`NETWORK_UNREACHABLE`].
pub trait Rest: Send + Sync {
    fn all(&self, on_success: ListSuccess, on_failure: ListFailure);
    fn get(&self, model: &Model, on_success: RecordSuccess, on_failure: RecordFailure);
    fn create(
        &self,
        model: &Model,
        encoded: Record,
        on_success: RecordSuccess,
        on_failure: RecordFailure,
    );
    fn update(
        &self,
        model: &Model,
        encoded: Record,
        on_success: RecordSuccess,
        on_failure: RecordFailure,
    );
    fn remove(&self, model: &Model, on_success: RecordSuccess, on_failure: RecordFailure);
    fn query(&self, query: Value, on_success: ListSuccess, on_failure: ListFailure);
}

/// How the engine reacts to a failed REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestFailure {
    /// Network unreachable: suspend until the next online transition.
    Offline,
    /// 409: the response body is merged like a success.
    Conflict,
    /// 404 or 410: the remote record no longer exists.
    Gone,
    /// Anything else: terminal for this attempt.
    Rejected(u16),
}

impl RestFailure {
    pub fn classify(status: u16) -> Self {
        match status {
            NETWORK_UNREACHABLE => RestFailure::Offline,
            409 => RestFailure::Conflict,
            404 | 410 => RestFailure::Gone,
            other => RestFailure::Rejected(other),
        }
    }
}

/// Kind of a live message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveOp {
    Save,
    Remove,
}

/// A message exchanged on the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    pub op: LiveOp,
    pub key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Record>,
}

impl LiveMessage {
    pub fn save(key: impl Into<Key>, model: Record) -> Self {
        Self {
            op: LiveOp::Save,
            key: key.into(),
            model: Some(model),
        }
    }

    pub fn remove(key: impl Into<Key>) -> Self {
        Self {
            op: LiveOp::Remove,
            key: key.into(),
            model: None,
        }
    }
}

/// Publishing half of a live channel.
pub trait Live: Send + Sync {
    fn publish(&self, message: LiveMessage);
}

/// Callback the live channel invokes for every inbound message.
pub type LiveReceiver = Arc<dyn Fn(LiveMessage) + Send + Sync>;

/// Factory producing the three collaborators for each entity type.
pub trait Backend: Send + Sync {
    fn store(&self, entity: &str) -> Arc<dyn Store>;
    fn rest(&self, entity: &str) -> Arc<dyn Rest>;
    fn live(&self, entity: &str, receiver: LiveReceiver) -> Arc<dyn Live>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_statuses() {
        assert_eq!(RestFailure::classify(0), RestFailure::Offline);
        assert_eq!(RestFailure::classify(409), RestFailure::Conflict);
        assert_eq!(RestFailure::classify(404), RestFailure::Gone);
        assert_eq!(RestFailure::classify(410), RestFailure::Gone);
        assert_eq!(RestFailure::classify(422), RestFailure::Rejected(422));
        assert_eq!(RestFailure::classify(500), RestFailure::Rejected(500));
    }

    #[test]
    fn live_message_format() {
        let mut model = Record::new();
        model.insert("name".into(), json!("a"));
        let msg = LiveMessage::save("1", model);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"op":"save","key":"1","model":{"name":"a"}}"#);

        let json = serde_json::to_string(&LiveMessage::remove("1")).unwrap();
        assert_eq!(json, r#"{"op":"remove","key":"1"}"#);

        let parsed: LiveMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.op, LiveOp::Remove);
        assert!(parsed.model.is_none());
    }
}
