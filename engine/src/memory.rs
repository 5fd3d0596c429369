//! In-memory collaborators.
//!
//! [`MemoryServer`] plays the remote side: per-entity tables behind the REST
//! interface and a live hub that fans messages out to every other
//! subscriber. [`MemoryBackend`] plays one client: its own local stores,
//! talking to a shared server. Two backends on one server behave like two
//! devices syncing through the same service.
//!
//! Completions run synchronously unless a REST channel is [held](MemoryRest::hold).

use crate::backend::{
    AllFailure, AllSuccess, Backend, GetSuccess, KeyFailure, ListFailure, ListSuccess, Live,
    LiveMessage, LiveReceiver, PutFailure, PutSuccess, RecordFailure, RecordSuccess,
    RemoveSuccess, Rest, Store, NETWORK_UNREACHABLE,
};
use crate::{Key, Model, Record, StoreError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// A live subscription on the server hub.
struct Subscriber {
    id: String,
    entity: String,
    receiver: LiveReceiver,
}

/// The shared remote side.
#[derive(Default)]
pub struct MemoryServer {
    tables: DashMap<String, BTreeMap<Key, Record>>,
    subscribers: DashMap<String, Subscriber>,
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("tables", &self.tables.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record(&self, entity: &str, key: &str) -> Option<Record> {
        self.tables.get(entity)?.get(key).cloned()
    }

    /// All records of an entity, in key order.
    pub fn records(&self, entity: &str) -> Vec<Record> {
        self.tables
            .get(entity)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed or overwrite a remote record.
    pub fn insert(&self, entity: &str, key: impl Into<Key>, record: Record) {
        self.tables
            .entry(entity.to_string())
            .or_default()
            .insert(key.into(), record);
    }

    pub fn delete(&self, entity: &str, key: &str) -> Option<Record> {
        self.tables.get_mut(entity)?.remove(key)
    }

    fn merge(&self, entity: &str, key: Key, encoded: Record) -> Record {
        let mut table = self.tables.entry(entity.to_string()).or_default();
        let stored = table.entry(key).or_default();
        stored.extend(encoded);
        stored.clone()
    }

    /// Subscribe to live messages for `entity`. Returns the subscription id.
    pub fn subscribe(&self, entity: &str, receiver: LiveReceiver) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                id: id.clone(),
                entity: entity.to_string(),
                receiver,
            },
        );
        tracing::debug!(subscription = %id, entity = %entity, "live subscriber registered");
        id
    }

    pub fn unsubscribe(&self, id: &str) {
        if self.subscribers.remove(id).is_some() {
            tracing::debug!(subscription = %id, "live subscriber unregistered");
        }
    }

    /// Deliver `message` to every subscriber of `entity` except the sender.
    ///
    /// Returns the number of subscribers reached.
    pub fn broadcast_except(&self, sender: &str, entity: &str, message: LiveMessage) -> usize {
        let receivers: Vec<LiveReceiver> = self
            .subscribers
            .iter()
            .filter(|entry| entry.id != sender && entry.entity == entity)
            .map(|entry| Arc::clone(&entry.receiver))
            .collect();

        for receiver in &receivers {
            receiver(message.clone());
        }
        tracing::debug!(
            sender = %sender,
            entity = %entity,
            recipients = receivers.len(),
            "live message broadcast"
        );
        receivers.len()
    }
}

/// One client's collaborators. Stores and REST channels are created once per
/// entity and can be looked up for inspection and fault injection.
pub struct MemoryBackend {
    server: Arc<MemoryServer>,
    stores: DashMap<String, Arc<MemoryStore>>,
    rests: DashMap<String, Arc<MemoryRest>>,
    lives: DashMap<String, Arc<MemoryLive>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("server", &self.server)
            .field("stores", &self.stores.len())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// A client with a server of its own.
    pub fn new() -> Self {
        Self::with_server(MemoryServer::new_shared())
    }

    pub fn with_server(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            stores: DashMap::new(),
            rests: DashMap::new(),
            lives: DashMap::new(),
        }
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    pub fn store_for(&self, entity: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .value()
            .clone()
    }

    pub fn rest_for(&self, entity: &str) -> Arc<MemoryRest> {
        self.rests
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(MemoryRest::new(Arc::clone(&self.server), entity)))
            .value()
            .clone()
    }

    pub fn live_for(&self, entity: &str) -> Option<Arc<MemoryLive>> {
        self.lives.get(entity).map(|entry| entry.value().clone())
    }

    /// Take every REST channel created so far offline, or back online.
    pub fn set_offline(&self, offline: bool) {
        for entry in self.rests.iter() {
            entry.value().set_offline(offline);
        }
    }
}

impl Backend for MemoryBackend {
    fn store(&self, entity: &str) -> Arc<dyn Store> {
        self.store_for(entity)
    }

    fn rest(&self, entity: &str) -> Arc<dyn Rest> {
        self.rest_for(entity)
    }

    fn live(&self, entity: &str, receiver: LiveReceiver) -> Arc<dyn Live> {
        let id = self.server.subscribe(entity, receiver);
        let live = Arc::new(MemoryLive {
            server: Arc::clone(&self.server),
            entity: entity.to_string(),
            id,
            published: Mutex::new(Vec::new()),
        });
        self.lives.insert(entity.to_string(), Arc::clone(&live));
        live
    }
}

/// Local storage kept in memory. Records round-trip untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<Key, Record>,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<StoreError>) {
        *self.failure.lock() = error;
    }

    pub fn record(&self, key: &str) -> Option<Record> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.records.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Seed a record as if written by an earlier session.
    pub fn insert(&self, key: impl Into<Key>, record: Record) {
        self.records.insert(key.into(), record);
    }

    fn failure(&self) -> Option<StoreError> {
        self.failure.lock().clone()
    }
}

impl Store for MemoryStore {
    fn put(&self, key: Key, record: Record, on_success: PutSuccess, on_failure: PutFailure) {
        if let Some(error) = self.failure() {
            on_failure(key, record, error);
            return;
        }
        self.records.insert(key.clone(), record.clone());
        on_success(key, record);
    }

    fn get(&self, key: Key, on_success: GetSuccess, on_failure: KeyFailure) {
        if let Some(error) = self.failure() {
            on_failure(key, error);
            return;
        }
        let record = self.record(&key);
        on_success(key, record);
    }

    fn remove(&self, key: Key, on_success: RemoveSuccess, on_failure: KeyFailure) {
        if let Some(error) = self.failure() {
            on_failure(key, error);
            return;
        }
        let removed = self.records.remove(&key).map(|(_, record)| record);
        on_success(key, removed);
    }

    fn all(&self, on_success: AllSuccess, on_failure: AllFailure) {
        if let Some(error) = self.failure() {
            on_failure(error);
            return;
        }
        let keys = self.keys();
        let records = keys.iter().filter_map(|key| self.record(key)).collect();
        on_success(records, keys);
    }
}

/// A REST call as seen by [`MemoryRest`].
#[derive(Debug, Clone, PartialEq)]
pub enum RestCall {
    All,
    Get(Key),
    Create(Key),
    Update(Key),
    Remove(Key),
    Query(Value),
}

type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RestControl {
    held: bool,
    queue: VecDeque<Deferred>,
    offline: bool,
    fail_next: VecDeque<u16>,
    calls: Vec<RestCall>,
}

struct RestInner {
    server: Arc<MemoryServer>,
    entity: String,
    control: Mutex<RestControl>,
}

impl RestInner {
    /// The status a call fails with, if any. Consumes an injected failure.
    fn failure(&self) -> Option<u16> {
        let mut control = self.control.lock();
        if control.offline {
            return Some(NETWORK_UNREACHABLE);
        }
        control.fail_next.pop_front()
    }
}

/// REST transport against a [`MemoryServer`] table.
///
/// Calls are answered immediately unless the channel is held, in which case
/// they run, in order, on [`flush`](MemoryRest::flush).
pub struct MemoryRest {
    inner: Arc<RestInner>,
}

impl std::fmt::Debug for MemoryRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.inner.control.lock();
        f.debug_struct("MemoryRest")
            .field("entity", &self.inner.entity)
            .field("held", &control.held)
            .field("queued", &control.queue.len())
            .field("offline", &control.offline)
            .finish()
    }
}

impl MemoryRest {
    pub fn new(server: Arc<MemoryServer>, entity: &str) -> Self {
        Self {
            inner: Arc::new(RestInner {
                server,
                entity: entity.to_string(),
                control: Mutex::new(RestControl::default()),
            }),
        }
    }

    /// Queue calls instead of answering them.
    pub fn hold(&self) {
        self.inner.control.lock().held = true;
    }

    /// Answer every queued call, including calls queued while flushing, and
    /// stop holding.
    pub fn flush(&self) -> usize {
        let mut answered = 0;
        loop {
            let next = {
                let mut control = self.inner.control.lock();
                let next = control.queue.pop_front();
                if next.is_none() {
                    control.held = false;
                }
                next
            };
            match next {
                Some(call) => {
                    call();
                    answered += 1;
                }
                None => return answered,
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.control.lock().queue.len()
    }

    /// Answer every call with the network-unreachable status.
    pub fn set_offline(&self, offline: bool) {
        self.inner.control.lock().offline = offline;
    }

    /// Fail the next call with `status`.
    pub fn fail_next(&self, status: u16) {
        self.inner.control.lock().fail_next.push_back(status);
    }

    pub fn calls(&self) -> Vec<RestCall> {
        self.inner.control.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.control.lock().calls.clear();
    }

    fn dispatch(&self, call: RestCall, run: Deferred) {
        let run = {
            let mut control = self.inner.control.lock();
            control.calls.push(call);
            if control.held {
                control.queue.push_back(run);
                return;
            }
            run
        };
        run();
    }

    fn record_call<A>(
        &self,
        call: RestCall,
        key: Key,
        on_success: RecordSuccess,
        on_failure: RecordFailure,
        apply: A,
    ) where
        A: FnOnce(&MemoryServer, &str, Key) -> Result<Option<Record>, u16> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.dispatch(
            call,
            Box::new(move || {
                if let Some(status) = inner.failure() {
                    on_failure(None, status);
                    return;
                }
                match apply(&inner.server, &inner.entity, key) {
                    Ok(record) => on_success(record),
                    Err(status) => on_failure(None, status),
                }
            }),
        );
    }

    fn list_call(
        &self,
        call: RestCall,
        filter: Option<Value>,
        on_success: ListSuccess,
        on_failure: ListFailure,
    ) {
        let inner = Arc::clone(&self.inner);
        self.dispatch(
            call,
            Box::new(move || {
                if let Some(status) = inner.failure() {
                    on_failure(Vec::new(), status);
                    return;
                }
                let records = inner
                    .server
                    .records(&inner.entity)
                    .into_iter()
                    .filter(|record| filter.as_ref().map_or(true, |filter| matches_query(record, filter)))
                    .collect();
                on_success(records);
            }),
        );
    }
}

/// Equality match on every field of an object query. Other queries match all.
fn matches_query(record: &Record, query: &Value) -> bool {
    match query {
        Value::Object(terms) => terms
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected)),
        _ => true,
    }
}

impl Rest for MemoryRest {
    fn all(&self, on_success: ListSuccess, on_failure: ListFailure) {
        self.list_call(RestCall::All, None, on_success, on_failure);
    }

    fn get(&self, model: &Model, on_success: RecordSuccess, on_failure: RecordFailure) {
        let key = model.key();
        let call = RestCall::Get(key.clone());
        self.record_call(call, key, on_success, on_failure, |server, entity, key| {
            server.record(entity, &key).map(Some).ok_or(404)
        });
    }

    fn create(
        &self,
        model: &Model,
        encoded: Record,
        on_success: RecordSuccess,
        on_failure: RecordFailure,
    ) {
        let key = model.key();
        let call = RestCall::Create(key.clone());
        self.record_call(call, key, on_success, on_failure, move |server, entity, key| {
            Ok(Some(server.merge(entity, key, encoded)))
        });
    }

    fn update(
        &self,
        model: &Model,
        encoded: Record,
        on_success: RecordSuccess,
        on_failure: RecordFailure,
    ) {
        let key = model.key();
        let call = RestCall::Update(key.clone());
        self.record_call(call, key, on_success, on_failure, move |server, entity, key| {
            Ok(Some(server.merge(entity, key, encoded)))
        });
    }

    fn remove(&self, model: &Model, on_success: RecordSuccess, on_failure: RecordFailure) {
        let key = model.key();
        let call = RestCall::Remove(key.clone());
        self.record_call(call, key, on_success, on_failure, |server, entity, key| {
            server.delete(entity, &key).map(|_| None).ok_or(404)
        });
    }

    fn query(&self, query: Value, on_success: ListSuccess, on_failure: ListFailure) {
        self.list_call(RestCall::Query(query.clone()), Some(query), on_success, on_failure);
    }
}

/// Publishing half of a live subscription.
pub struct MemoryLive {
    server: Arc<MemoryServer>,
    entity: String,
    id: String,
    published: Mutex<Vec<LiveMessage>>,
}

impl std::fmt::Debug for MemoryLive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLive")
            .field("entity", &self.entity)
            .field("id", &self.id)
            .finish()
    }
}

impl MemoryLive {
    /// Messages published through this subscription.
    pub fn published(&self) -> Vec<LiveMessage> {
        self.published.lock().clone()
    }
}

impl Live for MemoryLive {
    fn publish(&self, message: LiveMessage) {
        self.published.lock().push(message.clone());
        self.server.broadcast_except(&self.id, &self.entity, message);
    }
}

impl Drop for MemoryLive {
    fn drop(&mut self) {
        self.server.unsubscribe(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[test]
    fn store_round_trips_markers() {
        let store = MemoryStore::new();
        let data = record(json!({"id": "1", "$status": 1, "$saved": {"id": "1"}}));
        store.put(
            "1".into(),
            data.clone(),
            Box::new(|_: Key, _: Record| {}),
            Box::new(|_: Key, _: Record, _: StoreError| panic!("put failed")),
        );

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        store.get(
            "1".into(),
            Box::new(move |_: Key, record: Option<Record>| *s.lock() = record),
            Box::new(|_: Key, _: StoreError| panic!("get failed")),
        );
        assert_eq!(*seen.lock(), Some(data));
    }

    #[test]
    fn store_failure_injection() {
        let store = MemoryStore::new();
        store.fail_with(Some(StoreError::QuotaExceeded));
        let failed = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failed);
        store.put(
            "1".into(),
            Record::new(),
            Box::new(|_: Key, _: Record| panic!("should fail")),
            Box::new(move |_: Key, _: Record, error: StoreError| {
                assert_eq!(error, StoreError::QuotaExceeded);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn broadcast_skips_the_sender_and_other_entities() {
        let server = MemoryServer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = |hits: &Arc<AtomicUsize>| -> LiveReceiver {
            let hits = Arc::clone(hits);
            Arc::new(move |_: LiveMessage| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let sender = server.subscribe("task", counter(&hits));
        server.subscribe("task", counter(&hits));
        server.subscribe("task", counter(&hits));
        server.subscribe("list", counter(&hits));

        let sent = server.broadcast_except(&sender, "task", LiveMessage::remove("1"));
        assert_eq!(sent, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn query_filters_by_equality() {
        let server = MemoryServer::new();
        server.insert("task", "1", record(json!({"id": "1", "done": true})));
        server.insert("task", "2", record(json!({"id": "2", "done": false})));
        assert!(matches_query(&server.records("task")[0], &json!({"done": true})));
        assert!(!matches_query(&server.records("task")[1], &json!({"done": true})));
        assert!(matches_query(&server.records("task")[1], &Value::Null));
    }
}
