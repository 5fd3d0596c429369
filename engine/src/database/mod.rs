//! Databases: the per-entity registry of models.
//!
//! A [`Database`] owns the models of one entity type, keyed and optionally
//! sorted, together with the storage, transport and live collaborators for
//! that type. Remote data enters through [`Database::put_remote_data`],
//! which reconciles it with local state field by field.

mod load;
mod reconcile;
pub(crate) mod schema;

use crate::backend::{Backend, Live, LiveMessage, LiveReceiver, Rest, Store};
use crate::collection::{FilteredCollection, ModelCollection, RemoteQuery};
use crate::compare::Comparator;
use crate::config::{CacheMode, LoadMode};
use crate::events::{EventBus, ListenerId, Signal};
use crate::model::ModelEvent;
use crate::relation::RelationHandle;
use crate::{is_empty_value, is_marker, key_component, Key, Model, Network, Record, StoreError};
use parking_lot::Mutex;
use schema::Schema;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Events emitted by a database.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// A model entered the registry.
    ModelAdded { model: Model, remote: bool },
    /// A model left the registry.
    ModelRemoved { model: Model },
    /// A registered model changed.
    ModelUpdated { model: Model },
    LocalLoad,
    LocalLoadFailure(StoreError),
    RemoteLoad,
    RemoteLoadOffline,
    RemoteLoadFailure { status: u16 },
    /// The first operation started while none were pending.
    OperationsStarted,
    /// The last pending operation finished.
    OperationsFinished,
}

#[derive(Debug, Default)]
struct LoadState {
    remote_loaded: bool,
    /// A refresh waits for pending operations to drain.
    refresh_on_rest: bool,
    /// A refresh failed offline and waits for the network.
    refresh_on_online: bool,
}

pub(crate) struct DatabaseInner {
    schema: Schema,
    models: Mutex<ModelCollection>,
    /// Keys removed locally whose remote removal is outstanding.
    removing: Mutex<HashSet<Key>>,
    store: Arc<dyn Store>,
    rest: Arc<dyn Rest>,
    live: OnceLock<Arc<dyn Live>>,
    network: Network,
    events: EventBus<DatabaseEvent>,
    pending: AtomicUsize,
    /// Operations parked until the network comes back.
    parked: AtomicUsize,
    load: Mutex<LoadState>,
    ready: Signal<()>,
}

/// Handle to the database of one entity type.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Clone)]
pub(crate) struct WeakDatabase {
    inner: Weak<DatabaseInner>,
}

impl WeakDatabase {
    pub fn upgrade(&self) -> Option<Database> {
        self.inner.upgrade().map(|inner| Database { inner })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.schema.name)
            .field("models", &self.inner.models.lock().len())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) fn new(schema: Schema, backend: &dyn Backend, network: Network) -> Self {
        let name = schema.name.clone();
        let comparator = schema.comparator.clone();
        let inner = Arc::new(DatabaseInner {
            schema,
            models: Mutex::new(ModelCollection::new(comparator)),
            removing: Mutex::new(HashSet::new()),
            store: backend.store(&name),
            rest: backend.rest(&name),
            live: OnceLock::new(),
            network,
            events: EventBus::new(),
            pending: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            load: Mutex::new(LoadState::default()),
            ready: Signal::new(),
        });

        let weak = Arc::downgrade(&inner);
        let receiver: LiveReceiver = Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                Database { inner }.handle_live(message);
            }
        });
        let live = backend.live(&name, receiver);
        if inner.live.set(live).is_err() {
            tracing::warn!(entity = %name, "live channel already attached");
        }

        Database { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakDatabase {
        WeakDatabase {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- schema ----

    pub fn name(&self) -> &str {
        &self.inner.schema.name
    }

    pub fn class_name(&self) -> &str {
        &self.inner.schema.class_name
    }

    pub fn key_fields(&self) -> &[String] {
        &self.inner.schema.key
    }

    pub fn key_separator(&self) -> &str {
        &self.inner.schema.key_separator
    }

    pub fn fields(&self) -> &[String] {
        &self.inner.schema.fields
    }

    pub(crate) fn save_fields(&self) -> &[String] {
        &self.inner.schema.save_fields
    }

    pub fn cache(&self) -> CacheMode {
        self.inner.schema.cache
    }

    pub fn load_mode(&self) -> LoadMode {
        self.inner.schema.load
    }

    pub fn auto_refresh(&self) -> bool {
        self.inner.schema.auto_refresh
    }

    pub fn full_save(&self) -> bool {
        self.inner.schema.full_save
    }

    pub fn full_publish(&self) -> bool {
        self.inner.schema.full_publish
    }

    pub(crate) fn comparator(&self) -> Option<Comparator> {
        self.inner.schema.comparator.clone()
    }

    pub(crate) fn relations(&self) -> &BTreeMap<String, RelationHandle> {
        &self.inner.schema.relations
    }

    pub(crate) fn relation(&self, name: &str) -> Option<RelationHandle> {
        self.inner.schema.relations.get(name).cloned()
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.inner.schema.relations.keys().cloned().collect()
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub(crate) fn rest(&self) -> &Arc<dyn Rest> {
        &self.inner.rest
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    pub(crate) fn publish(&self, message: LiveMessage) {
        if let Some(live) = self.inner.live.get() {
            live.publish(message);
        }
    }

    // ---- keys and encoding ----

    /// Build the registry key from a record's key fields.
    pub fn key_of(&self, record: &Record) -> Option<Key> {
        let mut parts = Vec::with_capacity(self.key_fields().len());
        for field in self.key_fields() {
            parts.push(key_component(record.get(field)?)?);
        }
        Some(parts.join(self.key_separator()))
    }

    /// Split a registry key back into key field values.
    pub(crate) fn key_record(&self, key: &str) -> Option<Record> {
        let fields = self.key_fields();
        let parts: Vec<&str> = if fields.len() == 1 {
            vec![key]
        } else {
            key.split(self.key_separator()).collect()
        };
        if parts.len() != fields.len() {
            return None;
        }
        Some(
            fields
                .iter()
                .zip(parts)
                .map(|(field, part)| (field.clone(), Value::from(part)))
                .collect(),
        )
    }

    /// Encode the declared fields of an in-memory field map.
    pub fn encode(&self, fields: &Record) -> Record {
        let mut out = Record::new();
        for field in self.fields() {
            if let Some(value) = fields.get(field) {
                let encoded = match self.inner.schema.codecs.get(field) {
                    Some(codec) => codec.encode(value),
                    None => value.clone(),
                };
                out.insert(field.clone(), encoded);
            }
        }
        out
    }

    /// Decode an encoded record, dropping markers.
    pub fn decode(&self, encoded: &Record) -> Record {
        encoded
            .iter()
            .filter(|(field, _)| !is_marker(field))
            .map(|(field, value)| (field.clone(), self.decode_value(field, value)))
            .collect()
    }

    pub(crate) fn decode_value(&self, field: &str, value: &Value) -> Value {
        match self.inner.schema.codecs.get(field) {
            Some(codec) => codec.decode(value),
            None => value.clone(),
        }
    }

    // ---- models ----

    /// Construct a model from in-memory values, applying defaults.
    pub(crate) fn build_model(&self, data: Record, remote: bool) -> Model {
        let schema = &self.inner.schema;
        let mut fields = Record::new();
        let mut initial = Record::new();
        for (field, default) in &schema.defaults {
            fields.insert(field.clone(), default.produce());
        }
        for (field, value) in data {
            if is_marker(&field) {
                continue;
            }
            if schema.relations.contains_key(&field) {
                initial.insert(field, value);
            } else {
                fields.insert(field, value);
            }
        }
        if let [key] = schema.key.as_slice() {
            if is_empty_value(fields.get(key)) {
                fields.insert(key.clone(), Value::from(uuid::Uuid::new_v4().to_string()));
            }
        }

        let model = Model::new(self.clone(), fields, initial);
        for (name, relation) in &schema.relations {
            if !relation.is_lazy() || model.state().initial.contains_key(name) {
                relation.load(&model, remote);
            }
        }
        model.emit(&ModelEvent::Created);
        model
    }

    /// A new, unsaved model.
    pub fn instantiate(&self, data: Record) -> Model {
        self.build_model(data, false)
    }

    /// A new model, saved immediately.
    pub fn create(&self, data: Record) -> Model {
        let model = self.instantiate(data);
        model.save();
        model
    }

    pub fn get(&self, key: &str) -> Option<Model> {
        self.inner.models.lock().get(key).cloned()
    }

    /// Registered models in registry order.
    pub fn all(&self) -> Vec<Model> {
        self.inner.models.lock().to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.models.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, model: &Model) -> bool {
        let key = model.key();
        self.inner.models.lock().contains(&key, model)
    }

    /// The registered model for `key`, or a shell loaded from storage and
    /// the remote service.
    pub fn fetch(&self, key: &str) -> Model {
        if let Some(model) = self.get(key) {
            return model;
        }
        let data = self.key_record(key).unwrap_or_default();
        let model = self.build_model(data, true);
        model.refresh();
        model
    }

    /// Run `callback` with the model for `key` once local data has loaded.
    pub fn grab<F>(&self, key: Key, callback: F)
    where
        F: FnOnce(Option<Model>) + Send + 'static,
    {
        let db = self.downgrade();
        self.inner.ready.when(move |()| {
            callback(db.upgrade().and_then(|db| db.get(&key)));
        });
    }

    /// Run `callback` once local data has loaded.
    pub fn ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.ready.when(move |()| callback());
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_ready()
    }

    pub fn is_remote_loaded(&self) -> bool {
        self.inner.load.lock().remote_loaded
    }

    /// A live view of the registered models matching `predicate`.
    pub fn filtered<P>(&self, predicate: P) -> FilteredCollection
    where
        P: Fn(&Model) -> bool + Send + Sync + 'static,
    {
        FilteredCollection::new(self.clone(), Arc::new(predicate))
    }

    /// Run a remote query; results are merged into this database.
    pub fn query(&self, query: Value) -> RemoteQuery {
        let remote = RemoteQuery::new(self.clone(), query);
        remote.run();
        remote
    }

    /// Add to the registry. Returns false when the key is taken.
    pub(crate) fn save_to_models(&self, model: &Model, remote: bool) -> bool {
        let key = model.key();
        let added = {
            let mut models = self.inner.models.lock();
            if models.has(&key) {
                false
            } else {
                models.put_with_key(key.clone(), model.clone());
                models.sort();
                true
            }
        };
        if added {
            self.inner.removing.lock().remove(&key);
            self.emit(&DatabaseEvent::ModelAdded {
                model: model.clone(),
                remote,
            });
        }
        added
    }

    /// Insert many models at once, sorting a single time.
    pub(crate) fn save_all_to_models(&self, loaded: Vec<Model>) {
        let mut added = Vec::with_capacity(loaded.len());
        {
            let mut models = self.inner.models.lock();
            for model in loaded {
                let key = model.key();
                if !models.has(&key) {
                    models.put_with_key(key, model.clone());
                    added.push(model);
                }
            }
            models.sort();
        }
        for model in added {
            self.emit(&DatabaseEvent::ModelAdded { model, remote: false });
        }
    }

    /// Remove this exact instance from the registry.
    pub(crate) fn remove_from_models(&self, model: &Model) -> bool {
        let key = model.key();
        let removed = {
            let mut models = self.inner.models.lock();
            if models.contains(&key, model) {
                models.remove(&key);
                true
            } else {
                false
            }
        };
        if removed {
            if model.status() == crate::Status::RemovePending {
                self.inner.removing.lock().insert(key);
            }
            self.emit(&DatabaseEvent::ModelRemoved {
                model: model.clone(),
            });
            model.emit(&ModelEvent::Removed);
        }
        removed
    }

    pub(crate) fn mark_removing(&self, key: Key) {
        self.inner.removing.lock().insert(key);
    }

    pub(crate) fn removal_finished(&self, key: &str) {
        self.inner.removing.lock().remove(key);
    }

    pub(crate) fn is_removing(&self, key: &str) -> bool {
        self.inner.removing.lock().contains(key)
    }

    /// Move a registered model after its key fields changed.
    pub(crate) fn rekey(&self, previous: &str, model: &Model) {
        let mut models = self.inner.models.lock();
        if models.contains(previous, model) {
            models.remove(previous);
            models.put(model.clone());
            models.sort();
        }
    }

    pub(crate) fn model_updated(&self, model: &Model) {
        let registered = {
            let mut models = self.inner.models.lock();
            let key = model.key();
            let registered = models.contains(&key, model);
            if registered {
                models.sort();
            }
            registered
        };
        if registered {
            self.emit(&DatabaseEvent::ModelUpdated {
                model: model.clone(),
            });
        }
    }

    // ---- operations ----

    /// Operations currently running across all models.
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn operation_started(&self) {
        if self.inner.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.emit(&DatabaseEvent::OperationsStarted);
        }
    }

    pub(crate) fn operation_finished(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.emit(&DatabaseEvent::OperationsFinished);
            self.on_operations_rest();
        }
    }

    // ---- events ----

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&DatabaseEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Listeners currently subscribed to this database.
    pub fn listener_count(&self) -> usize {
        self.inner.events.len()
    }

    pub(crate) fn emit(&self, event: &DatabaseEvent) {
        self.inner.events.emit(event);
    }
}
