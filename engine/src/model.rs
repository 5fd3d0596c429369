//! Models: the in-memory instances of an entity type.
//!
//! A [`Model`] is a cheap handle; clones share the same instance. Every
//! mutation of the synchronization state goes through the model's operation
//! queue, so at most one operation touches a model at a time.

use crate::events::{EventBus, ListenerId};
use crate::operation::{self, OperationKind, OperationQueue};
use crate::relation::{Related, RelationHandle, RelationState, RelationValue};
use crate::{is_marker, Cascade, Database, Key, LocalRecord, Record, Status, StoreError};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Events emitted by a single model.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    Created,
    Change,
    KeyUpdate { previous: Key, current: Key },
    PreSave,
    PostSave,
    PreRemove,
    PostRemove,
    /// The model left its database's registry.
    Removed,
    /// The model's local copy is gone and its relations released.
    Detach,
    LocalSave,
    LocalSaveFailure(StoreError),
    LocalGet,
    LocalGetFailure(StoreError),
    LocalRemove,
    LocalRemoveFailure(StoreError),
    RemoteGet,
    RemoteGetFailure { status: u16 },
    RemoteGetOffline,
    RemoteSave,
    RemoteSaveFailure { status: u16 },
    RemoteSaveOffline,
    RemoteSaveConflict { response: Option<Record> },
    RemoteRemove,
    RemoteRemoveFailure { status: u16 },
    RemoteRemoveOffline,
    /// Remote data was merged into the model.
    RemoteUpdate { encoded: Record },
    /// Some remote values were held back because the local value diverged.
    PartialUpdate {
        encoded: Record,
        updated: Record,
        conflicts: Record,
    },
    FullUpdate { encoded: Record, updated: Record },
    RelationUpdate { relation: String },
    /// A relation rewrote the foreign-key fields it owns.
    ForeignKeyUpdate { relation: String },
}

/// Mutable state of a model, guarded by the model's lock.
#[derive(Debug, Default)]
pub(crate) struct ModelState {
    /// In-memory (decoded) field values.
    pub fields: Record,
    pub status: Status,
    /// Last snapshot acknowledged by the remote service.
    pub saved: Option<Record>,
    /// Mirror of what local storage holds, present under cache mode `All`.
    pub local: Option<LocalRecord>,
    pub saving: Option<Record>,
    pub publish: Option<Record>,
    pub queue: OperationQueue,
    /// Raw relation inputs not yet consumed by a relation load.
    pub initial: Record,
}

impl ModelState {
    /// Mark the model synced and drop outstanding payloads.
    pub fn mark_synced(&mut self) {
        self.status = Status::Synced;
        self.saving = None;
        self.publish = None;
        self.sync_local_markers();
    }

    /// Copy status and payload markers into the local mirror.
    pub fn sync_local_markers(&mut self) {
        if let Some(local) = &mut self.local {
            local.status = self.status;
            local.saved = self.saved.clone();
            local.saving = self.saving.clone();
            local.publish = self.publish.clone();
        }
    }
}

pub(crate) struct ModelInner {
    db: Database,
    state: Mutex<ModelState>,
    relations: Mutex<HashMap<String, RelationState>>,
    events: EventBus<ModelEvent>,
}

/// A handle to one model instance.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

/// A non-owning model handle, used by listeners to avoid reference cycles.
#[derive(Clone)]
pub struct WeakModel {
    inner: Weak<ModelInner>,
}

impl WeakModel {
    pub fn upgrade(&self) -> Option<Model> {
        self.inner.upgrade().map(|inner| Model { inner })
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Model")
            .field("entity", &self.inner.db.name())
            .field("fields", &state.fields)
            .field("status", &state.status)
            .finish()
    }
}

impl Model {
    pub(crate) fn new(db: Database, fields: Record, initial: Record) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                db,
                state: Mutex::new(ModelState {
                    fields,
                    initial,
                    ..ModelState::default()
                }),
                relations: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ModelState> {
        self.inner.state.lock()
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn entity(&self) -> &str {
        self.inner.db.name()
    }

    pub fn ptr_eq(&self, other: &Model) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakModel {
        WeakModel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ---- fields ----

    /// The registry key. Empty when a key field has no value.
    pub fn key(&self) -> Key {
        let state = self.state();
        self.inner.db.key_of(&state.fields).unwrap_or_default()
    }

    pub fn has_key(&self) -> bool {
        let state = self.state();
        self.inner.db.key_of(&state.fields).is_some()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.state().fields.get(field).cloned()
    }

    /// All in-memory field values.
    pub fn fields(&self) -> Record {
        self.state().fields.clone()
    }

    pub fn set(&self, field: &str, value: Value) {
        let mut values = Record::new();
        values.insert(field.to_string(), value);
        self.assign(values, false);
    }

    /// Assign several fields. Relation names route through their relation.
    pub fn set_all(&self, values: Record) {
        self.assign(values, false);
    }

    pub(crate) fn assign(&self, values: Record, remote: bool) {
        let db = self.inner.db.clone();
        let previous_key = self.key();
        let mut relations = Vec::new();
        let mut touched = Vec::new();
        {
            let mut state = self.state();
            for (field, value) in values {
                if is_marker(&field) {
                    continue;
                }
                match db.relation(&field) {
                    Some(relation) => relations.push((relation, value)),
                    None => {
                        state.fields.insert(field.clone(), value);
                        touched.push(field);
                    }
                }
            }
        }

        for (relation, value) in relations {
            self.ensure_relation(&relation);
            relation.set(self, Related::list(&value), remote);
        }
        self.follow_foreign_keys(&touched, remote);

        let current_key = self.key();
        if current_key != previous_key {
            db.rekey(&previous_key, self);
            self.emit(&ModelEvent::KeyUpdate {
                previous: previous_key,
                current: current_key,
            });
        }
        if !touched.is_empty() {
            self.changed();
        }
    }

    /// Re-resolve loaded relations whose foreign-key fields are among `fields`.
    pub(crate) fn follow_foreign_keys(&self, fields: &[String], remote: bool) {
        if fields.is_empty() {
            return;
        }
        for (name, relation) in self.inner.db.relations() {
            if !self.has_relation_state(name) {
                continue;
            }
            if relation.owner_fields().iter().any(|field| fields.contains(field)) {
                relation.foreign_key_changed(self, remote);
            }
        }
    }

    /// Apply encoded values from the remote service without conflict checks.
    pub(crate) fn assign_encoded(&self, encoded: &Record) {
        let decoded = self.inner.db.decode(encoded);
        self.assign(decoded, true);
    }

    pub(crate) fn changed(&self) {
        self.emit(&ModelEvent::Change);
        self.inner.db.model_updated(self);
    }

    /// Encoded form: for the remote service when `for_saving`, else for storage.
    pub fn to_json(&self, for_saving: bool) -> Record {
        let db = &self.inner.db;
        let fields = self.state().fields.clone();
        let mut out = db.encode(&fields);
        for (name, relation) in db.relations() {
            if self.has_relation_state(name) {
                relation.encode(self, &mut out, for_saving);
            }
        }
        out
    }

    /// Fields whose encoded value differs from the last acknowledged snapshot.
    pub fn get_changes(&self) -> Record {
        let current = self.to_json(true);
        self.changes_from(&current)
    }

    pub(crate) fn changes_from(&self, current: &Record) -> Record {
        let saved = self.saved();
        let mut changes = Record::new();
        for field in self.inner.db.save_fields() {
            let now = current.get(field);
            match &saved {
                None => {
                    if let Some(value) = now {
                        changes.insert(field.clone(), value.clone());
                    }
                }
                Some(saved) => {
                    if now != saved.get(field) {
                        changes.insert(field.clone(), now.cloned().unwrap_or(Value::Null));
                    }
                }
            }
        }
        changes
    }

    pub fn has_changes(&self) -> bool {
        self.saved().is_none() || !self.get_changes().is_empty()
    }

    // ---- status ----

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn saved(&self) -> Option<Record> {
        self.state().saved.clone()
    }

    pub fn saving(&self) -> Option<Record> {
        self.state().saving.clone()
    }

    pub fn publish(&self) -> Option<Record> {
        self.state().publish.clone()
    }

    pub fn local(&self) -> Option<LocalRecord> {
        self.state().local.clone()
    }

    /// Never persisted anywhere.
    pub fn is_new(&self) -> bool {
        let state = self.state();
        state.saved.is_none() && state.local.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.status(), Status::RemovePending | Status::Removed)
    }

    pub fn exists(&self) -> bool {
        !self.is_deleted()
    }

    /// The remote service has acknowledged at least one save.
    pub fn is_saved(&self) -> bool {
        self.state().saved.is_some()
    }

    pub fn is_synced(&self) -> bool {
        self.status() == Status::Synced
    }

    pub fn is_registered(&self) -> bool {
        self.inner.db.contains(self)
    }

    /// An operation is running.
    pub fn is_busy(&self) -> bool {
        self.state().queue.is_busy()
    }

    /// The running operation followed by the queued ones.
    pub fn queued_operations(&self) -> Vec<OperationKind> {
        self.state().queue.kinds()
    }

    // ---- lifecycle ----

    pub fn save(&self) {
        self.save_with(None, Cascade::ALL);
    }

    /// Optionally assign `values`, then persist with the given reach.
    pub fn save_with(&self, values: Option<Record>, cascade: Cascade) {
        if self.is_deleted() {
            tracing::debug!(entity = self.entity(), key = %self.key(), "save ignored, model removed");
            return;
        }
        if let Some(values) = values {
            self.set_all(values);
        }
        if !self.has_key() {
            tracing::warn!(entity = self.entity(), "save ignored, model has no key");
            return;
        }

        self.emit(&ModelEvent::PreSave);
        let db = self.inner.db.clone();
        for (name, relation) in db.relations() {
            if self.has_relation_state(name) {
                relation.pre_save(self, cascade);
            }
        }
        db.save_to_models(self, false);
        operation::add(self, OperationKind::SaveLocal, cascade);
        self.emit(&ModelEvent::PostSave);
    }

    pub fn remove(&self) {
        self.remove_with(Cascade::ALL);
    }

    /// Remove optimistically: the model leaves the registry immediately.
    pub fn remove_with(&self, cascade: Cascade) {
        if self.is_deleted() {
            tracing::debug!(entity = self.entity(), key = %self.key(), "remove ignored, already removed");
            return;
        }

        self.emit(&ModelEvent::PreRemove);
        let db = self.inner.db.clone();
        for (name, relation) in db.relations() {
            if self.has_relation_state(name) {
                relation.pre_remove(self, cascade);
            }
        }
        {
            let mut state = self.state();
            state.status = Status::RemovePending;
            state.sync_local_markers();
        }
        db.remove_from_models(self);
        operation::add(self, OperationKind::RemoveLocal, cascade);
        self.emit(&ModelEvent::PostRemove);
    }

    /// Reload from local storage, then from the remote service.
    pub fn refresh(&self) {
        self.refresh_with(Cascade::ALL);
    }

    pub fn refresh_with(&self, cascade: Cascade) {
        operation::add(self, OperationKind::GetLocal, cascade);
    }

    // ---- relations ----

    fn relation_for(&self, name: &str) -> Option<RelationHandle> {
        let relation = self.inner.db.relation(name);
        match &relation {
            Some(relation) => self.ensure_relation(relation),
            None => tracing::warn!(entity = self.entity(), relation = name, "unknown relation"),
        }
        relation
    }

    /// Add `related` to the relation. Replaces the value of single relations.
    pub fn relate(&self, name: &str, related: impl Into<Related>) -> bool {
        self.relate_all(name, vec![related.into()])
    }

    pub fn relate_all(&self, name: &str, related: Vec<Related>) -> bool {
        match self.relation_for(name) {
            Some(relation) => {
                relation.relate(self, related, false);
                true
            }
            None => false,
        }
    }

    /// Remove `related` from the relation, or everything when `None`.
    pub fn unrelate(&self, name: &str, related: Option<Related>) -> bool {
        match self.relation_for(name) {
            Some(relation) => {
                relation.unrelate(self, related, false);
                true
            }
            None => false,
        }
    }

    pub fn is_related(&self, name: &str, related: impl Into<Related>) -> bool {
        match self.relation_for(name) {
            Some(relation) => relation.is_related(self, &related.into()),
            None => false,
        }
    }

    pub fn related(&self, name: &str) -> RelationValue {
        match self.relation_for(name) {
            Some(relation) => relation.get(self),
            None => RelationValue::None,
        }
    }

    pub(crate) fn ensure_relation(&self, relation: &RelationHandle) {
        if !self.has_relation_state(relation.name()) {
            relation.load(self, false);
        }
    }

    pub(crate) fn has_relation_state(&self, name: &str) -> bool {
        self.inner.relations.lock().contains_key(name)
    }

    pub(crate) fn relation_state(&self, name: &str) -> Option<RelationState> {
        self.inner.relations.lock().get(name).cloned()
    }

    /// Install runtime state for a relation. False when already loaded.
    pub(crate) fn install_relation_state(&self, name: &str, state: RelationState) -> bool {
        let mut relations = self.inner.relations.lock();
        if relations.contains_key(name) {
            return false;
        }
        relations.insert(name.to_string(), state);
        true
    }

    /// A related model that must reach the remote service before this one.
    pub(crate) fn unsaved_dependency(&self) -> Option<Model> {
        let db = self.inner.db.clone();
        db.relations()
            .iter()
            .filter(|(name, _)| self.has_relation_state(name))
            .find_map(|(_, relation)| relation.unsaved_dependency(self))
    }

    pub(crate) fn take_initial(&self, name: &str) -> Option<Value> {
        self.state().initial.remove(name)
    }

    /// Release every relation listener. Called once the model is discarded.
    pub(crate) fn detach_relations(&self) {
        let db = self.inner.db.clone();
        for (name, relation) in db.relations() {
            if self.has_relation_state(name) {
                relation.detach(self);
            }
        }
        self.emit(&ModelEvent::Detach);
    }

    // ---- events ----

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(handler)
    }

    pub fn once_when<P, F>(&self, filter: P, handler: F) -> ListenerId
    where
        P: Fn(&ModelEvent) -> bool + Send + Sync + 'static,
        F: FnOnce(&ModelEvent) + Send + 'static,
    {
        self.inner.events.once_when(filter, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.events.len()
    }

    pub(crate) fn emit(&self, event: &ModelEvent) {
        self.inner.events.emit(event);
    }
}
