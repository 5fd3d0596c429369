//! Relations between entity types.
//!
//! A relation is declared on its owner entity and resolved once every entity
//! it targets has been defined. Until then, loads for models built in the
//! meantime are parked and replayed on resolution.
//!
//! Per-model runtime state lives on the model; the [`Relation`] object is
//! shared by every model of the owner entity.

mod has_many;
mod single;
mod target;
mod through;

use crate::config::{RelationOptions, StoreMode};
use crate::error::Result;
use crate::events::ListenerId;
use crate::operation::OperationKind;
use crate::{key_component, Cascade, Database, EntityName, Key, Model, Record, Status};
use has_many::{HasManyRelation, ManyState};
use parking_lot::Mutex;
use serde_json::Value;
use single::{SingleRelation, SingleState};
use std::collections::HashMap;
use std::sync::Arc;
use through::{ThroughRelation, ThroughState};

pub(crate) use target::Target;

/// The four relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    HasManyThrough,
}

/// Something that can be related: a model, a key, or raw data for one.
#[derive(Debug, Clone)]
pub enum Related {
    Model(Model),
    Key(Key),
    /// Encoded data, parsed into a model of the target entity.
    Data(Record),
}

impl Related {
    pub fn from_value(value: &Value) -> Option<Related> {
        match value {
            Value::Object(data) => Some(Related::Data(data.clone())),
            Value::Null | Value::Array(_) => None,
            other => key_component(other).map(Related::Key),
        }
    }

    /// Every related item in a relation value. Null means none.
    pub fn list(value: &Value) -> Vec<Related> {
        match value {
            Value::Array(items) => items.iter().filter_map(Related::from_value).collect(),
            other => Related::from_value(other).into_iter().collect(),
        }
    }

    /// Whether this refers to `model`.
    pub fn refers_to(&self, model: &Model) -> bool {
        match self {
            Related::Model(other) => other.ptr_eq(model),
            Related::Key(key) => *key == model.key(),
            Related::Data(data) => model.database().key_of(data) == Some(model.key()),
        }
    }
}

impl From<Model> for Related {
    fn from(model: Model) -> Self {
        Related::Model(model)
    }
}

impl From<&Model> for Related {
    fn from(model: &Model) -> Self {
        Related::Model(model.clone())
    }
}

impl From<&str> for Related {
    fn from(key: &str) -> Self {
        Related::Key(key.to_string())
    }
}

impl From<String> for Related {
    fn from(key: String) -> Self {
        Related::Key(key)
    }
}

impl From<Record> for Related {
    fn from(data: Record) -> Self {
        Related::Data(data)
    }
}

/// The current value of a relation on one model.
#[derive(Debug, Clone, Default)]
pub enum RelationValue {
    #[default]
    None,
    One(Model),
    Many(Vec<Model>),
}

impl RelationValue {
    pub fn model(&self) -> Option<&Model> {
        match self {
            RelationValue::One(model) => Some(model),
            _ => None,
        }
    }

    pub fn models(&self) -> Vec<Model> {
        match self {
            RelationValue::None => Vec::new(),
            RelationValue::One(model) => vec![model.clone()],
            RelationValue::Many(models) => models.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelationValue::None => 0,
            RelationValue::One(_) => 1,
            RelationValue::Many(models) => models.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-model runtime state of one relation.
#[derive(Clone)]
pub(crate) enum RelationState {
    Single(Arc<Mutex<SingleState>>),
    Many(Arc<Mutex<ManyState>>),
    Through(Arc<Mutex<ThroughState>>),
}

/// Behaviour shared by every relation kind.
pub(crate) trait Relation: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> RelationKind;
    fn is_lazy(&self) -> bool;

    /// Whether the relation contributes to the storage or remote encoding.
    fn encodes(&self, for_saving: bool) -> bool;

    /// Entity names that must be defined before the relation resolves.
    fn targets(&self) -> Vec<EntityName>;

    /// Owner fields the relation writes.
    fn owner_fields(&self) -> Vec<String>;

    /// Bind the target databases and replay parked loads.
    fn resolve(&self, targets: &HashMap<EntityName, Database>) -> Result<()>;

    /// Install per-model state and apply the initial value.
    fn load(&self, model: &Model, remote: bool);

    /// Replace the relation's value.
    fn set(&self, model: &Model, related: Vec<Related>, remote: bool);
    fn relate(&self, model: &Model, related: Vec<Related>, remote: bool);
    fn unrelate(&self, model: &Model, related: Option<Related>, remote: bool);
    fn is_related(&self, model: &Model, related: &Related) -> bool;
    fn get(&self, model: &Model) -> RelationValue;
    fn encode(&self, model: &Model, out: &mut Record, for_saving: bool);

    fn pre_save(&self, model: &Model, cascade: Cascade);
    fn pre_remove(&self, model: &Model, cascade: Cascade);

    /// A related model whose remote save must land first.
    fn unsaved_dependency(&self, model: &Model) -> Option<Model>;

    /// Some of [`Relation::owner_fields`] were written from outside the relation.
    fn foreign_key_changed(&self, _model: &Model, _remote: bool) {}

    /// Drop listeners and state for a discarded model.
    fn detach(&self, model: &Model);
}

pub(crate) type RelationHandle = Arc<dyn Relation>;

/// Build the relation `name` declared on `owner`.
pub(crate) fn build(
    owner: &str,
    owner_key: &[String],
    name: &str,
    options: RelationOptions,
    lookup: &dyn Fn(&str) -> Option<Database>,
) -> Result<RelationHandle> {
    let relation: RelationHandle = match options {
        RelationOptions::BelongsTo(options) => Arc::new(SingleRelation::build(
            RelationKind::BelongsTo,
            owner,
            name,
            options,
            lookup,
        )?),
        RelationOptions::HasOne(options) => Arc::new(SingleRelation::build(
            RelationKind::HasOne,
            owner,
            name,
            options,
            lookup,
        )?),
        RelationOptions::HasMany(options) => {
            Arc::new(HasManyRelation::build(owner, owner_key, name, options)?)
        }
        RelationOptions::HasManyThrough(options) => Arc::new(ThroughRelation::build(
            owner, owner_key, name, options, lookup,
        )?),
    };
    Ok(relation)
}

/// Settings every relation kind reads the same way.
#[derive(Debug, Clone)]
pub(crate) struct Common {
    pub owner: EntityName,
    pub name: String,
    pub store: StoreMode,
    pub save: StoreMode,
    pub auto: bool,
    pub lazy: bool,
    pub cascade: Cascade,
}

impl Common {
    pub fn mode(&self, for_saving: bool) -> StoreMode {
        if for_saving {
            self.save
        } else {
            self.store
        }
    }

    pub fn encodes(&self, for_saving: bool) -> bool {
        self.mode(for_saving) != StoreMode::None
    }
}

/// Models loaded before the relation resolved.
#[derive(Default)]
pub(crate) struct Parked {
    loads: Mutex<Vec<(crate::model::WeakModel, bool)>>,
}

impl Parked {
    pub fn park(&self, model: &Model, remote: bool) {
        self.loads.lock().push((model.downgrade(), remote));
    }

    pub fn drain(&self) -> Vec<(Model, bool)> {
        std::mem::take(&mut *self.loads.lock())
            .into_iter()
            .filter_map(|(model, remote)| model.upgrade().map(|model| (model, remote)))
            .collect()
    }
}

/// Listeners a relation holds on other models.
#[derive(Default)]
pub(crate) struct Watches {
    entries: Vec<(Model, ListenerId)>,
}

impl Watches {
    pub fn add(&mut self, model: &Model, id: ListenerId) {
        self.entries.push((model.clone(), id));
    }

    /// Stop watching `model`.
    pub fn remove(&mut self, model: &Model) {
        self.entries.retain(|(watched, id)| {
            if watched.ptr_eq(model) {
                watched.off(*id);
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        for (watched, id) in self.entries.drain(..) {
            watched.off(id);
        }
    }
}

impl Drop for Watches {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Listeners a relation holds on target databases.
#[derive(Default)]
pub(crate) struct DatabaseWatches {
    entries: Vec<(Database, ListenerId)>,
}

impl DatabaseWatches {
    pub fn add(&mut self, db: &Database, id: ListenerId) {
        self.entries.push((db.clone(), id));
    }

    pub fn clear(&mut self) {
        for (db, id) in self.entries.drain(..) {
            db.off(id);
        }
    }
}

impl Drop for DatabaseWatches {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Key components of `fields` on `model`, or `None` when any is empty.
pub(crate) fn field_components(model: &Model, fields: &[String]) -> Option<Vec<String>> {
    let values = model.fields();
    fields
        .iter()
        .map(|field| values.get(field).and_then(key_component))
        .collect()
}

/// Whether `a.a_fields` and `b.b_fields` hold the same non-empty key values.
pub(crate) fn fields_match(a: &Model, a_fields: &[String], b: &Model, b_fields: &[String]) -> bool {
    match (field_components(a, a_fields), field_components(b, b_fields)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Copy `source.from` into `target.to`. Returns true when a value changed.
pub(crate) fn copy_fields(
    source: &Model,
    from: &[String],
    target: &Model,
    to: &[String],
    remote: bool,
) -> bool {
    let source_values = source.fields();
    let values: Record = from
        .iter()
        .zip(to)
        .map(|(from, to)| {
            (
                to.clone(),
                source_values.get(from).cloned().unwrap_or(Value::Null),
            )
        })
        .collect();
    assign_if_changed(target, values, remote)
}

/// Null out `fields` on `target`. Returns true when a value changed.
pub(crate) fn clear_fields(target: &Model, fields: &[String], remote: bool) -> bool {
    let values: Record = fields
        .iter()
        .map(|field| (field.clone(), Value::Null))
        .collect();
    assign_if_changed(target, values, remote)
}

pub(crate) fn assign_if_changed(target: &Model, values: Record, remote: bool) -> bool {
    let current = target.fields();
    let changed = values
        .iter()
        .any(|(field, value)| current.get(field).unwrap_or(&Value::Null) != value);
    if changed {
        target.assign(values, remote);
    }
    changed
}

/// A model whose remote save is queued or in flight but has never landed.
pub(crate) fn awaiting_remote_save(model: &Model) -> bool {
    if model.is_saved() || model.is_deleted() {
        return false;
    }
    model.status() == Status::SavePending
        || model
            .queued_operations()
            .iter()
            .any(|kind| matches!(kind, OperationKind::SaveLocal | OperationKind::SaveRemote))
}

/// Run `then` once every database in `databases` has loaded locally.
///
/// Keys resolved earlier would miss models still sitting in local storage.
pub(crate) fn when_ready<F>(mut databases: Vec<Database>, then: F)
where
    F: FnOnce() + Send + 'static,
{
    databases.retain(|db| !db.is_ready());
    match databases.pop() {
        None => then(),
        Some(db) => db.ready(move || when_ready(databases, then)),
    }
}

/// The model for `key` in `db`: registered, or fetched.
pub(crate) fn model_for_key(db: &Database, key: &str) -> Option<Model> {
    if key.is_empty() {
        return None;
    }
    Some(db.get(key).unwrap_or_else(|| db.fetch(key)))
}

/// A model built from encoded `data`.
///
/// Remote data is reconciled into the registry; local data updates the
/// registered model or instantiates a new one.
pub(crate) fn model_for_data(db: &Database, data: Record, remote: bool) -> Option<Model> {
    if remote {
        let key = db.key_of(&data);
        return match db.put_remote_data(data, key.clone(), None, false) {
            Some(model) => Some(model),
            None => key.and_then(|key| db.get(&key)),
        };
    }
    let decoded = db.decode(&data);
    match db.key_of(&data).and_then(|key| db.get(&key)) {
        Some(model) => {
            model.set_all(decoded);
            Some(model)
        }
        None => Some(db.instantiate(decoded)),
    }
}

/// Encode a to-many relation value.
pub(crate) fn encode_many(models: &[Model], mode: StoreMode, for_saving: bool) -> Option<Value> {
    match mode {
        StoreMode::None => None,
        StoreMode::Model => Some(Value::Array(
            models
                .iter()
                .map(|model| Value::Object(model.to_json(for_saving)))
                .collect(),
        )),
        StoreMode::Key | StoreMode::Keys => Some(Value::Array(
            models.iter().map(|model| Value::from(model.key())).collect(),
        )),
    }
}
