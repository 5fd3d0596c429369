//! `belongsTo` and `hasOne`: one related model, keyed by foreign-key fields
//! on the owner.
//!
//! The two kinds differ in ownership. A `belongsTo` owner may be removed
//! along with its target; a `hasOne` owner removes its related model when
//! the reference is replaced or cleared, and when the owner itself goes.

use super::{
    assign_if_changed, awaiting_remote_save, clear_fields, field_components, fields_match,
    model_for_data, model_for_key, when_ready, Common, Parked, Related, Relation, RelationKind,
    RelationState, RelationValue, Target,
};
use crate::config::{SingleOptions, StoreMode};
use crate::error::Result;
use crate::events::ListenerId;
use crate::model::ModelEvent;
use crate::{Cascade, Database, EntityName, Error, Model, Record};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

#[derive(Default)]
pub(crate) struct SingleState {
    related: Option<Model>,
    listener: Option<ListenerId>,
}

impl Drop for SingleState {
    fn drop(&mut self) {
        if let (Some(related), Some(id)) = (&self.related, self.listener.take()) {
            related.off(id);
        }
    }
}

pub(crate) struct SingleRelation {
    inner: Arc<SingleInner>,
}

struct SingleInner {
    common: Common,
    kind: RelationKind,
    /// Entity name, or discriminator value to entity name.
    model: Option<EntityName>,
    discriminator: Option<String>,
    discriminators: BTreeMap<String, EntityName>,
    local: Vec<String>,
    clear_key: bool,
    target: OnceLock<Target>,
    parked: Parked,
}

impl SingleRelation {
    pub fn build(
        kind: RelationKind,
        owner: &str,
        name: &str,
        options: SingleOptions,
        lookup: &dyn Fn(&str) -> Option<Database>,
    ) -> Result<Self> {
        let polymorphic = options.discriminator.is_some();
        if polymorphic && options.discriminators.is_empty() {
            return Err(Error::relation(owner, name, "discriminator without discriminators"));
        }
        if !polymorphic && options.model.is_none() {
            return Err(Error::relation(owner, name, "missing target model"));
        }

        let local = match options.local.as_ref().map(|spec| spec.to_vec()) {
            Some(local) if !local.is_empty() => local,
            _ => {
                let target = options.model.as_deref().filter(|_| !polymorphic);
                match target.and_then(lookup) {
                    Some(db) => db
                        .key_fields()
                        .iter()
                        .map(|field| format!("{name}_{field}"))
                        .collect(),
                    None => vec![format!("{name}_id")],
                }
            }
        };

        let default_cascade = match kind {
            RelationKind::HasOne => Cascade::ALL,
            _ => Cascade::NONE,
        };

        Ok(Self {
            inner: Arc::new(SingleInner {
                common: Common {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    store: options.store,
                    save: options.save,
                    auto: options.auto,
                    lazy: options.lazy,
                    cascade: options.cascade.unwrap_or(default_cascade),
                },
                kind,
                model: options.model,
                discriminator: options.discriminator,
                discriminators: options.discriminators,
                local,
                clear_key: options.clear_key,
                target: OnceLock::new(),
                parked: Parked::default(),
            }),
        })
    }
}

impl SingleInner {
    fn state(&self, model: &Model) -> Option<Arc<Mutex<SingleState>>> {
        match model.relation_state(&self.common.name) {
            Some(RelationState::Single(state)) => Some(state),
            _ => None,
        }
    }

    fn related(&self, model: &Model) -> Option<Model> {
        self.state(model).and_then(|state| state.lock().related.clone())
    }

    /// Resolve a related value against the target chosen for `owner`.
    fn parse(&self, owner: &Model, related: Related, remote: bool) -> Option<Model> {
        let target = self.target.get()?;
        let hint = self
            .discriminator
            .as_ref()
            .and_then(|field| owner.get(field));
        match related {
            Related::Model(model) => {
                if target.owns(model.database()) {
                    Some(model)
                } else {
                    tracing::warn!(
                        entity = %self.common.owner,
                        relation = %self.common.name,
                        related = model.entity(),
                        "model of an unrelated entity ignored"
                    );
                    None
                }
            }
            Related::Key(key) => model_for_key(&target.for_value(hint.as_ref())?, &key),
            Related::Data(data) => {
                let hint = target
                    .discriminator()
                    .and_then(|field| data.get(field).cloned())
                    .or(hint);
                model_for_data(&target.for_value(hint.as_ref())?, data, remote)
            }
        }
    }

    /// The related model named by the owner's foreign-key fields.
    fn from_foreign_key(&self, owner: &Model) -> Option<Model> {
        let target = self.target.get()?;
        let hint = self
            .discriminator
            .as_ref()
            .and_then(|field| owner.get(field));
        let db = target.for_value(hint.as_ref())?;
        let parts = field_components(owner, &self.local)?;
        model_for_key(&db, &parts.join(db.key_separator()))
    }

    /// Point the owner's foreign key at `related`, or clear it.
    fn write_foreign_key(&self, owner: &Model, related: Option<&Model>, remote: bool) -> bool {
        let changed = match related {
            Some(related) => {
                let source = related.fields();
                let mut values: Record = related
                    .database()
                    .key_fields()
                    .iter()
                    .zip(&self.local)
                    .map(|(from, to)| {
                        let value = source.get(from).cloned().unwrap_or(Value::Null);
                        (to.clone(), value)
                    })
                    .collect();
                if let (Some(field), Some(target)) = (&self.discriminator, self.target.get()) {
                    if let Some(value) = target.value_of(related.database()) {
                        values.insert(field.clone(), Value::from(value));
                    }
                }
                assign_if_changed(owner, values, remote)
            }
            None if self.clear_key => {
                let mut fields = self.local.clone();
                fields.extend(self.discriminator.iter().cloned());
                clear_fields(owner, &fields, remote)
            }
            None => false,
        };
        if changed {
            owner.emit(&ModelEvent::ForeignKeyUpdate {
                relation: self.common.name.clone(),
            });
        }
        changed
    }

    /// Whether the owner's foreign key names `related`.
    fn points_at(&self, owner: &Model, related: &Model) -> bool {
        let Some(target) = self.target.get() else {
            return false;
        };
        let hint = self
            .discriminator
            .as_ref()
            .and_then(|field| owner.get(field));
        target
            .for_value(hint.as_ref())
            .is_some_and(|db| db.ptr_eq(related.database()))
            && fields_match(owner, &self.local, related, related.database().key_fields())
    }

    /// Swap the related model for the one the foreign key now names.
    fn follow_foreign_key(self: &Arc<Self>, owner: &Model, remote: bool) {
        let current = self.related(owner);
        let next = match &current {
            Some(current) if self.points_at(owner, current) => return,
            // linked before it had a key
            Some(current) if !current.has_key() && field_components(owner, &self.local).is_none() => {
                return
            }
            None if field_components(owner, &self.local).is_none() => return,
            _ => self.from_foreign_key(owner),
        };
        tracing::trace!(
            entity = %self.common.owner,
            relation = %self.common.name,
            key = %owner.key(),
            "foreign key changed, re-resolving"
        );
        self.set_related(owner, next, remote);
    }

    fn auto_save(&self, owner: &Model, changed: bool, remote: bool) {
        if changed && !remote && self.common.auto && owner.is_registered() {
            owner.save();
        }
    }

    fn set_related(self: &Arc<Self>, owner: &Model, related: Option<Model>, remote: bool) {
        let Some(state) = self.state(owner) else {
            return;
        };
        let previous = {
            let mut guard = state.lock();
            let state = &mut *guard;
            let same = match (&state.related, &related) {
                (Some(current), Some(next)) => current.ptr_eq(next),
                (None, None) => true,
                _ => false,
            };
            if same {
                None
            } else {
                if let (Some(previous), Some(id)) = (&state.related, state.listener.take()) {
                    previous.off(id);
                }
                state.listener = related.as_ref().map(|next| self.watch(owner, next));
                Some(std::mem::replace(&mut state.related, related.clone()))
            }
        };
        let Some(previous) = previous else {
            return;
        };

        let changed = self.write_foreign_key(owner, related.as_ref(), remote);
        owner.emit(&ModelEvent::RelationUpdate {
            relation: self.common.name.clone(),
        });

        if self.kind == RelationKind::HasOne && !self.common.cascade.is_none() {
            if let Some(previous) = previous.filter(|previous| previous.exists()) {
                let cascade = if remote {
                    Cascade::LOCAL
                } else {
                    self.common.cascade
                };
                tracing::debug!(
                    entity = %self.common.owner,
                    relation = %self.common.name,
                    key = %previous.key(),
                    "removing replaced related model"
                );
                previous.remove_with(cascade);
            }
        }
        self.auto_save(owner, changed, remote);
    }

    /// Apply the initial value, or follow the owner's foreign key.
    fn load_related(self: &Arc<Self>, owner: &Model, initial: Option<Value>, remote: bool) {
        if self.related(owner).is_some() {
            return;
        }
        let related = match initial {
            Some(value) => Related::list(&value)
                .into_iter()
                .next()
                .and_then(|related| self.parse(owner, related, remote)),
            None => self.from_foreign_key(owner),
        };
        if related.is_some() {
            self.set_related(owner, related, remote);
        }
    }

    fn watch(self: &Arc<Self>, owner: &Model, related: &Model) -> ListenerId {
        let relation = Arc::clone(self);
        let owner = owner.downgrade();
        let watched = related.downgrade();
        related.on(move |event| {
            let (Some(owner), Some(related)) = (owner.upgrade(), watched.upgrade()) else {
                return;
            };
            match event {
                ModelEvent::KeyUpdate { .. } => {
                    let changed = relation.write_foreign_key(&owner, Some(&related), false);
                    relation.auto_save(&owner, changed, false);
                }
                ModelEvent::Removed => relation.related_removed(&owner, &related),
                _ => {}
            }
        })
    }

    fn related_removed(self: &Arc<Self>, owner: &Model, related: &Model) {
        let Some(state) = self.state(owner) else {
            return;
        };
        {
            let mut state = state.lock();
            if !state.related.as_ref().is_some_and(|current| current.ptr_eq(related)) {
                return;
            }
            if let Some(id) = state.listener.take() {
                related.off(id);
            }
            state.related = None;
        }

        if self.kind == RelationKind::BelongsTo && !self.common.cascade.is_none() {
            tracing::debug!(
                entity = %self.common.owner,
                relation = %self.common.name,
                key = %owner.key(),
                "target removed, removing owner"
            );
            owner.remove_with(self.common.cascade);
            return;
        }

        let changed = self.write_foreign_key(owner, None, false);
        owner.emit(&ModelEvent::RelationUpdate {
            relation: self.common.name.clone(),
        });
        self.auto_save(owner, changed, false);
    }
}

impl Relation for SingleRelation {
    fn name(&self) -> &str {
        &self.inner.common.name
    }

    fn kind(&self) -> RelationKind {
        self.inner.kind
    }

    fn is_lazy(&self) -> bool {
        self.inner.common.lazy
    }

    fn encodes(&self, for_saving: bool) -> bool {
        self.inner.common.encodes(for_saving)
    }

    fn targets(&self) -> Vec<EntityName> {
        match &self.inner.model {
            Some(model) if self.inner.discriminator.is_none() => vec![model.clone()],
            _ => self.inner.discriminators.values().cloned().collect(),
        }
    }

    fn owner_fields(&self) -> Vec<String> {
        let mut fields = self.inner.local.clone();
        fields.extend(self.inner.discriminator.iter().cloned());
        fields
    }

    fn resolve(&self, targets: &HashMap<EntityName, Database>) -> Result<()> {
        let inner = &self.inner;
        let check = |db: &Database| -> Result<()> {
            if db.key_fields().len() != inner.local.len() {
                return Err(Error::relation(
                    inner.common.owner.as_str(),
                    inner.common.name.as_str(),
                    format!(
                        "{} foreign key field(s) for the {}-field key of '{}'",
                        inner.local.len(),
                        db.key_fields().len(),
                        db.name()
                    ),
                ));
            }
            Ok(())
        };
        let missing = |entity: &str| {
            Error::relation(
                inner.common.owner.as_str(),
                inner.common.name.as_str(),
                format!("unknown entity '{entity}'"),
            )
        };

        let target = match &inner.discriminator {
            None => {
                let entity = inner.model.as_deref().unwrap_or_default();
                let db = targets.get(entity).ok_or_else(|| missing(entity))?;
                check(db)?;
                Target::One(db.clone())
            }
            Some(discriminator) => {
                let mut types = BTreeMap::new();
                for (value, entity) in &inner.discriminators {
                    let db = targets.get(entity).ok_or_else(|| missing(entity))?;
                    check(db)?;
                    types.insert(value.clone(), db.clone());
                }
                Target::Poly {
                    discriminator: discriminator.clone(),
                    types,
                }
            }
        };
        if inner.target.set(target).is_err() {
            return Ok(());
        }

        for (model, remote) in inner.parked.drain() {
            self.load(&model, remote);
        }
        Ok(())
    }

    fn load(&self, model: &Model, remote: bool) {
        let inner = &self.inner;
        if inner.target.get().is_none() {
            inner.parked.park(model, remote);
            return;
        }
        let state = RelationState::Single(Arc::new(Mutex::new(SingleState::default())));
        if !model.install_relation_state(&inner.common.name, state) {
            return;
        }

        let initial = model
            .take_initial(&inner.common.name)
            .filter(|value| !value.is_null());
        let databases = inner.target.get().map(Target::databases).unwrap_or_default();
        let relation = Arc::clone(inner);
        let owner = model.downgrade();
        when_ready(databases, move || {
            if let Some(owner) = owner.upgrade() {
                relation.load_related(&owner, initial, remote);
            }
        });
    }

    fn set(&self, model: &Model, related: Vec<Related>, remote: bool) {
        let related = related
            .into_iter()
            .next()
            .and_then(|related| self.inner.parse(model, related, remote));
        self.inner.set_related(model, related, remote);
    }

    fn relate(&self, model: &Model, related: Vec<Related>, remote: bool) {
        self.set(model, related, remote);
    }

    fn unrelate(&self, model: &Model, related: Option<Related>, remote: bool) {
        let Some(current) = self.inner.related(model) else {
            return;
        };
        if related.map_or(true, |related| related.refers_to(&current)) {
            self.inner.set_related(model, None, remote);
        }
    }

    fn is_related(&self, model: &Model, related: &Related) -> bool {
        self.inner
            .related(model)
            .is_some_and(|current| related.refers_to(&current))
    }

    fn get(&self, model: &Model) -> RelationValue {
        match self.inner.related(model) {
            Some(related) => RelationValue::One(related),
            None => RelationValue::None,
        }
    }

    fn encode(&self, model: &Model, out: &mut Record, for_saving: bool) {
        let Some(related) = self.inner.related(model) else {
            return;
        };
        let value = match self.inner.common.mode(for_saving) {
            StoreMode::None => return,
            StoreMode::Model => Value::Object(related.to_json(for_saving)),
            StoreMode::Key => Value::from(related.key()),
            StoreMode::Keys => Value::Array(vec![Value::from(related.key())]),
        };
        out.insert(self.inner.common.name.clone(), value);
    }

    fn pre_save(&self, model: &Model, cascade: Cascade) {
        let Some(related) = self.inner.related(model) else {
            return;
        };
        if related.exists() && !related.is_registered() {
            related.save_with(None, cascade);
        }
        // the related key may have been generated since it was linked
        self.inner.write_foreign_key(model, Some(&related), true);
    }

    fn pre_remove(&self, model: &Model, cascade: Cascade) {
        if self.inner.kind != RelationKind::HasOne || self.inner.common.cascade.is_none() {
            return;
        }
        if let Some(related) = self.inner.related(model).filter(Model::exists) {
            tracing::debug!(
                entity = %self.inner.common.owner,
                relation = %self.inner.common.name,
                key = %related.key(),
                "removing owned model"
            );
            related.remove_with(cascade);
        }
    }

    fn unsaved_dependency(&self, model: &Model) -> Option<Model> {
        self.inner
            .related(model)
            .filter(|related| awaiting_remote_save(related))
    }

    fn foreign_key_changed(&self, model: &Model, remote: bool) {
        let inner = &self.inner;
        let Some(target) = inner.target.get() else {
            return;
        };
        if inner.state(model).is_none() {
            return;
        }
        let relation = Arc::clone(inner);
        let owner = model.downgrade();
        when_ready(target.databases(), move || {
            if let Some(owner) = owner.upgrade() {
                relation.follow_foreign_key(&owner, remote);
            }
        });
    }

    fn detach(&self, model: &Model) {
        let Some(state) = self.inner.state(model) else {
            return;
        };
        let mut guard = state.lock();
        let state = &mut *guard;
        if let (Some(related), Some(id)) = (&state.related, state.listener.take()) {
            related.off(id);
        }
        state.related = None;
    }
}
