//! `hasMany`: related models carry foreign-key fields pointing at the owner.
//!
//! Membership follows the related models' foreign keys. A model of the
//! target entity that starts pointing at the owner is adopted, and one that
//! stops pointing at it, or leaves its registry, is dropped.

use super::{
    clear_fields, copy_fields, encode_many, field_components, fields_match, model_for_data,
    model_for_key, when_ready,
    Common, DatabaseWatches, Parked, Related, Relation, RelationKind, RelationState, RelationValue,
    Target, Watches,
};
use crate::collection::ModelCollection;
use crate::compare::{comparator_from_expression, Comparator};
use crate::config::HasManyOptions;
use crate::database::DatabaseEvent;
use crate::error::Result;
use crate::model::{ModelEvent, WeakModel};
use crate::{key_component, Cascade, Database, EntityName, Error, Key, Model, Record};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

pub(crate) struct ManyState {
    related: ModelCollection,
    watches: Watches,
    databases: DatabaseWatches,
    /// Open bulk transactions; sorting waits until the last one closes.
    bulk: usize,
    unsorted: bool,
}

impl ManyState {
    fn new(comparator: Option<Comparator>) -> Self {
        Self {
            related: ModelCollection::new(comparator),
            watches: Watches::default(),
            databases: DatabaseWatches::default(),
            bulk: 0,
            unsorted: false,
        }
    }

    /// The key `model` is held under, which may predate a key change.
    fn key_of(&self, model: &Model) -> Option<Key> {
        let key = model.key();
        if self.related.contains(&key, model) {
            return Some(key);
        }
        self.related
            .keys()
            .iter()
            .zip(self.related.models())
            .find(|(_, candidate)| candidate.ptr_eq(model))
            .map(|(key, _)| key.clone())
    }

    fn resort(&mut self) {
        if self.bulk == 0 {
            self.related.sort();
            self.unsorted = false;
        } else {
            self.unsorted = true;
        }
    }
}

pub(crate) struct HasManyRelation {
    inner: Arc<HasManyInner>,
}

struct HasManyInner {
    common: Common,
    model: Option<EntityName>,
    /// Discriminator field on the related models naming their own type.
    discriminator: Option<String>,
    discriminators: BTreeMap<String, EntityName>,
    /// Fields on the related models.
    foreign: Vec<String>,
    /// Owner fields the foreign fields mirror.
    local: Vec<String>,
    comparator: Option<Comparator>,
    clear_key: bool,
    cascade_remove: bool,
    cascade_save_related: bool,
    target: OnceLock<Target>,
    parked: Parked,
    /// Target models by the owner key their foreign fields hold.
    index: Mutex<HashMap<Vec<String>, Vec<WeakModel>>>,
}

impl HasManyRelation {
    pub fn build(
        owner: &str,
        owner_key: &[String],
        name: &str,
        options: HasManyOptions,
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
            _ => owner_key.to_vec(),
        };
        let foreign = match options.foreign.as_ref().map(|spec| spec.to_vec()) {
            Some(foreign) if !foreign.is_empty() => foreign,
            _ => local.iter().map(|field| format!("{owner}_{field}")).collect(),
        };
        if foreign.len() != local.len() {
            return Err(Error::relation(
                owner,
                name,
                format!(
                    "{} foreign field(s) for {} local field(s)",
                    foreign.len(),
                    local.len()
                ),
            ));
        }
        let comparator = options
            .comparator
            .as_deref()
            .map(comparator_from_expression)
            .transpose()?;

        Ok(Self {
            inner: Arc::new(HasManyInner {
                common: Common {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    store: options.store,
                    save: options.save,
                    auto: options.auto,
                    lazy: options.lazy,
                    cascade: options.cascade.unwrap_or(Cascade::ALL),
                },
                model: options.model,
                discriminator: options.discriminator,
                discriminators: options.discriminators,
                foreign,
                local,
                comparator,
                clear_key: options.clear_key,
                cascade_remove: options.cascade_remove,
                cascade_save_related: options.cascade_save_related,
                target: OnceLock::new(),
                parked: Parked::default(),
                index: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl HasManyInner {
    fn state(&self, model: &Model) -> Option<Arc<Mutex<ManyState>>> {
        match model.relation_state(&self.common.name) {
            Some(RelationState::Many(state)) => Some(state),
            _ => None,
        }
    }

    fn members(&self, owner: &Model) -> Vec<Model> {
        self.state(owner)
            .map(|state| state.lock().related.to_vec())
            .unwrap_or_default()
    }

    /// Whether `related` points at `owner`.
    fn matches(&self, owner: &Model, related: &Model) -> bool {
        let Some(target) = self.target.get() else {
            return false;
        };
        if !target.owns(related.database()) || !fields_match(related, &self.foreign, owner, &self.local) {
            return false;
        }
        match &self.discriminator {
            None => true,
            Some(field) => {
                let stored = related.get(field).as_ref().and_then(key_component);
                stored.is_some() && stored == target.value_of(related.database())
            }
        }
    }

    fn parse(&self, related: Related, remote: bool) -> Option<Model> {
        let target = self.target.get()?;
        match related {
            Related::Model(model) => target.owns(model.database()).then_some(model),
            Related::Key(key) => match target {
                Target::One(db) => model_for_key(db, &key),
                Target::Poly { .. } => {
                    tracing::warn!(
                        entity = %self.common.owner,
                        relation = %self.common.name,
                        key = %key,
                        "bare key cannot select a polymorphic type"
                    );
                    None
                }
            },
            Related::Data(data) => {
                let hint = target
                    .discriminator()
                    .and_then(|field| data.get(field).cloned());
                model_for_data(&target.for_value(hint.as_ref())?, data, remote)
            }
        }
    }

    /// Point `related` at `owner`.
    fn write_foreign_key(&self, owner: &Model, related: &Model, remote: bool) -> bool {
        let mut changed = copy_fields(owner, &self.local, related, &self.foreign, remote);
        if let (Some(field), Some(target)) = (&self.discriminator, self.target.get()) {
            if let Some(value) = target.value_of(related.database()) {
                let mut values = Record::new();
                values.insert(field.clone(), Value::from(value));
                changed |= super::assign_if_changed(related, values, remote);
            }
        }
        changed
    }

    fn add(
        self: &Arc<Self>,
        owner: &Model,
        state: &Arc<Mutex<ManyState>>,
        related: &Model,
        remote: bool,
        write_key: bool,
    ) -> bool {
        {
            let mut guard = state.lock();
            let state = &mut *guard;
            if state.key_of(related).is_some() {
                return false;
            }
            state.related.put(related.clone());
            let id = self.watch(owner, related);
            state.watches.add(related, id);
            state.resort();
        }

        if write_key && related.exists() {
            let changed = self.write_foreign_key(owner, related, remote);
            if changed && !remote && self.common.auto {
                related.save_with(None, self.common.cascade);
            }
        }
        true
    }

    fn remove(
        &self,
        state: &Arc<Mutex<ManyState>>,
        related: &Model,
        remote: bool,
        clear_key: bool,
    ) -> bool {
        {
            let mut guard = state.lock();
            let state = &mut *guard;
            let Some(key) = state.key_of(related) else {
                return false;
            };
            state.related.remove(&key);
            state.watches.remove(related);
        }

        if clear_key && self.clear_key && related.exists() {
            let mut fields = self.foreign.clone();
            fields.extend(self.discriminator.iter().cloned());
            let changed = clear_fields(related, &fields, remote);
            if changed && !remote && self.common.auto {
                related.save_with(None, self.common.cascade);
            }
        }
        true
    }

    fn begin(state: &Arc<Mutex<ManyState>>) {
        state.lock().bulk += 1;
    }

    fn end(state: &Arc<Mutex<ManyState>>) {
        let mut state = state.lock();
        state.bulk = state.bulk.saturating_sub(1);
        if state.bulk == 0 && state.unsorted {
            state.resort();
        }
    }

    /// Announce a membership change and save the owner when it encodes
    /// the relation.
    fn changed(&self, owner: &Model, remote: bool) {
        owner.emit(&ModelEvent::RelationUpdate {
            relation: self.common.name.clone(),
        });
        if !remote && self.common.auto && self.common.encodes(true) && owner.is_registered() {
            owner.save();
        }
    }

    fn watch(self: &Arc<Self>, owner: &Model, related: &Model) -> crate::events::ListenerId {
        let relation = Arc::clone(self);
        let owner = owner.downgrade();
        let watched = related.downgrade();
        related.on(move |event| {
            let (Some(owner), Some(related)) = (owner.upgrade(), watched.upgrade()) else {
                return;
            };
            let Some(state) = relation.state(&owner) else {
                return;
            };
            match event {
                ModelEvent::Removed => {
                    if relation.remove(&state, &related, true, false) {
                        relation.changed(&owner, true);
                    }
                }
                ModelEvent::KeyUpdate { previous, current } => {
                    let mut state = state.lock();
                    if state.related.contains(previous, &related) {
                        state.related.remove(previous);
                        state.related.put_with_key(current.clone(), related.clone());
                        state.resort();
                    }
                }
                ModelEvent::Change => {
                    if relation.matches(&owner, &related) {
                        state.lock().resort();
                    } else if relation.remove(&state, &related, true, false) {
                        relation.changed(&owner, true);
                    }
                }
                _ => {}
            }
        })
    }

    /// Adopt models of the target entity that start pointing at the owner.
    fn watch_databases(self: &Arc<Self>, owner: &Model, state: &Arc<Mutex<ManyState>>) {
        let Some(target) = self.target.get() else {
            return;
        };
        for db in target.databases() {
            let relation = Arc::clone(self);
            let weak = owner.downgrade();
            let id = db.on(move |event| {
                let candidate = match event {
                    DatabaseEvent::ModelAdded { model, .. } | DatabaseEvent::ModelUpdated { model } => model,
                    _ => return,
                };
                let Some(owner) = weak.upgrade() else {
                    return;
                };
                let Some(state) = relation.state(&owner) else {
                    return;
                };
                if relation.matches(&owner, candidate) && relation.add(&owner, &state, candidate, true, false) {
                    relation.changed(&owner, true);
                }
            });
            state.lock().databases.add(&db, id);
        }
    }

    /// The initial value first, then whatever already points at the owner.
    fn load_related(
        self: &Arc<Self>,
        owner: &Model,
        state: &Arc<Mutex<ManyState>>,
        initial: Option<Value>,
        remote: bool,
    ) {
        Self::begin(state);
        if let Some(value) = initial {
            for related in Related::list(&value) {
                if let Some(related) = self.parse(related, remote) {
                    self.add(owner, state, &related, remote, true);
                }
            }
        }
        self.adopt_registered(owner, state);
        Self::end(state);
    }

    fn adopt_registered(self: &Arc<Self>, owner: &Model, state: &Arc<Mutex<ManyState>>) {
        for candidate in self.pointing_at(owner) {
            if candidate.is_registered() && self.matches(owner, &candidate) {
                self.add(owner, state, &candidate, true, false);
            }
        }
    }

    /// Keep the index current as target models register or change.
    fn index_targets(self: &Arc<Self>) {
        let Some(target) = self.target.get() else {
            return;
        };
        for db in target.databases() {
            let relation = Arc::downgrade(self);
            db.on(move |event| {
                let model = match event {
                    DatabaseEvent::ModelAdded { model, .. } | DatabaseEvent::ModelUpdated { model } => model,
                    _ => return,
                };
                if let Some(relation) = relation.upgrade() {
                    relation.index(model);
                }
            });
            for model in db.all() {
                self.index(&model);
            }
        }
    }

    fn index(&self, related: &Model) {
        let Some(parts) = field_components(related, &self.foreign) else {
            return;
        };
        let mut index = self.index.lock();
        let bucket = index.entry(parts).or_default();
        bucket.retain(|entry| entry.upgrade().is_some());
        let known = bucket
            .iter()
            .filter_map(WeakModel::upgrade)
            .any(|model| model.ptr_eq(related));
        if !known {
            bucket.push(related.downgrade());
        }
    }

    /// Indexed models whose foreign fields still name `owner`.
    fn pointing_at(&self, owner: &Model) -> Vec<Model> {
        let Some(parts) = field_components(owner, &self.local) else {
            return Vec::new();
        };
        let mut index = self.index.lock();
        let Some(bucket) = index.get_mut(&parts) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        bucket.retain(|entry| match entry.upgrade() {
            Some(model) if field_components(&model, &self.foreign).as_ref() == Some(&parts) => {
                found.push(model);
                true
            }
            _ => false,
        });
        found
    }

    fn set_all(self: &Arc<Self>, owner: &Model, given: Vec<Model>, remote: bool) {
        let Some(state) = self.state(owner) else {
            return;
        };
        let existing = state.lock().related.to_vec();
        let removing: Vec<&Model> = existing
            .iter()
            .filter(|current| !given.iter().any(|next| next.ptr_eq(current)))
            .collect();

        Self::begin(&state);
        let mut changed = false;
        for related in removing {
            changed |= self.remove(&state, related, remote, !remote);
        }
        for related in &given {
            changed |= self.add(owner, &state, related, remote, true);
        }
        Self::end(&state);

        if changed {
            self.changed(owner, remote);
        }
    }
}

impl Relation for HasManyRelation {
    fn name(&self) -> &str {
        &self.inner.common.name
    }

    fn kind(&self) -> RelationKind {
        RelationKind::HasMany
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
        self.inner.local.clone()
    }

    fn resolve(&self, targets: &HashMap<EntityName, Database>) -> Result<()> {
        let inner = &self.inner;
        let error = |reason: String| {
            Error::relation(inner.common.owner.as_str(), inner.common.name.as_str(), reason)
        };
        let check = |entity: &str| -> Result<Database> {
            let db = targets
                .get(entity)
                .ok_or_else(|| error(format!("unknown entity '{entity}'")))?;
            let required = inner.foreign.iter().chain(inner.discriminator.iter());
            for field in required {
                if !db.fields().contains(field) {
                    return Err(error(format!("'{field}' is not a field of '{entity}'")));
                }
            }
            Ok(db.clone())
        };

        let target = match &inner.discriminator {
            None => Target::One(check(inner.model.as_deref().unwrap_or_default())?),
            Some(discriminator) => {
                let mut types = BTreeMap::new();
                for (value, entity) in &inner.discriminators {
                    types.insert(value.clone(), check(entity)?);
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
        inner.index_targets();

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
        let state = Arc::new(Mutex::new(ManyState::new(inner.comparator.clone())));
        if !model.install_relation_state(&inner.common.name, RelationState::Many(Arc::clone(&state))) {
            return;
        }
        inner.watch_databases(model, &state);

        let initial = model
            .take_initial(&inner.common.name)
            .filter(|value| !value.is_null());
        let databases = inner.target.get().map(Target::databases).unwrap_or_default();
        let relation = Arc::clone(inner);
        let owner = model.downgrade();
        when_ready(databases, move || {
            if let Some(owner) = owner.upgrade() {
                relation.load_related(&owner, &state, initial, remote);
            }
        });
    }

    fn set(&self, model: &Model, related: Vec<Related>, remote: bool) {
        let given = related
            .into_iter()
            .filter_map(|related| self.inner.parse(related, remote))
            .collect();
        self.inner.set_all(model, given, remote);
    }

    fn relate(&self, model: &Model, related: Vec<Related>, remote: bool) {
        let Some(state) = self.inner.state(model) else {
            return;
        };
        HasManyInner::begin(&state);
        let mut changed = false;
        for related in related {
            if let Some(related) = self.inner.parse(related, remote) {
                changed |= self.inner.add(model, &state, &related, remote, true);
            }
        }
        HasManyInner::end(&state);
        if changed {
            self.inner.changed(model, remote);
        }
    }

    fn unrelate(&self, model: &Model, related: Option<Related>, remote: bool) {
        let Some(state) = self.inner.state(model) else {
            return;
        };
        let members: Vec<Model> = self
            .inner
            .members(model)
            .into_iter()
            .filter(|member| related.as_ref().map_or(true, |related| related.refers_to(member)))
            .collect();

        HasManyInner::begin(&state);
        let mut changed = false;
        for member in &members {
            if self.inner.cascade_remove && !remote {
                changed |= self.inner.remove(&state, member, remote, false);
                member.remove_with(self.inner.common.cascade);
            } else {
                changed |= self.inner.remove(&state, member, remote, true);
            }
        }
        HasManyInner::end(&state);
        if changed {
            self.inner.changed(model, remote);
        }
    }

    fn is_related(&self, model: &Model, related: &Related) -> bool {
        self.inner
            .members(model)
            .iter()
            .any(|member| related.refers_to(member))
    }

    fn get(&self, model: &Model) -> RelationValue {
        RelationValue::Many(self.inner.members(model))
    }

    fn encode(&self, model: &Model, out: &mut Record, for_saving: bool) {
        let members = self.inner.members(model);
        if let Some(value) = encode_many(&members, self.inner.common.mode(for_saving), for_saving) {
            out.insert(self.inner.common.name.clone(), value);
        }
    }

    fn pre_save(&self, model: &Model, cascade: Cascade) {
        if !self.inner.cascade_save_related {
            return;
        }
        for member in self.inner.members(model) {
            member.save_with(None, cascade);
        }
    }

    fn pre_remove(&self, model: &Model, cascade: Cascade) {
        if !self.inner.cascade_remove {
            return;
        }
        let members = self.inner.members(model);
        tracing::debug!(
            entity = %self.inner.common.owner,
            relation = %self.inner.common.name,
            count = members.len(),
            "removing related models"
        );
        for member in members {
            member.remove_with(cascade);
        }
    }

    fn unsaved_dependency(&self, _model: &Model) -> Option<Model> {
        None
    }

    fn detach(&self, model: &Model) {
        let Some(state) = self.inner.state(model) else {
            return;
        };
        let mut state = state.lock();
        state.watches.clear();
        state.databases.clear();
        state.related.clear();
    }
}
