//! `hasManyThrough`: related models linked by records of a join entity.
//!
//! Each related model is paired with the join record that links it. Pairs
//! are added and dropped together; a join record left behind when its
//! related model is removed is cleaned up.

use super::{
    copy_fields, encode_many, field_components, fields_match, model_for_data, model_for_key,
    when_ready, Common, DatabaseWatches, Parked, Related, Relation, RelationKind, RelationState,
    RelationValue, Watches,
};
use crate::collection::{KeyedMap, ModelCollection};
use crate::compare::{comparator_from_expression, Comparator};
use crate::config::ThroughOptions;
use crate::database::DatabaseEvent;
use crate::error::Result;
use crate::model::ModelEvent;
use crate::{Cascade, Database, EntityName, Error, Key, Model, Record};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

pub(crate) struct ThroughState {
    related: ModelCollection,
    /// Join records by related key.
    through: KeyedMap<Model>,
    watches: Watches,
    databases: DatabaseWatches,
    bulk: usize,
    unsorted: bool,
}

impl ThroughState {
    fn new(comparator: Option<Comparator>) -> Self {
        Self {
            related: ModelCollection::new(comparator),
            through: KeyedMap::new(),
            watches: Watches::default(),
            databases: DatabaseWatches::default(),
            bulk: 0,
            unsorted: false,
        }
    }

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

    fn key_of_through(&self, through: &Model) -> Option<Key> {
        self.through
            .iter()
            .find(|(_, candidate)| candidate.ptr_eq(through))
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

pub(crate) struct ThroughRelation {
    inner: Arc<ThroughInner>,
}

struct Targets {
    related: Database,
    through: Database,
}

struct ThroughInner {
    common: Common,
    model: EntityName,
    through: EntityName,
    owner_key: Vec<String>,
    /// Join fields pointing at the owner.
    local: Vec<String>,
    /// Join fields pointing at the related model.
    foreign: Vec<String>,
    comparator: Option<Comparator>,
    cascade_remove: bool,
    cascade_remove_through: bool,
    cascade_save_related: bool,
    target: OnceLock<Targets>,
    parked: Parked,
}

impl ThroughRelation {
    pub fn build(
        owner: &str,
        owner_key: &[String],
        name: &str,
        options: ThroughOptions,
        lookup: &dyn Fn(&str) -> Option<Database>,
    ) -> Result<Self> {
        let model = options
            .model
            .ok_or_else(|| Error::relation(owner, name, "missing target model"))?;
        let through = options
            .through
            .ok_or_else(|| Error::relation(owner, name, "missing through entity"))?;

        let local = match options.local.as_ref().map(|spec| spec.to_vec()) {
            Some(local) if !local.is_empty() => local,
            _ => owner_key.iter().map(|field| format!("{owner}_{field}")).collect(),
        };
        if local.len() != owner_key.len() {
            return Err(Error::relation(
                owner,
                name,
                format!(
                    "{} local field(s) for the {}-field owner key",
                    local.len(),
                    owner_key.len()
                ),
            ));
        }
        let foreign = match options.foreign.as_ref().map(|spec| spec.to_vec()) {
            Some(foreign) if !foreign.is_empty() => foreign,
            _ => match lookup(&model) {
                Some(db) => db
                    .key_fields()
                    .iter()
                    .map(|field| format!("{model}_{field}"))
                    .collect(),
                None => vec![format!("{model}_id")],
            },
        };
        let comparator = options
            .comparator
            .as_deref()
            .map(comparator_from_expression)
            .transpose()?;

        Ok(Self {
            inner: Arc::new(ThroughInner {
                common: Common {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    store: options.store,
                    save: options.save,
                    auto: options.auto,
                    lazy: options.lazy,
                    cascade: options.cascade.unwrap_or(Cascade::ALL),
                },
                model,
                through,
                owner_key: owner_key.to_vec(),
                local,
                foreign,
                comparator,
                cascade_remove: options.cascade_remove,
                cascade_remove_through: options.cascade_remove_through,
                cascade_save_related: options.cascade_save_related,
                target: OnceLock::new(),
                parked: Parked::default(),
            }),
        })
    }
}

impl ThroughInner {
    fn state(&self, model: &Model) -> Option<Arc<Mutex<ThroughState>>> {
        match model.relation_state(&self.common.name) {
            Some(RelationState::Through(state)) => Some(state),
            _ => None,
        }
    }

    fn members(&self, owner: &Model) -> Vec<Model> {
        self.state(owner)
            .map(|state| state.lock().related.to_vec())
            .unwrap_or_default()
    }

    fn pairs(&self, owner: &Model) -> Vec<(Model, Option<Model>)> {
        let Some(state) = self.state(owner) else {
            return Vec::new();
        };
        let state = state.lock();
        state
            .related
            .keys()
            .iter()
            .zip(state.related.models())
            .map(|(key, related)| (related.clone(), state.through.get(key).cloned()))
            .collect()
    }

    /// Whether the join record points at `owner`.
    fn links_owner(&self, owner: &Model, through: &Model) -> bool {
        fields_match(through, &self.local, owner, &self.owner_key)
    }

    fn links_related(&self, through: &Model, related: &Model) -> bool {
        fields_match(through, &self.foreign, related, related.database().key_fields())
    }

    /// The related model a join record points at.
    fn related_of(&self, through: &Model) -> Option<Model> {
        let targets = self.target.get()?;
        let parts = field_components(through, &self.foreign)?;
        model_for_key(&targets.related, &parts.join(targets.related.key_separator()))
    }

    fn parse(&self, related: Related, remote: bool) -> Option<Model> {
        let targets = self.target.get()?;
        match related {
            Related::Model(model) => model.database().ptr_eq(&targets.related).then_some(model),
            Related::Key(key) => model_for_key(&targets.related, &key),
            Related::Data(data) => model_for_data(&targets.related, data, remote),
        }
    }

    /// The registered join record for the pair, or a new unsaved one.
    fn find_or_build_through(&self, owner: &Model, related: &Model) -> Option<(Model, bool)> {
        let targets = self.target.get()?;
        let owner_values = owner.fields();
        let related_values = related.fields();
        let mut data = Record::new();
        for (field, key) in self.local.iter().zip(&self.owner_key) {
            data.insert(field.clone(), owner_values.get(key).cloned().unwrap_or(Value::Null));
        }
        for (field, key) in self.foreign.iter().zip(targets.related.key_fields()) {
            data.insert(field.clone(), related_values.get(key).cloned().unwrap_or(Value::Null));
        }

        let existing = targets
            .through
            .key_of(&data)
            .and_then(|key| targets.through.get(&key))
            .or_else(|| {
                targets.through.all().into_iter().find(|through| {
                    self.links_owner(owner, through) && self.links_related(through, related)
                })
            });
        match existing {
            Some(through) => Some((through, false)),
            None => Some((targets.through.instantiate(data), true)),
        }
    }

    fn add(
        self: &Arc<Self>,
        owner: &Model,
        state: &Arc<Mutex<ThroughState>>,
        related: &Model,
        through: Option<Model>,
        remote: bool,
    ) -> bool {
        if state.lock().key_of(related).is_some() {
            return false;
        }
        let (through, built) = match through {
            Some(through) => (through, false),
            None => match self.find_or_build_through(owner, related) {
                Some(found) => found,
                None => return false,
            },
        };

        {
            let mut guard = state.lock();
            let state = &mut *guard;
            if state.key_of(related).is_some() {
                return false;
            }
            let key = related.key();
            state.related.put_with_key(key.clone(), related.clone());
            state.through.put(key, through.clone());
            let id = self.watch_related(owner, related);
            state.watches.add(related, id);
            let id = self.watch_through(owner, &through);
            state.watches.add(&through, id);
            state.resort();
        }

        if built && !remote && self.common.auto {
            if related.exists() && !related.is_registered() {
                related.save_with(None, self.common.cascade);
            }
            through.save_with(None, self.common.cascade);
        }
        true
    }

    /// Drop a pair. Returns the join record that linked it.
    fn drop_pair(&self, state: &Arc<Mutex<ThroughState>>, related: &Model) -> Option<Option<Model>> {
        let mut guard = state.lock();
        let state = &mut *guard;
        let key = state.key_of(related)?;
        state.related.remove(&key);
        let through = state.through.remove(&key);
        state.watches.remove(related);
        if let Some(through) = &through {
            state.watches.remove(through);
        }
        Some(through)
    }

    fn remove(
        &self,
        state: &Arc<Mutex<ThroughState>>,
        related: &Model,
        remote: bool,
        remove_related: bool,
    ) -> bool {
        let Some(through) = self.drop_pair(state, related) else {
            return false;
        };
        if remote {
            return true;
        }
        if self.cascade_remove_through {
            if let Some(through) = through.filter(Model::exists) {
                through.remove_with(self.common.cascade);
            }
        }
        if remove_related && self.cascade_remove && related.exists() {
            related.remove_with(self.common.cascade);
        }
        true
    }

    fn begin(state: &Arc<Mutex<ThroughState>>) {
        state.lock().bulk += 1;
    }

    fn end(state: &Arc<Mutex<ThroughState>>) {
        let mut state = state.lock();
        state.bulk = state.bulk.saturating_sub(1);
        if state.bulk == 0 && state.unsorted {
            state.resort();
        }
    }

    fn changed(&self, owner: &Model, remote: bool) {
        owner.emit(&ModelEvent::RelationUpdate {
            relation: self.common.name.clone(),
        });
        if !remote && self.common.auto && self.common.encodes(true) && owner.is_registered() {
            owner.save();
        }
    }

    fn watch_related(self: &Arc<Self>, owner: &Model, related: &Model) -> crate::events::ListenerId {
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
                    // the join record is orphaned once its related model goes
                    if relation.remove(&state, &related, false, false) {
                        relation.changed(&owner, true);
                    }
                }
                ModelEvent::KeyUpdate { previous, current } => {
                    let through = {
                        let mut guard = state.lock();
                        let state = &mut *guard;
                        if !state.related.contains(previous, &related) {
                            return;
                        }
                        state.related.remove(previous);
                        state.related.put_with_key(current.clone(), related.clone());
                        let through = state.through.remove(previous);
                        if let Some(through) = &through {
                            state.through.put(current.clone(), through.clone());
                        }
                        state.resort();
                        through
                    };
                    if let Some(through) = through {
                        let changed = copy_fields(
                            &related,
                            related.database().key_fields(),
                            &through,
                            &relation.foreign,
                            false,
                        );
                        if changed && relation.common.auto && through.is_registered() {
                            through.save();
                        }
                    }
                }
                ModelEvent::Change => state.lock().resort(),
                _ => {}
            }
        })
    }

    fn watch_through(self: &Arc<Self>, owner: &Model, through: &Model) -> crate::events::ListenerId {
        let relation = Arc::clone(self);
        let owner = owner.downgrade();
        let watched = through.downgrade();
        through.on(move |event| {
            if !matches!(event, ModelEvent::Removed) {
                return;
            }
            let (Some(owner), Some(through)) = (owner.upgrade(), watched.upgrade()) else {
                return;
            };
            let Some(state) = relation.state(&owner) else {
                return;
            };
            let related = {
                let state = state.lock();
                state
                    .key_of_through(&through)
                    .and_then(|key| state.related.get(&key).cloned())
            };
            if let Some(related) = related {
                if relation.drop_pair(&state, &related).is_some() {
                    relation.changed(&owner, true);
                }
            }
        })
    }

    /// Link join records that start pointing at the owner.
    fn watch_databases(self: &Arc<Self>, owner: &Model, state: &Arc<Mutex<ThroughState>>) {
        let Some(targets) = self.target.get() else {
            return;
        };
        let relation = Arc::clone(self);
        let weak = owner.downgrade();
        let id = targets.through.on(move |event| {
            let through = match event {
                DatabaseEvent::ModelAdded { model, .. } | DatabaseEvent::ModelUpdated { model } => model,
                _ => return,
            };
            let Some(owner) = weak.upgrade() else {
                return;
            };
            if relation.adopt(&owner, through) {
                relation.changed(&owner, true);
            }
        });
        state.lock().databases.add(&targets.through, id);
    }

    /// Pair a join record with its related model. False when nothing changed.
    fn adopt(self: &Arc<Self>, owner: &Model, through: &Model) -> bool {
        if !through.exists() || !self.links_owner(owner, through) {
            return false;
        }
        let Some(state) = self.state(owner) else {
            return false;
        };
        if state.lock().key_of_through(through).is_some() {
            return false;
        }
        if let Some(targets) = self.target.get().filter(|targets| !targets.related.is_ready()) {
            // pair once the related models have loaded
            let relation = Arc::clone(self);
            let weak = (owner.downgrade(), through.downgrade());
            when_ready(vec![targets.related.clone()], move || {
                if let (Some(owner), Some(through)) = (weak.0.upgrade(), weak.1.upgrade()) {
                    if relation.adopt(&owner, &through) {
                        relation.changed(&owner, true);
                    }
                }
            });
            return false;
        }
        match self.related_of(through) {
            Some(related) => self.add(owner, &state, &related, Some(through.clone()), true),
            None => false,
        }
    }

    fn set_all(self: &Arc<Self>, owner: &Model, given: Vec<Model>, remote: bool) {
        let Some(state) = self.state(owner) else {
            return;
        };
        let existing = state.lock().related.to_vec();
        Self::begin(&state);
        let mut changed = false;
        for current in &existing {
            if !given.iter().any(|next| next.ptr_eq(current)) {
                changed |= self.remove(&state, current, remote, false);
            }
        }
        for related in &given {
            changed |= self.add(owner, &state, related, None, remote);
        }
        Self::end(&state);
        if changed {
            self.changed(owner, remote);
        }
    }
}

impl Relation for ThroughRelation {
    fn name(&self) -> &str {
        &self.inner.common.name
    }

    fn kind(&self) -> RelationKind {
        RelationKind::HasManyThrough
    }

    fn is_lazy(&self) -> bool {
        self.inner.common.lazy
    }

    fn encodes(&self, for_saving: bool) -> bool {
        self.inner.common.encodes(for_saving)
    }

    fn targets(&self) -> Vec<EntityName> {
        vec![self.inner.model.clone(), self.inner.through.clone()]
    }

    fn owner_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn resolve(&self, targets: &HashMap<EntityName, Database>) -> Result<()> {
        let inner = &self.inner;
        let error = |reason: String| {
            Error::relation(inner.common.owner.as_str(), inner.common.name.as_str(), reason)
        };
        let find = |entity: &str| {
            targets
                .get(entity)
                .cloned()
                .ok_or_else(|| error(format!("unknown entity '{entity}'")))
        };
        let related = find(&inner.model)?;
        let through = find(&inner.through)?;

        if related.key_fields().len() != inner.foreign.len() {
            return Err(error(format!(
                "{} foreign field(s) for the {}-field key of '{}'",
                inner.foreign.len(),
                related.key_fields().len(),
                related.name()
            )));
        }
        for field in inner.local.iter().chain(&inner.foreign) {
            if !through.fields().contains(field) {
                return Err(error(format!(
                    "'{field}' is not a field of '{}'",
                    through.name()
                )));
            }
        }

        if inner.target.set(Targets { related, through }).is_err() {
            return Ok(());
        }
        for (model, remote) in inner.parked.drain() {
            self.load(&model, remote);
        }
        Ok(())
    }

    fn load(&self, model: &Model, remote: bool) {
        let inner = &self.inner;
        let Some(targets) = inner.target.get() else {
            inner.parked.park(model, remote);
            return;
        };
        let state = Arc::new(Mutex::new(ThroughState::new(inner.comparator.clone())));
        if !model.install_relation_state(&inner.common.name, RelationState::Through(Arc::clone(&state))) {
            return;
        }
        inner.watch_databases(model, &state);

        let initial = model
            .take_initial(&inner.common.name)
            .filter(|value| !value.is_null());
        let databases = vec![targets.through.clone(), targets.related.clone()];
        let relation = Arc::clone(inner);
        let owner = model.downgrade();
        when_ready(databases, move || {
            let Some(owner) = owner.upgrade() else {
                return;
            };
            ThroughInner::begin(&state);
            if let Some(value) = initial {
                for related in Related::list(&value) {
                    if let Some(related) = relation.parse(related, remote) {
                        relation.add(&owner, &state, &related, None, remote);
                    }
                }
            }
            if let Some(targets) = relation.target.get() {
                for through in targets.through.all() {
                    relation.adopt(&owner, &through);
                }
            }
            ThroughInner::end(&state);
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
        ThroughInner::begin(&state);
        let mut changed = false;
        for related in related {
            if let Some(related) = self.inner.parse(related, remote) {
                changed |= self.inner.add(model, &state, &related, None, remote);
            }
        }
        ThroughInner::end(&state);
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
        ThroughInner::begin(&state);
        let mut changed = false;
        for member in &members {
            changed |= self.inner.remove(&state, member, remote, true);
        }
        ThroughInner::end(&state);
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
        let inner = &self.inner;
        if !inner.cascade_remove && !inner.cascade_remove_through {
            return;
        }
        for (related, through) in inner.pairs(model) {
            if inner.cascade_remove_through {
                if let Some(through) = through.filter(Model::exists) {
                    through.remove_with(cascade);
                }
            }
            if inner.cascade_remove && related.exists() {
                related.remove_with(cascade);
            }
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
        state.through.clear();
    }
}
