//! Reconciliation of remote data with local state.
//!
//! Remote values are merged field by field. A field is overwritten only when
//! the local value still equals the last acknowledged snapshot; otherwise
//! the remote value is recorded as a conflict and the local edit survives.
//! The snapshot itself always advances to the remote value, so a later save
//! sends the local edit as a change.

use super::schema::Revision;
use super::Database;
use crate::backend::{LiveMessage, LiveOp};
use crate::compare::compare_values;
use crate::model::ModelEvent;
use crate::operation::{self, OperationKind};
use crate::relation::{Related, RelationHandle};
use crate::{is_marker, CacheMode, Cascade, Key, LocalRecord, Model, Record, Status};
use serde_json::Value;
use std::cmp::Ordering;

/// Outcome of merging one remote record into an existing model.
#[derive(Default)]
struct RemoteMerge {
    updated: Record,
    conflicts: Record,
    relations: Vec<(RelationHandle, Value)>,
}

impl Database {
    /// Merge an encoded remote record into the registry.
    ///
    /// `key` defaults to the record's own key and `model` to the registered
    /// model for it. With `overwrite`, local edits are discarded. Returns the
    /// affected model, or `None` when the data was ignored.
    pub fn put_remote_data(
        &self,
        encoded: Record,
        key: Option<Key>,
        model: Option<Model>,
        overwrite: bool,
    ) -> Option<Model> {
        let Some(key) = key.or_else(|| self.key_of(&encoded)) else {
            tracing::warn!(entity = self.name(), "remote data without a key ignored");
            return None;
        };

        match model.or_else(|| self.get(&key)) {
            Some(model) => self.update_from_remote(model, key, encoded, overwrite),
            None if self.is_removing(&key) => {
                tracing::debug!(entity = self.name(), key = %key, "remote data ignored, removal pending");
                None
            }
            None => Some(self.adopt_remote(key, encoded)),
        }
    }

    fn update_from_remote(
        &self,
        model: Model,
        key: Key,
        encoded: Record,
        overwrite: bool,
    ) -> Option<Model> {
        if model.is_deleted() {
            tracing::debug!(entity = self.name(), key = %key, "remote data ignored, model removed");
            return None;
        }
        if self.is_stale(&model, &encoded) {
            tracing::debug!(entity = self.name(), key = %key, "stale remote revision ignored");
            return Some(model);
        }

        let merge = self.merge_remote(&model, &encoded, overwrite);
        for (relation, value) in merge.relations {
            model.ensure_relation(&relation);
            relation.set(&model, Related::list(&value), true);
        }
        let written: Vec<String> = merge.updated.keys().cloned().collect();
        model.follow_foreign_keys(&written, true);

        if merge.conflicts.is_empty() {
            tracing::trace!(entity = self.name(), key = %key, "remote data merged");
            model.emit(&ModelEvent::FullUpdate {
                encoded: encoded.clone(),
                updated: merge.updated.clone(),
            });
        } else {
            tracing::debug!(
                entity = self.name(),
                key = %key,
                conflicts = merge.conflicts.len(),
                "remote data merged with conflicts"
            );
            model.emit(&ModelEvent::PartialUpdate {
                encoded: encoded.clone(),
                updated: merge.updated.clone(),
                conflicts: merge.conflicts,
            });
        }
        model.emit(&ModelEvent::RemoteUpdate { encoded });
        if !merge.updated.is_empty() {
            model.changed();
        }

        operation::add(&model, OperationKind::SaveNow, Cascade::ALL);
        if self.get(&key).is_none() {
            self.save_to_models(&model, true);
        }
        Some(model)
    }

    fn merge_remote(&self, model: &Model, encoded: &Record, overwrite: bool) -> RemoteMerge {
        let current = model.to_json(true);
        let mut merge = RemoteMerge::default();

        let mut guard = model.state();
        let state = &mut *guard;
        let not_really_saved = state.saved.as_ref().map_or(true, Record::is_empty);
        let saved = state.saved.get_or_insert_with(Record::new);

        for (field, value) in encoded {
            if is_marker(field) {
                continue;
            }
            if let Some(relation) = self.relation(field) {
                merge.relations.push((relation, value.clone()));
                saved.insert(field.clone(), value.clone());
                continue;
            }

            let untouched = current.get(field) == saved.get(field);
            if not_really_saved || overwrite || untouched {
                state
                    .fields
                    .insert(field.clone(), self.decode_value(field, value));
                if let Some(local) = &mut state.local {
                    local.fields.insert(field.clone(), value.clone());
                }
                merge.updated.insert(field.clone(), value.clone());
            } else {
                merge.conflicts.insert(field.clone(), value.clone());
            }
            saved.insert(field.clone(), value.clone());
        }
        state.sync_local_markers();
        merge
    }

    /// A model for a key the registry has never seen.
    fn adopt_remote(&self, key: Key, mut encoded: Record) -> Model {
        if self.key_of(&encoded).is_none() {
            if let Some(key_fields) = self.key_record(&key) {
                for (field, value) in key_fields {
                    encoded.entry(field).or_insert(value);
                }
            }
        }

        let model = self.build_model(self.decode(&encoded), true);
        let saved = model.to_json(true);
        let stored = (self.cache() == CacheMode::All).then(|| model.to_json(false));
        {
            let mut state = model.state();
            state.status = Status::Synced;
            state.saved = Some(saved);
            if let Some(fields) = stored {
                let mut local = LocalRecord::new(fields, Status::Synced);
                local.saved = state.saved.clone();
                state.local = Some(local);
            }
        }
        if self.cache() == CacheMode::All {
            operation::add(&model, OperationKind::SaveNow, Cascade::ALL);
        }
        self.save_to_models(&model, true);
        model
    }

    fn is_stale(&self, model: &Model, encoded: &Record) -> bool {
        match &self.inner.schema.revision {
            None => false,
            Some(Revision::Check(check)) => check(model, encoded),
            Some(Revision::Field(field)) => {
                let Some(incoming) = encoded.get(field).filter(|v| !v.is_null()) else {
                    return false;
                };
                let current = model
                    .saved()
                    .and_then(|saved| saved.get(field).cloned())
                    .or_else(|| model.to_json(true).get(field).cloned());
                match current {
                    Some(current) if !current.is_null() => {
                        compare_values(incoming, &current) == Ordering::Less
                    }
                    _ => false,
                }
            }
        }
    }

    /// The remote copy of `model` is gone.
    ///
    /// A model with unsent local changes is kept and will be re-created on
    /// its next save. Returns true when the model was removed.
    pub(crate) fn destroy_model(&self, model: &Model) -> bool {
        if model.status() == Status::Removed {
            return false;
        }
        let unsent = model.status() == Status::SavePending
            || (model.is_saved() && !model.get_changes().is_empty());
        if unsent {
            tracing::info!(entity = self.name(), key = %model.key(), "remote copy gone, keeping local changes");
            {
                let mut state = model.state();
                state.saved = None;
                state.sync_local_markers();
            }
            operation::add(model, OperationKind::SaveNow, Cascade::ALL);
            return false;
        }

        tracing::debug!(entity = self.name(), key = %model.key(), "remote copy gone, removing");
        {
            let mut state = model.state();
            state.status = Status::Removed;
            state.saved = None;
            state.saving = None;
            state.publish = None;
            state.sync_local_markers();
        }
        self.remove_from_models(model);
        model.emit(&ModelEvent::RemoteRemove);
        operation::add(model, OperationKind::RemoveNow, Cascade::ALL);
        true
    }

    /// Drop the registered model for `key` after a remote deletion.
    pub fn destroy_local_model(&self, key: &str) -> bool {
        match self.get(key) {
            Some(model) => self.destroy_model(&model),
            None => false,
        }
    }

    /// Apply a message received on the live channel.
    pub fn handle_live(&self, message: LiveMessage) {
        tracing::trace!(entity = self.name(), key = %message.key, op = ?message.op, "live message");
        match message.op {
            LiveOp::Save => match message.model {
                Some(encoded) => {
                    self.put_remote_data(encoded, Some(message.key), None, false);
                }
                None => tracing::debug!(entity = self.name(), "live save without a model ignored"),
            },
            LiveOp::Remove => {
                self.destroy_local_model(&message.key);
            }
        }
    }
}
