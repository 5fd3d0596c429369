use super::{local_snapshot, OperationContext, OperationKind};
use crate::backend::{LiveMessage, RestFailure};
use crate::model::ModelEvent;
use crate::{CacheMode, Cascade, Key, LocalRecord, Record, Status, StoreError};

/// Snapshot what the next remote save sends and publishes.
///
/// Payloads are diffed against the last acknowledged snapshot, so changes of
/// an earlier unacknowledged save are carried along.
fn mark_saving(ctx: &OperationContext) {
    let model = &ctx.model;
    let remote = model.to_json(true);
    let changes = model.changes_from(&remote);
    let saving = if ctx.db.full_save() {
        remote
    } else {
        changes.clone()
    };
    let publish = if ctx.db.full_publish() {
        model.to_json(false)
    } else {
        changes
    };

    let mut state = model.state();
    state.status = Status::SavePending;
    state.saving = Some(saving);
    state.publish = Some(publish);
    state.sync_local_markers();
}

fn cascade_remote(ctx: &OperationContext) {
    if ctx.can_cascade(Cascade::REMOTE) {
        ctx.insert_next(OperationKind::SaveRemote);
    }
}

pub(super) fn save_local(ctx: OperationContext) {
    let model = ctx.model.clone();
    if model.is_deleted() {
        tracing::debug!(entity = ctx.db.name(), key = %model.key(), "local save skipped, model removed");
        ctx.finish();
        return;
    }

    let remote = ctx.can_cascade(Cascade::REMOTE);
    if ctx.db.cache() == CacheMode::None || !ctx.can_cascade(Cascade::LOCAL) {
        if remote {
            mark_saving(&ctx);
            ctx.try_next(OperationKind::SaveRemote);
        }
        ctx.finish();
        return;
    }

    if remote {
        mark_saving(&ctx);
    }
    let local = local_snapshot(&model);
    let record = local.to_record();
    if ctx.db.cache() == CacheMode::All {
        model.state().local = Some(local);
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_key: Key, _record: Record| {
            ctx.model.emit(&ModelEvent::LocalSave);
            cascade_remote(&ctx);
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |key: Key, _record: Record, error: StoreError| {
            // a failed local write must not hold back the remote one
            tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local save failed");
            ctx.model.emit(&ModelEvent::LocalSaveFailure(error));
            cascade_remote(&ctx);
            ctx.finish();
        })
    };
    ctx.db.store().put(model.key(), record, on_success, on_failure);
}

pub(super) fn save_remote(ctx: OperationContext) {
    let model = ctx.model.clone();
    if model.is_deleted() {
        tracing::debug!(entity = ctx.db.name(), key = %model.key(), "remote save skipped, model removed");
        let mut state = model.state();
        state.saving = None;
        state.publish = None;
        state.sync_local_markers();
        drop(state);
        ctx.finish();
        return;
    }

    if model.state().saving.is_none() {
        mark_saving(&ctx);
    }

    if !ctx.can_cascade(Cascade::REST) {
        publish_live(&ctx);
        model.state().mark_synced();
        ctx.insert_persist_synced();
        ctx.finish();
        return;
    }

    if let Some(dependency) = model.unsaved_dependency() {
        tracing::debug!(
            entity = ctx.db.name(),
            key = %model.key(),
            dependency = dependency.entity(),
            "remote save waiting for dependency"
        );
        let waiting = model.clone();
        let cascade = ctx.cascade();
        dependency.once_when(
            |event| {
                matches!(
                    event,
                    ModelEvent::RemoteSave | ModelEvent::RemoteSaveFailure { .. } | ModelEvent::Removed
                )
            },
            move |_| super::add(&waiting, OperationKind::SaveRemote, cascade),
        );
        ctx.finish();
        return;
    }

    let saving = model.saving().unwrap_or_default();
    let updating = model.is_saved();

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |response: Option<Record>| {
            handle_data(&ctx, response);
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |response: Option<Record>, status: u16| {
            match RestFailure::classify(status) {
                RestFailure::Offline => handle_offline(&ctx),
                RestFailure::Conflict => handle_conflict(&ctx, response),
                RestFailure::Gone if updating => handle_gone(&ctx, status),
                RestFailure::Gone | RestFailure::Rejected(_) => handle_rejected(&ctx, status),
            }
            ctx.finish();
        })
    };

    if updating {
        ctx.db.rest().update(&model, saving, on_success, on_failure);
    } else {
        ctx.db.rest().create(&model, saving, on_success, on_failure);
    }
}

fn merge_into(target: &mut Record, source: &Record) {
    for (field, value) in source {
        target.insert(field.clone(), value.clone());
    }
}

/// Apply an acknowledged save and advance the saved snapshot.
fn handle_data(ctx: &OperationContext, response: Option<Record>) {
    let model = &ctx.model;
    let (saving, publish, saved_before) = {
        let state = model.state();
        (
            state.saving.clone().unwrap_or_default(),
            state.publish.clone(),
            state.saved.clone(),
        )
    };

    if model.is_deleted() {
        // removed while the save was in flight: keep the remote copy so the
        // queued removal reaches it
        let mut state = model.state();
        let saved = state.saved.get_or_insert_with(Record::new);
        merge_into(saved, &saving);
        if let Some(response) = &response {
            merge_into(saved, response);
        }
        state.saving = None;
        state.publish = None;
        return;
    }

    if let Some(response) = &response {
        // echoes of what we sent are skipped so edits made in flight survive
        let current = model.to_json(true);
        let mut applied = Record::new();
        for (field, value) in response {
            let sent = saving.get(field);
            if sent == Some(value) {
                continue;
            }
            let untouched = current.get(field) == saved_before.as_ref().and_then(|s| s.get(field));
            if sent.is_some() || untouched {
                applied.insert(field.clone(), value.clone());
            }
        }
        if !applied.is_empty() {
            model.assign_encoded(&applied);
        }
    }

    {
        let mut state = model.state();
        let saved = state.saved.get_or_insert_with(Record::new);
        merge_into(saved, &saving);
        if let Some(response) = &response {
            merge_into(saved, response);
        }
        state.mark_synced();
    }
    ctx.insert_persist_synced();

    if ctx.can_cascade(Cascade::LIVE) {
        if let Some(publish) = publish {
            ctx.db.publish(LiveMessage::save(model.key(), publish));
        }
    }
    tracing::debug!(entity = ctx.db.name(), key = %model.key(), "remote save acknowledged");
    model.emit(&ModelEvent::RemoteSave);
}

fn handle_conflict(ctx: &OperationContext, response: Option<Record>) {
    let model = &ctx.model;
    tracing::info!(entity = ctx.db.name(), key = %model.key(), "remote save conflict, merging server copy");
    if let Some(data) = response.clone() {
        ctx.db
            .put_remote_data(data, Some(model.key()), Some(model.clone()), false);
    }
    model.state().mark_synced();
    ctx.insert_persist_synced();
    model.emit(&ModelEvent::RemoteSaveConflict { response });
}

fn handle_gone(ctx: &OperationContext, status: u16) {
    let model = &ctx.model;
    tracing::info!(entity = ctx.db.name(), key = %model.key(), status, "remote record gone, removing locally");
    {
        let mut state = model.state();
        state.status = Status::Removed;
        state.saved = None;
        state.saving = None;
        state.publish = None;
        state.sync_local_markers();
    }
    ctx.db.remove_from_models(model);
    ctx.insert_next(OperationKind::RemoveNow);
    model.emit(&ModelEvent::RemoteSaveFailure { status });
}

fn handle_offline(ctx: &OperationContext) {
    let model = &ctx.model;
    tracing::debug!(entity = ctx.db.name(), key = %model.key(), "remote save offline, will resume");
    ctx.db.network().report_unreachable();
    model.emit(&ModelEvent::RemoteSaveOffline);

    let waiting = model.clone();
    let cascade = ctx.cascade();
    ctx.db.resume_when_online(move || {
        super::add(&waiting, OperationKind::SaveRemote, cascade);
    });
}

fn handle_rejected(ctx: &OperationContext, status: u16) {
    let model = &ctx.model;
    tracing::warn!(entity = ctx.db.name(), key = %model.key(), status, "remote save rejected");
    model.state().mark_synced();
    ctx.insert_persist_synced();
    model.emit(&ModelEvent::RemoteSaveFailure { status });
}

fn publish_live(ctx: &OperationContext) {
    if !ctx.can_cascade(Cascade::LIVE) {
        return;
    }
    if let Some(publish) = ctx.model.publish() {
        ctx.db.publish(LiveMessage::save(ctx.model.key(), publish));
    }
}

/// Write the local mirror as it stands.
pub(super) fn save_now(ctx: OperationContext) {
    let model = ctx.model.clone();
    if ctx.db.cache() != CacheMode::All || model.status() == Status::Removed {
        ctx.finish();
        return;
    }

    let fields = if model.state().local.is_none() {
        Some(model.to_json(false))
    } else {
        None
    };
    let record = {
        let mut state = model.state();
        if state.local.is_none() {
            let status = state.status;
            state.local = Some(LocalRecord::new(fields.unwrap_or_default(), status));
        }
        state.sync_local_markers();
        state.local.as_ref().map(LocalRecord::to_record)
    };
    let Some(record) = record else {
        ctx.finish();
        return;
    };

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_key: Key, _record: Record| ctx.finish())
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |key: Key, _record: Record, error: StoreError| {
            tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local write failed");
            ctx.model.emit(&ModelEvent::LocalSaveFailure(error));
            ctx.finish();
        })
    };
    ctx.db.store().put(model.key(), record, on_success, on_failure);
}
