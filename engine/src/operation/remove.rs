use super::{local_snapshot, OperationContext, OperationKind};
use crate::backend::{LiveMessage, RestFailure};
use crate::model::ModelEvent;
use crate::{CacheMode, Cascade, Key, Record, Status, StoreError};

/// Nothing remote to remove: the model is gone once the local copy is.
fn removed_locally(ctx: &OperationContext) {
    {
        let mut state = ctx.model.state();
        state.status = Status::Removed;
        state.local = None;
        state.saving = None;
        state.publish = None;
    }
    ctx.db.removal_finished(&ctx.model.key());
    ctx.model.detach_relations();
}

pub(super) fn remove_local(ctx: OperationContext) {
    let model = ctx.model.clone();
    {
        let mut state = model.state();
        if state.status != Status::Removed {
            state.status = Status::RemovePending;
        }
        state.sync_local_markers();
    }
    let remote = model.is_saved() && ctx.can_cascade(Cascade::REMOTE);

    if ctx.db.cache() == CacheMode::None || !ctx.can_cascade(Cascade::LOCAL) {
        if remote {
            ctx.insert_next(OperationKind::RemoveRemote);
        } else {
            removed_locally(&ctx);
        }
        ctx.finish();
        return;
    }

    if remote {
        // keep a removal-pending record so the remote removal survives a restart
        let local = local_snapshot(&model);
        let record = local.to_record();
        if ctx.db.cache() == CacheMode::All {
            model.state().local = Some(local);
        }
        let on_success = {
            let ctx = ctx.clone();
            Box::new(move |_key: Key, _record: Record| {
                ctx.model.emit(&ModelEvent::LocalRemove);
                ctx.insert_next(OperationKind::RemoveRemote);
                ctx.finish();
            })
        };
        let on_failure = {
            let ctx = ctx.clone();
            Box::new(move |key: Key, _record: Record, error: StoreError| {
                tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local remove failed");
                ctx.model.emit(&ModelEvent::LocalRemoveFailure(error));
                ctx.insert_next(OperationKind::RemoveRemote);
                ctx.finish();
            })
        };
        ctx.db.store().put(model.key(), record, on_success, on_failure);
    } else {
        let on_success = {
            let ctx = ctx.clone();
            Box::new(move |_key: Key, _record: Option<Record>| {
                ctx.model.emit(&ModelEvent::LocalRemove);
                removed_locally(&ctx);
                ctx.finish();
            })
        };
        let on_failure = {
            let ctx = ctx.clone();
            Box::new(move |key: Key, error: StoreError| {
                tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local remove failed");
                ctx.model.emit(&ModelEvent::LocalRemoveFailure(error));
                removed_locally(&ctx);
                ctx.finish();
            })
        };
        ctx.db.store().remove(model.key(), on_success, on_failure);
    }
}

fn removed_remotely(ctx: &OperationContext) {
    {
        let mut state = ctx.model.state();
        state.status = Status::Removed;
        state.saved = None;
        state.saving = None;
        state.publish = None;
        state.sync_local_markers();
    }
    ctx.model.emit(&ModelEvent::RemoteRemove);
    ctx.insert_next(OperationKind::RemoveNow);
}

fn publish_remove(ctx: &OperationContext) {
    if ctx.can_cascade(Cascade::LIVE) {
        ctx.db.publish(LiveMessage::remove(ctx.model.key()));
    }
}

pub(super) fn remove_remote(ctx: OperationContext) {
    let model = ctx.model.clone();
    if model.status() == Status::Removed {
        ctx.finish();
        return;
    }
    if !ctx.can_cascade(Cascade::REST) {
        removed_remotely(&ctx);
        publish_remove(&ctx);
        ctx.finish();
        return;
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_response: Option<Record>| {
            tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), "remote remove acknowledged");
            removed_remotely(&ctx);
            publish_remove(&ctx);
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |_response: Option<Record>, status: u16| {
            match RestFailure::classify(status) {
                RestFailure::Gone => removed_remotely(&ctx),
                RestFailure::Offline => {
                    tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), "remote remove offline, will resume");
                    ctx.db.network().report_unreachable();
                    ctx.model.emit(&ModelEvent::RemoteRemoveOffline);
                    let waiting = ctx.model.clone();
                    let cascade = ctx.cascade();
                    ctx.db.resume_when_online(move || {
                        super::add(&waiting, OperationKind::RemoveRemote, cascade);
                    });
                }
                RestFailure::Conflict | RestFailure::Rejected(_) => {
                    tracing::warn!(entity = ctx.db.name(), key = %ctx.model.key(), status, "remote remove rejected, restoring model");
                    ctx.model.state().mark_synced();
                    ctx.db.save_to_models(&ctx.model, false);
                    ctx.insert_persist_synced();
                    ctx.model.emit(&ModelEvent::RemoteRemoveFailure { status });
                }
            }
            ctx.finish();
        })
    };
    ctx.db.rest().remove(&model, on_success, on_failure);
}

/// Drop the local copy for good.
pub(super) fn remove_now(ctx: OperationContext) {
    let model = ctx.model.clone();
    {
        let mut state = model.state();
        state.status = Status::Removed;
        state.sync_local_markers();
    }
    ctx.db.remove_from_models(&model);
    ctx.db.removal_finished(&model.key());

    if ctx.db.cache() == CacheMode::None {
        model.state().local = None;
        model.detach_relations();
        ctx.finish();
        return;
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_key: Key, _record: Option<Record>| {
            ctx.model.state().local = None;
            ctx.model.detach_relations();
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |key: Key, error: StoreError| {
            tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local remove failed");
            ctx.model.emit(&ModelEvent::LocalRemoveFailure(error));
            ctx.model.detach_relations();
            ctx.finish();
        })
    };
    ctx.db.store().remove(model.key(), on_success, on_failure);
}

/// Drop a copy kept only while a write was outstanding.
pub(super) fn remove_cache(ctx: OperationContext) {
    let model = ctx.model.clone();
    if ctx.db.cache() != CacheMode::Pending || model.status().is_pending() {
        ctx.finish();
        return;
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_key: Key, _record: Option<Record>| ctx.finish())
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |key: Key, error: StoreError| {
            tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "cache eviction failed");
            ctx.finish();
        })
    };
    ctx.db.store().remove(model.key(), on_success, on_failure);
}
