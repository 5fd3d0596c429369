use super::{OperationContext, OperationKind};
use crate::backend::RestFailure;
use crate::model::ModelEvent;
use crate::{CacheMode, Cascade, Key, LocalRecord, Record, Status, StoreError};

pub(super) fn get_local(ctx: OperationContext) {
    let model = ctx.model.clone();
    if model.is_deleted() {
        ctx.finish();
        return;
    }
    if ctx.db.cache() != CacheMode::All || !ctx.can_cascade(Cascade::LOCAL) {
        if ctx.can_cascade(Cascade::REST) {
            ctx.insert_next(OperationKind::GetRemote);
        }
        ctx.finish();
        return;
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |_key: Key, record: Option<Record>| {
            if let Some(record) = record {
                let local = LocalRecord::from_record(record);
                let decoded = ctx.db.decode(&local.fields);
                let resume = {
                    let mut state = ctx.model.state();
                    // a stored write this instance never knew about
                    let resume = (state.status == Status::Synced && local.status.is_pending())
                        .then_some(local.status);
                    if resume.is_some() {
                        state.status = local.status;
                        state.saving = local.saving.clone();
                        state.publish = local.publish.clone();
                    }
                    state.saved = local.saved.clone();
                    state.local = Some(local);
                    resume
                };
                ctx.model.assign(decoded, true);
                ctx.model.emit(&ModelEvent::LocalGet);

                match resume {
                    Some(Status::SavePending) => {
                        tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), "resuming stored save");
                        ctx.db.save_to_models(&ctx.model, false);
                        ctx.insert_next(OperationKind::SaveRemote);
                        ctx.finish();
                        return;
                    }
                    Some(Status::RemovePending) => {
                        tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), "resuming stored removal");
                        ctx.db.remove_from_models(&ctx.model);
                        ctx.db.mark_removing(ctx.model.key());
                        ctx.insert_next(OperationKind::RemoveRemote);
                        ctx.finish();
                        return;
                    }
                    _ => {}
                }
            }
            if ctx.can_cascade(Cascade::REST) {
                ctx.insert_next(OperationKind::GetRemote);
            }
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |key: Key, error: StoreError| {
            tracing::warn!(entity = ctx.db.name(), key = %key, error = %error, "local get failed");
            ctx.model.emit(&ModelEvent::LocalGetFailure(error));
            if ctx.can_cascade(Cascade::REST) {
                ctx.insert_next(OperationKind::GetRemote);
            }
            ctx.finish();
        })
    };
    ctx.db.store().get(model.key(), on_success, on_failure);
}

pub(super) fn get_remote(ctx: OperationContext) {
    let model = ctx.model.clone();
    if model.is_deleted() || !ctx.can_cascade(Cascade::REST) {
        ctx.finish();
        return;
    }

    let on_success = {
        let ctx = ctx.clone();
        Box::new(move |response: Option<Record>| {
            if let Some(data) = response {
                let key = ctx.model.key();
                ctx.db
                    .put_remote_data(data, Some(key), Some(ctx.model.clone()), false);
            }
            ctx.model.emit(&ModelEvent::RemoteGet);
            ctx.finish();
        })
    };
    let on_failure = {
        let ctx = ctx.clone();
        Box::new(move |_response: Option<Record>, status: u16| {
            match RestFailure::classify(status) {
                RestFailure::Offline => {
                    tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), "remote get offline, will resume");
                    ctx.db.network().report_unreachable();
                    ctx.model.emit(&ModelEvent::RemoteGetOffline);
                    let model = ctx.model.clone();
                    let cascade = ctx.cascade();
                    ctx.db.resume_when_online(move || {
                        super::add(&model, OperationKind::GetRemote, cascade);
                    });
                }
                RestFailure::Gone => {
                    tracing::debug!(entity = ctx.db.name(), key = %ctx.model.key(), status, "remote record gone");
                    ctx.db.destroy_model(&ctx.model);
                    ctx.model.emit(&ModelEvent::RemoteGetFailure { status });
                }
                RestFailure::Conflict | RestFailure::Rejected(_) => {
                    tracing::warn!(entity = ctx.db.name(), key = %ctx.model.key(), status, "remote get failed");
                    ctx.model.emit(&ModelEvent::RemoteGetFailure { status });
                }
            }
            ctx.finish();
        })
    };
    ctx.db.rest().get(&model, on_success, on_failure);
}
