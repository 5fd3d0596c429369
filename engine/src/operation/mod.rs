//! Per-model operation queues.
//!
//! Each model runs at most one operation at a time. An operation calls
//! [`OperationContext::finish`] exactly once, after which the next queued
//! operation starts. Interrupting operations (local removal) replace
//! everything still queued behind the running one.
//!
//! The database counts operations in flight; when the count returns to zero
//! a deferred refresh may run.

mod get;
mod remove;
mod save;

use crate::{Cascade, Database, LocalRecord, Model};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

/// The unit steps of model synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Read the local copy, then cascade to [`GetRemote`](Self::GetRemote).
    GetLocal,
    GetRemote,
    /// Persist the pending state locally, then cascade to [`SaveRemote`](Self::SaveRemote).
    SaveLocal,
    SaveRemote,
    /// Write the local mirror as it stands.
    SaveNow,
    /// Mark the local copy removal-pending, then cascade to [`RemoveRemote`](Self::RemoveRemote).
    RemoveLocal,
    RemoveRemote,
    /// Drop the local copy for good.
    RemoveNow,
    /// Drop a local copy kept only while a write was pending.
    RemoveCache,
}

impl OperationKind {
    /// Whether queuing this kind discards what is already queued.
    pub fn interrupts(self) -> bool {
        matches!(self, OperationKind::RemoveLocal | OperationKind::RemoveNow)
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::GetLocal => "GetLocal",
            OperationKind::GetRemote => "GetRemote",
            OperationKind::SaveLocal => "SaveLocal",
            OperationKind::SaveRemote => "SaveRemote",
            OperationKind::SaveNow => "SaveNow",
            OperationKind::RemoveLocal => "RemoveLocal",
            OperationKind::RemoveRemote => "RemoveRemote",
            OperationKind::RemoveNow => "RemoveNow",
            OperationKind::RemoveCache => "RemoveCache",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Operation {
    id: u64,
    kind: OperationKind,
    cascade: Cascade,
}

impl Operation {
    fn new(kind: OperationKind, cascade: Cascade) -> Self {
        Self {
            id: NEXT_OPERATION.fetch_add(1, Ordering::Relaxed),
            kind,
            cascade,
        }
    }
}

/// The running operation and its successors.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    running: Option<Operation>,
    queued: VecDeque<Operation>,
}

impl OperationQueue {
    /// Queue `op`, returning it when it should start immediately.
    fn enqueue(&mut self, op: Operation) -> Option<Operation> {
        if self.running.is_none() {
            self.running = Some(op);
            return Some(op);
        }
        if op.kind.interrupts() {
            self.queued.clear();
        }
        self.queued.push_back(op);
        None
    }

    fn insert_next(&mut self, op: Operation) {
        self.queued.push_front(op);
    }

    fn try_next(&mut self, op: Operation) -> bool {
        if self.queued.is_empty() {
            self.queued.push_back(op);
            true
        } else {
            false
        }
    }

    fn is_running(&self, id: u64) -> bool {
        self.running.is_some_and(|op| op.id == id)
    }

    /// Complete the running operation and promote the next one.
    fn complete(&mut self, id: u64) -> Option<Operation> {
        if !self.is_running(id) {
            return None;
        }
        self.running = self.queued.pop_front();
        self.running
    }

    pub fn is_busy(&self) -> bool {
        self.running.is_some()
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.running
            .iter()
            .chain(self.queued.iter())
            .map(|op| op.kind)
            .collect()
    }
}

/// Queue an operation on `model`, starting it if the model is idle.
pub(crate) fn add(model: &Model, kind: OperationKind, cascade: Cascade) {
    let op = Operation::new(kind, cascade);
    let start = model.state().queue.enqueue(op);
    match start {
        Some(op) => execute(model.clone(), op),
        None => tracing::trace!(entity = model.entity(), op = %kind, "operation queued"),
    }
}

fn execute(model: Model, op: Operation) {
    let db = model.database().clone();
    db.operation_started();
    tracing::trace!(entity = model.entity(), key = %model.key(), op = %op.kind, "operation started");

    let ctx = OperationContext {
        model,
        db,
        op,
        finished: Arc::new(AtomicBool::new(false)),
    };
    match op.kind {
        OperationKind::GetLocal => get::get_local(ctx),
        OperationKind::GetRemote => get::get_remote(ctx),
        OperationKind::SaveLocal => save::save_local(ctx),
        OperationKind::SaveRemote => save::save_remote(ctx),
        OperationKind::SaveNow => save::save_now(ctx),
        OperationKind::RemoveLocal => remove::remove_local(ctx),
        OperationKind::RemoveRemote => remove::remove_remote(ctx),
        OperationKind::RemoveNow => remove::remove_now(ctx),
        OperationKind::RemoveCache => remove::remove_cache(ctx),
    }
}

/// The record local storage should hold for `model` right now.
pub(crate) fn local_snapshot(model: &Model) -> LocalRecord {
    let fields = model.to_json(false);
    let state = model.state();
    LocalRecord {
        fields,
        status: state.status,
        saved: state.saved.clone(),
        saving: state.saving.clone(),
        publish: state.publish.clone(),
    }
}

/// What a running operation knows about itself.
#[derive(Clone)]
pub(crate) struct OperationContext {
    pub model: Model,
    pub db: Database,
    op: Operation,
    finished: Arc<AtomicBool>,
}

impl OperationContext {
    pub fn cascade(&self) -> Cascade {
        self.op.cascade
    }

    pub fn can_cascade(&self, cascade: Cascade) -> bool {
        self.op.cascade.allows(cascade)
    }

    /// Run `kind` right after this operation, ahead of anything queued.
    pub fn insert_next(&self, kind: OperationKind) {
        let mut state = self.model.state();
        if state.queue.is_running(self.op.id) {
            state
                .queue
                .insert_next(Operation::new(kind, self.op.cascade));
        }
    }

    /// Queue `kind` only when nothing else is queued.
    pub fn try_next(&self, kind: OperationKind) -> bool {
        let mut state = self.model.state();
        state.queue.is_running(self.op.id)
            && state.queue.try_next(Operation::new(kind, self.op.cascade))
    }

    /// Queue whatever keeps local storage in line with a synced model.
    pub fn insert_persist_synced(&self) {
        match self.db.cache() {
            crate::CacheMode::All => self.insert_next(OperationKind::SaveNow),
            crate::CacheMode::Pending => self.insert_next(OperationKind::RemoveCache),
            crate::CacheMode::None => {}
        }
    }

    /// Complete this operation. Later calls are ignored.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::trace!(entity = self.model.entity(), op = %self.op.kind, "operation finished");
        let next = self.model.state().queue.complete(self.op.id);
        if let Some(next) = next {
            execute(self.model.clone(), next);
        }
        self.db.operation_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind) -> Operation {
        Operation::new(kind, Cascade::ALL)
    }

    #[test]
    fn idle_queue_starts_immediately() {
        let mut queue = OperationQueue::default();
        let first = op(OperationKind::SaveLocal);
        assert_eq!(queue.enqueue(first), Some(first));
        assert!(queue.is_busy());
        assert_eq!(queue.enqueue(op(OperationKind::SaveLocal)), None);
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::SaveLocal, OperationKind::SaveLocal]
        );
    }

    #[test]
    fn interrupting_kind_replaces_queued() {
        let mut queue = OperationQueue::default();
        queue.enqueue(op(OperationKind::SaveLocal));
        queue.enqueue(op(OperationKind::SaveRemote));
        queue.enqueue(op(OperationKind::SaveNow));
        queue.enqueue(op(OperationKind::RemoveLocal));
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::SaveLocal, OperationKind::RemoveLocal]
        );
    }

    #[test]
    fn insert_next_jumps_the_line() {
        let mut queue = OperationQueue::default();
        let running = op(OperationKind::SaveLocal);
        queue.enqueue(running);
        queue.enqueue(op(OperationKind::GetLocal));
        queue.insert_next(op(OperationKind::SaveRemote));

        let next = queue.complete(running.id).unwrap();
        assert_eq!(next.kind, OperationKind::SaveRemote);
        assert_eq!(queue.kinds(), vec![OperationKind::SaveRemote, OperationKind::GetLocal]);
    }

    #[test]
    fn try_next_only_when_empty() {
        let mut queue = OperationQueue::default();
        queue.enqueue(op(OperationKind::SaveLocal));
        assert!(queue.try_next(op(OperationKind::SaveRemote)));
        assert!(!queue.try_next(op(OperationKind::SaveRemote)));
    }

    #[test]
    fn complete_ignores_stale_ids() {
        let mut queue = OperationQueue::default();
        let running = op(OperationKind::SaveLocal);
        queue.enqueue(running);
        assert_eq!(queue.complete(running.id + 1000), None);
        assert!(queue.is_busy());
        assert_eq!(queue.complete(running.id), None);
        assert!(!queue.is_busy());
    }
}
