use super::{Database, DatabaseEvent};
use crate::backend::RestFailure;
use crate::network::NetworkEvent;
use crate::operation::{self, OperationKind};
use crate::{CacheMode, Cascade, Key, LoadMode, LocalRecord, Model, Record, Status, StoreError};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

impl Database {
    /// Load persisted models, resume interrupted writes and start the first
    /// remote load.
    pub(crate) fn init(&self) {
        self.listen_network();

        if self.cache() == CacheMode::None {
            tracing::debug!(entity = self.name(), "no local cache, skipping local load");
            self.loaded_locally(Vec::new());
            return;
        }

        let on_success = {
            let db = self.clone();
            Box::new(move |records: Vec<Record>, keys: Vec<Key>| db.on_local_load(records, keys))
        };
        let on_failure = {
            let db = self.clone();
            Box::new(move |error: StoreError| {
                tracing::warn!(entity = db.name(), error = %error, "local load failed");
                db.emit(&DatabaseEvent::LocalLoadFailure(error));
                db.loaded_locally(Vec::new());
            })
        };
        self.store().all(on_success, on_failure);
    }

    fn on_local_load(&self, records: Vec<Record>, keys: Vec<Key>) {
        let mut loaded = Vec::with_capacity(records.len());
        let mut resume = Vec::new();

        for (record, key) in records.into_iter().zip(keys) {
            let local = LocalRecord::from_record(record);
            if local.status == Status::Removed {
                self.purge_local(key);
                continue;
            }

            let model = self.build_model(self.decode(&local.fields), true);
            let status = local.status;
            {
                let mut state = model.state();
                state.status = status;
                state.saved = local.saved.clone();
                state.saving = local.saving.clone();
                state.publish = local.publish.clone();
                if self.cache() == CacheMode::All {
                    state.local = Some(local);
                }
            }

            match status {
                Status::RemovePending => {
                    self.mark_removing(model.key());
                    resume.push((model, OperationKind::RemoveRemote));
                }
                Status::SavePending => {
                    resume.push((model.clone(), OperationKind::SaveRemote));
                    loaded.push(model);
                }
                _ => loaded.push(model),
            }
        }

        tracing::debug!(
            entity = self.name(),
            loaded = loaded.len(),
            resumed = resume.len(),
            "local load complete"
        );
        self.save_all_to_models(loaded);
        self.emit(&DatabaseEvent::LocalLoad);
        self.loaded_locally(resume);
    }

    fn loaded_locally(&self, resume: Vec<(Model, OperationKind)>) {
        self.inner.ready.resolve(());
        for (model, kind) in resume {
            operation::add(&model, kind, Cascade::ALL);
        }
        if self.load_mode() == LoadMode::All {
            self.refresh();
        }
    }

    /// Drop a stored record left behind by a completed removal.
    fn purge_local(&self, key: Key) {
        tracing::trace!(entity = self.name(), key = %key, "purging removed record");
        let on_failure = {
            let name = self.name().to_string();
            Box::new(move |key: Key, error: StoreError| {
                tracing::warn!(entity = %name, key = %key, error = %error, "purge failed");
            })
        };
        self.store()
            .remove(key, Box::new(|_key: Key, _record: Option<Record>| {}), on_failure);
    }

    fn listen_network(&self) {
        let db = self.downgrade();
        self.network().on(move |event| {
            if *event != NetworkEvent::Online {
                return;
            }
            if let Some(db) = db.upgrade() {
                db.on_online();
            }
        });
    }

    /// Run `resume` on the next online transition. The refresh that
    /// transition triggers waits until every parked operation has run.
    pub(crate) fn resume_when_online<F>(&self, resume: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.parked.fetch_add(1, Ordering::SeqCst);
        let db = self.clone();
        self.network().once_online(move || {
            db.inner.parked.fetch_sub(1, Ordering::SeqCst);
            resume();
            if db.pending_operations() == 0 {
                db.on_operations_rest();
            }
        });
    }

    fn on_online(&self) {
        let wanted = {
            let mut load = self.inner.load.lock();
            let wanted = self.auto_refresh() || load.refresh_on_online;
            load.refresh_on_online = false;
            let waiting = self.pending_operations() > 0 || self.inner.parked.load(Ordering::SeqCst) > 0;
            if wanted && waiting {
                // resumed writes go first
                load.refresh_on_rest = true;
                return;
            }
            wanted
        };
        if wanted {
            self.refresh();
        }
    }

    pub(super) fn on_operations_rest(&self) {
        if self.inner.parked.load(Ordering::SeqCst) > 0 {
            return;
        }
        let refresh = std::mem::take(&mut self.inner.load.lock().refresh_on_rest);
        if refresh {
            self.refresh();
        }
    }

    /// Load every record from the remote service and reconcile.
    ///
    /// Synced models absent from the response are removed locally.
    pub fn refresh(&self) {
        tracing::debug!(entity = self.name(), "remote load");
        let on_success = {
            let db = self.clone();
            Box::new(move |records: Vec<Record>| db.on_remote_load(records))
        };
        let on_failure = {
            let db = self.clone();
            Box::new(move |_records: Vec<Record>, status: u16| match RestFailure::classify(status) {
                RestFailure::Offline => {
                    tracing::debug!(entity = db.name(), "remote load offline, will retry");
                    db.network().report_unreachable();
                    db.inner.load.lock().refresh_on_online = true;
                    db.emit(&DatabaseEvent::RemoteLoadOffline);
                }
                _ => {
                    tracing::warn!(entity = db.name(), status, "remote load failed");
                    db.emit(&DatabaseEvent::RemoteLoadFailure { status });
                }
            })
        };
        self.rest().all(on_success, on_failure);
    }

    fn on_remote_load(&self, records: Vec<Record>) {
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            if let Some(key) = self.key_of(&record) {
                seen.insert(key);
            }
            if let Some(model) = self.put_remote_data(record, None, None, false) {
                seen.insert(model.key());
            }
        }

        let mut destroyed = 0usize;
        for model in self.all() {
            if seen.contains(&model.key()) || model.status() != Status::Synced || !model.is_saved() {
                continue;
            }
            if self.destroy_model(&model) {
                destroyed += 1;
            }
        }

        self.inner.load.lock().remote_loaded = true;
        tracing::debug!(entity = self.name(), models = self.len(), destroyed, "remote load complete");
        self.emit(&DatabaseEvent::RemoteLoad);
    }
}
