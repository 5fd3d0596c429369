use super::ModelCollection;
use crate::backend::RestFailure;
use crate::database::DatabaseEvent;
use crate::events::{EventBus, ListenerId};
use crate::{Database, Model, Record};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Progress of a [`RemoteQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Loaded,
    /// Unreachable; the query reruns on the next online transition.
    Offline,
    Failed(u16),
}

#[derive(Debug, Clone)]
pub enum QueryEvent {
    Loaded,
    Offline,
    Failure { status: u16 },
    /// A result left the database registry.
    Remove(Model),
}

struct QueryInner {
    db: Database,
    query: Value,
    status: Mutex<QueryStatus>,
    results: Mutex<ModelCollection>,
    events: EventBus<QueryEvent>,
}

/// The results of a remote query, reconciled into the database.
pub struct RemoteQuery {
    inner: Arc<QueryInner>,
    listener: ListenerId,
}

impl std::fmt::Debug for RemoteQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQuery")
            .field("entity", &self.inner.db.name())
            .field("query", &self.inner.query)
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}

impl QueryInner {
    fn run(self: &Arc<Self>) {
        *self.status.lock() = QueryStatus::Pending;
        let on_success = Arc::downgrade(self);
        let on_failure = Arc::downgrade(self);
        self.db.rest().query(
            self.query.clone(),
            Box::new(move |records: Vec<Record>| {
                if let Some(inner) = on_success.upgrade() {
                    inner.loaded(records);
                }
            }),
            Box::new(move |_: Vec<Record>, status: u16| {
                if let Some(inner) = on_failure.upgrade() {
                    inner.failed(status);
                }
            }),
        );
    }

    fn loaded(&self, records: Vec<Record>) {
        let models: Vec<Model> = records
            .into_iter()
            .filter_map(|record| self.db.put_remote_data(record, None, None, false))
            .collect();
        tracing::debug!(
            entity = %self.db.name(),
            results = models.len(),
            "query loaded"
        );
        {
            let mut results = self.results.lock();
            results.clear();
            for model in models {
                results.put(model);
            }
            results.sort();
        }
        *self.status.lock() = QueryStatus::Loaded;
        self.events.emit(&QueryEvent::Loaded);
    }

    fn failed(self: &Arc<Self>, status: u16) {
        match RestFailure::classify(status) {
            RestFailure::Offline => {
                *self.status.lock() = QueryStatus::Offline;
                let network = self.db.network().clone();
                network.report_unreachable();
                let weak = Arc::downgrade(self);
                network.once_online(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.run();
                    }
                });
                self.events.emit(&QueryEvent::Offline);
            }
            _ => {
                tracing::warn!(entity = %self.db.name(), status, "query failed");
                *self.status.lock() = QueryStatus::Failed(status);
                self.events.emit(&QueryEvent::Failure { status });
            }
        }
    }

    fn on_database(&self, event: &DatabaseEvent) {
        let DatabaseEvent::ModelRemoved { model } = event else {
            return;
        };
        let removed = {
            let mut results = self.results.lock();
            let key = model.key();
            if results.contains(&key, model) {
                results.remove(&key)
            } else {
                None
            }
        };
        if let Some(model) = removed {
            self.events.emit(&QueryEvent::Remove(model));
        }
    }
}

impl RemoteQuery {
    /// A query that has not run yet. See [`Database::query`].
    pub fn new(db: Database, query: Value) -> Self {
        let inner = Arc::new(QueryInner {
            results: Mutex::new(ModelCollection::new(db.comparator())),
            db,
            query,
            status: Mutex::new(QueryStatus::Pending),
            events: EventBus::new(),
        });
        let weak: Weak<QueryInner> = Arc::downgrade(&inner);
        let listener = inner.db.on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_database(event);
            }
        });
        Self { inner, listener }
    }

    /// Send the query. Running again replaces the results.
    pub fn run(&self) {
        self.inner.run();
    }

    pub fn query(&self) -> &Value {
        &self.inner.query
    }

    pub fn status(&self) -> QueryStatus {
        *self.inner.status.lock()
    }

    pub fn models(&self) -> Vec<Model> {
        self.inner.results.lock().to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.results.lock().is_empty()
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }
}

impl Drop for RemoteQuery {
    fn drop(&mut self) {
        self.inner.db.off(self.listener);
    }
}
