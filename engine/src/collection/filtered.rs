use super::ModelCollection;
use crate::compare::Comparator;
use crate::database::DatabaseEvent;
use crate::events::{EventBus, ListenerId};
use crate::{Database, Key, Model};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub type Predicate = Arc<dyn Fn(&Model) -> bool + Send + Sync>;

/// Membership changes of a live view.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Add(Model),
    Remove(Model),
    /// A member changed and still matches.
    Update(Model),
    /// The predicate changed and membership was rebuilt.
    Reset,
}

struct FilteredInner {
    db: Database,
    predicate: Mutex<Predicate>,
    models: Mutex<ModelCollection>,
    events: EventBus<CollectionEvent>,
}

/// A live view of the models in a database registry that match a
/// predicate, kept in the database's sort order.
pub struct FilteredCollection {
    inner: Arc<FilteredInner>,
    listener: ListenerId,
}

impl std::fmt::Debug for FilteredCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteredCollection")
            .field("entity", &self.inner.db.name())
            .field("models", &*self.inner.models.lock())
            .finish()
    }
}

/// Where a model is held, matching by instance so a stale key still resolves.
fn held_under(models: &ModelCollection, model: &Model) -> Option<Key> {
    let key = model.key();
    if models.contains(&key, model) {
        return Some(key);
    }
    models
        .keys()
        .iter()
        .zip(models.models())
        .find(|(_, candidate)| candidate.ptr_eq(model))
        .map(|(key, _)| key.clone())
}

impl FilteredInner {
    fn matches(&self, model: &Model) -> bool {
        let predicate = self.predicate.lock().clone();
        predicate(model)
    }

    fn on_database(&self, event: &DatabaseEvent) {
        match event {
            DatabaseEvent::ModelAdded { model, .. } => {
                if self.matches(model) {
                    self.insert(model);
                }
            }
            DatabaseEvent::ModelRemoved { model } => self.evict(model),
            DatabaseEvent::ModelUpdated { model } => {
                if !self.matches(model) {
                    self.evict(model);
                    return;
                }
                let held = {
                    let mut models = self.models.lock();
                    match held_under(&models, model) {
                        Some(previous) => {
                            let current = model.key();
                            if previous != current {
                                models.remove(&previous);
                                models.put_with_key(current, model.clone());
                            }
                            models.sort();
                            true
                        }
                        None => false,
                    }
                };
                if held {
                    self.events.emit(&CollectionEvent::Update(model.clone()));
                } else {
                    self.insert(model);
                }
            }
            _ => {}
        }
    }

    fn insert(&self, model: &Model) {
        {
            let mut models = self.models.lock();
            if held_under(&models, model).is_some() {
                return;
            }
            models.put(model.clone());
            models.sort();
        }
        self.events.emit(&CollectionEvent::Add(model.clone()));
    }

    fn evict(&self, model: &Model) {
        let removed = {
            let mut models = self.models.lock();
            held_under(&models, model).and_then(|key| models.remove(&key))
        };
        if let Some(model) = removed {
            self.events.emit(&CollectionEvent::Remove(model));
        }
    }

    fn rebuild(&self) {
        let matching: Vec<Model> = self
            .db
            .all()
            .into_iter()
            .filter(|model| self.matches(model))
            .collect();
        let mut models = self.models.lock();
        models.clear();
        for model in matching {
            models.put(model);
        }
        models.sort();
    }
}

impl FilteredCollection {
    pub fn new(db: Database, predicate: Predicate) -> Self {
        let inner = Arc::new(FilteredInner {
            models: Mutex::new(ModelCollection::new(db.comparator())),
            db,
            predicate: Mutex::new(predicate),
            events: EventBus::new(),
        });
        inner.rebuild();

        let weak: Weak<FilteredInner> = Arc::downgrade(&inner);
        let listener = inner.db.on(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_database(event);
            }
        });
        Self { inner, listener }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn models(&self) -> Vec<Model> {
        self.inner.models.lock().to_vec()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.inner.models.lock().keys().to_vec()
    }

    pub fn get(&self, key: &str) -> Option<Model> {
        self.inner.models.lock().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.models.lock().has(key)
    }

    pub fn len(&self) -> usize {
        self.inner.models.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.models.lock().is_empty()
    }

    /// Replace the predicate and rebuild membership.
    pub fn set_predicate<P>(&self, predicate: P)
    where
        P: Fn(&Model) -> bool + Send + Sync + 'static,
    {
        *self.inner.predicate.lock() = Arc::new(predicate);
        self.inner.rebuild();
        self.inner.events.emit(&CollectionEvent::Reset);
    }

    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.inner.models.lock().set_comparator(comparator);
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&CollectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }
}

impl Drop for FilteredCollection {
    fn drop(&mut self) {
        self.inner.db.off(self.listener);
    }
}
