//! The entity registry.
//!
//! A [`Registry`] owns every entity type of an application together with the
//! collaborators they share. Entities are defined in any order: a relation is
//! declared when its owner is defined and resolved once every entity it
//! targets exists. Only then does the owner load its data.

use crate::backend::Backend;
use crate::config::{DatabaseOptions, Defaults};
use crate::database::schema::Schema;
use crate::error::Result;
use crate::events::{when_all, Signal};
use crate::{Database, EntityName, Error, Network};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

struct RegistryInner {
    backend: Arc<dyn Backend>,
    defaults: Defaults,
    network: Network,
    entities: DashMap<EntityName, Database>,
    /// Resolved with the database once an entity is defined.
    defined: DashMap<EntityName, Arc<Signal<Database>>>,
    /// Resolution failures not yet reported by a `define` call.
    failures: Mutex<Vec<(EntityName, Error)>>,
}

/// Owner of all entity databases.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.names())
            .field("defaults", &self.inner.defaults)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    backend: Arc<dyn Backend>,
    defaults: Defaults,
    network: Option<Network>,
}

impl RegistryBuilder {
    pub fn defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Share a connectivity handle; by default the registry starts online.
    pub fn network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                backend: self.backend,
                defaults: self.defaults,
                network: self.network.unwrap_or_else(|| Network::new(true)),
                entities: DashMap::new(),
                defined: DashMap::new(),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::builder(backend).build()
    }

    pub fn builder(backend: Arc<dyn Backend>) -> RegistryBuilder {
        RegistryBuilder {
            backend,
            defaults: Defaults::default(),
            network: None,
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.inner.defaults
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    pub fn get(&self, name: &str) -> Option<Database> {
        self.inner.entities.get(name).map(|entry| entry.value().clone())
    }

    /// Defined entity names, sorted.
    pub fn names(&self) -> Vec<EntityName> {
        let mut names: Vec<EntityName> = self
            .inner
            .entities
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Define an entity type.
    ///
    /// Fails on invalid options, and on relations that turn out to be invalid
    /// once this definition lets them resolve, in which case the entity
    /// owning the broken relation is withdrawn again.
    pub fn define(&self, options: DatabaseOptions) -> Result<Database> {
        let name = options.name.trim().to_string();
        if self.inner.entities.contains_key(&name) {
            return Err(Error::DuplicateEntity(name));
        }

        let schema = Schema::build(options, &self.inner.defaults, &|entity| self.get(entity))?;
        let db = Database::new(schema, self.inner.backend.as_ref(), self.inner.network.clone());
        let targets: BTreeSet<EntityName> = db
            .relations()
            .values()
            .flat_map(|relation| relation.targets())
            .collect();
        tracing::debug!(
            entity = %name,
            relations = db.relations().len(),
            waiting_on = ?targets,
            "entity declared"
        );

        self.inner.entities.insert(name.clone(), db.clone());
        self.signal(&name).resolve(db.clone());

        let signals = targets.iter().map(|target| self.signal(target)).collect();
        let registry = Arc::downgrade(&self.inner);
        let owner = db.clone();
        when_all(signals, move |databases: Vec<Database>| {
            if let Some(inner) = registry.upgrade() {
                Registry::resolve(&inner, &owner, databases);
            }
        });

        let failures = std::mem::take(&mut *self.inner.failures.lock());
        let mut first = None;
        for (entity, error) in failures {
            tracing::warn!(entity = %entity, error = %error, "relation resolution failed");
            self.unregister(&entity);
            first.get_or_insert(error);
        }
        match first {
            Some(error) => Err(error),
            None => Ok(db),
        }
    }

    /// Whether every relation of `name` has been resolved.
    pub fn is_resolved(&self, name: &str) -> bool {
        self.get(name).is_some_and(|db| {
            db.relations()
                .values()
                .flat_map(|relation| relation.targets())
                .all(|target| self.inner.entities.contains_key(&target))
        })
    }

    fn signal(&self, name: &str) -> Arc<Signal<Database>> {
        self.inner
            .defined
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Signal::new()))
            .value()
            .clone()
    }

    fn unregister(&self, name: &str) {
        self.inner.entities.remove(name);
        self.inner
            .defined
            .insert(name.to_string(), Arc::new(Signal::new()));
    }

    /// Every target of `db` is defined: resolve its relations and load it.
    fn resolve(inner: &Arc<RegistryInner>, db: &Database, databases: Vec<Database>) {
        let targets: HashMap<EntityName, Database> = databases
            .into_iter()
            .map(|target| (target.name().to_string(), target))
            .collect();

        for relation in db.relations().values() {
            if let Err(error) = relation.resolve(&targets) {
                inner.failures.lock().push((db.name().to_string(), error));
                return;
            }
            tracing::debug!(
                entity = %db.name(),
                relation = %relation.name(),
                kind = ?relation.kind(),
                "relation resolved"
            );
        }
        db.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HasManyOptions, SingleOptions};
    use crate::memory::MemoryBackend;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn duplicate_entity_rejected() {
        let registry = registry();
        registry
            .define(DatabaseOptions::new("task").fields(["id", "name"]))
            .unwrap();
        let err = registry
            .define(DatabaseOptions::new("task").fields(["id"]))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateEntity("task".into()));
        assert_eq!(registry.names(), vec!["task".to_string()]);
    }

    #[test]
    fn relations_wait_for_their_targets() {
        let registry = registry();
        let task = registry
            .define(
                DatabaseOptions::new("task")
                    .fields(["id", "name", "list_id"])
                    .belongs_to("list", SingleOptions::to("list")),
            )
            .unwrap();
        assert!(!registry.is_resolved("task"));
        assert!(!task.is_ready());

        registry
            .define(
                DatabaseOptions::new("list")
                    .fields(["id", "name"])
                    .has_many("tasks", HasManyOptions {
                        foreign: Some("list_id".into()),
                        ..HasManyOptions::to("task")
                    }),
            )
            .unwrap();
        assert!(registry.is_resolved("task"));
        assert!(registry.is_resolved("list"));
        assert!(task.is_ready());
    }

    #[test]
    fn invalid_relation_withdraws_its_owner() {
        let registry = registry();
        registry
            .define(
                DatabaseOptions::new("list")
                    .fields(["id"])
                    .has_many("tasks", HasManyOptions {
                        foreign: Some("missing_id".into()),
                        ..HasManyOptions::to("task")
                    }),
            )
            .unwrap();

        let err = registry
            .define(DatabaseOptions::new("task").fields(["id", "name"]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRelation { ref entity, .. } if entity == "list"));
        assert!(registry.get("list").is_none());
        assert!(registry.get("task").is_some());
    }
}
