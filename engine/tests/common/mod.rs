//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rebound_engine::memory::{MemoryBackend, MemoryServer};
use rebound_engine::{Database, DatabaseOptions, Model, Record, Registry};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route engine logs through the test writer. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unwrap a `json!` object into a record.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// One client: a memory backend and the registry wired to it.
pub struct Client {
    pub backend: Arc<MemoryBackend>,
    pub registry: Registry,
}

impl Client {
    pub fn new() -> Self {
        Self::with_server(MemoryServer::new_shared())
    }

    pub fn with_server(server: Arc<MemoryServer>) -> Self {
        init_tracing();
        let backend = Arc::new(MemoryBackend::with_server(server));
        let registry = Registry::new(backend.clone());
        Self { backend, registry }
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        self.backend.server()
    }

    pub fn define(&self, options: DatabaseOptions) -> Database {
        self.registry.define(options).unwrap()
    }

    pub fn tasks(&self) -> Database {
        self.define(task_options())
    }
}

pub fn task_options() -> DatabaseOptions {
    DatabaseOptions::new("task").fields(["id", "name", "done"])
}

/// Create and save a model from a `json!` object.
pub fn create(db: &Database, value: Value) -> Model {
    db.create(record(value))
}
