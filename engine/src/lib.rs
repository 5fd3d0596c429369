//! # Rebound Engine
//!
//! An offline-first model layer for applications that keep a local copy of
//! remote data.
//!
//! Models are saved and removed through a per-model operation queue that
//! writes the local store first and the remote service second, survives
//! restarts, and suspends while the network is unreachable. Remote data is
//! merged field by field, so edits made offline are never clobbered by a
//! refresh.
//!
//! ## Design Principles
//!
//! - **No IO**: storage, transport and the live channel are collaborator traits
//! - **Local first**: every change is durable locally before it is sent
//! - **Non-destructive merges**: divergent local values win until saved
//! - **Explicit wiring**: a [`Registry`] owns every entity; nothing is global
//!
//! ## Core Concepts
//!
//! ### Entities and Models
//!
//! An entity type is declared with [`DatabaseOptions`] and defined on a
//! [`Registry`], which returns its [`Database`]. A [`Model`] is one record of
//! that type with its own [`Status`] and saved snapshot.
//!
//! ### Operations
//!
//! [`Model::save`] and [`Model::remove`] enqueue operations
//! ([`OperationKind`]). Only one runs per model at a time; removal interrupts
//! pending saves.
//!
//! ### Reconciliation
//!
//! [`Database::put_remote_data`] merges an incoming record. Fields changed
//! locally since the last save are reported as conflicts and left alone; an
//! optional revision field rejects stale data outright.
//!
//! ### Relations
//!
//! `belongsTo`, `hasOne`, `hasMany` and `hasManyThrough`, optionally
//! polymorphic, keep foreign keys in step and cascade saves and removals.
//!
//! ## Quick Start
//!
//! ```rust
//! use rebound_engine::memory::MemoryBackend;
//! use rebound_engine::{DatabaseOptions, Registry, Status};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Wire a registry to its collaborators
//! let backend = Arc::new(MemoryBackend::new());
//! let registry = Registry::new(backend.clone());
//!
//! // 2. Define an entity
//! let tasks = registry
//!     .define(DatabaseOptions::new("task").fields(["id", "name", "done"]))
//!     .unwrap();
//!
//! // 3. Create a model; it is stored locally and sent remotely
//! let mut fields = rebound_engine::Record::new();
//! fields.insert("name".into(), json!("write docs"));
//! let task = tasks.create(fields);
//!
//! assert_eq!(task.status(), Status::Synced);
//! assert!(backend.server().record("task", &task.key()).is_some());
//! assert_eq!(tasks.all().len(), 1);
//! ```
//!
//! ## Collaborators
//!
//! The [`memory`] module provides in-memory implementations of [`Store`],
//! [`Rest`] and [`Live`], used by the tests and suitable for prototyping.

pub mod backend;
pub mod codec;
pub mod collection;
pub mod compare;
pub mod config;
mod database;
pub mod error;
pub mod events;
pub mod memory;
mod model;
pub mod network;
mod operation;
pub mod record;
mod registry;
mod relation;

// Re-export main types at crate root
pub use backend::{Backend, Live, LiveMessage, LiveOp, Rest, RestFailure, Store, NETWORK_UNREACHABLE};
pub use codec::{DateCodec, FieldCodec, FnCodec};
pub use collection::{FilteredCollection, KeyedMap, ModelCollection, RemoteQuery};
pub use compare::{compare_values, Comparator};
pub use config::{
    CacheMode, DatabaseOptions, DefaultValue, Defaults, FieldSpec, HasManyOptions, LoadMode,
    RelationOptions, SingleOptions, StoreMode, ThroughOptions,
};
pub use database::{Database, DatabaseEvent};
pub use error::{Error, Result, StoreError};
pub use model::{Model, ModelEvent, WeakModel};
pub use network::{Network, NetworkEvent};
pub use operation::OperationKind;
pub use record::{is_empty_value, is_marker, key_component, Cascade, LocalRecord, Record, Status};
pub use registry::{Registry, RegistryBuilder};
pub use relation::{Related, RelationKind, RelationValue};

/// Type aliases for clarity
pub type Key = String;
pub type EntityName = String;
