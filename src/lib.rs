//! # Quill Store
//!
//! The embedded storage layer of the Quill writing application: several
//! independently versioned named databases, each holding record collections
//! with secondary indexes, stored in LMDB.
//!
//! ## Features
//!
//! - **Versioned databases**: every named database carries its own schema
//!   version; opening at a newer version runs a destructive migration
//! - **Multi-context safe**: several execution contexts share one
//!   [`StorageHost`]; upgrades ask older connections to close, and a context
//!   that refuses surfaces [`StoreError::BlockedByOtherContext`]
//! - **One transaction per operation**: every repository call is atomic over
//!   one collection, secondary indexes included
//! - **Safe error handling**: no `unwrap()` calls in production code
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_store::{ConnectionManager, RecordRepository, SchemaRegistry, StorageConfig, StorageHost};
//! use serde_json::json;
//!
//! let host = StorageHost::new(StorageConfig::new("./quill_data"));
//! let connections = ConnectionManager::new(Arc::new(SchemaRegistry::application()), host);
//! let main = RecordRepository::new(connections, "quill_main");
//!
//! let todo = main.add("todos", json!({"title": "Outline chapter 3", "completed": false, "createdAt": 1}))?;
//! let again = main.get_by_id("todos", todo["id"].as_i64().unwrap_or_default())?;
//! assert_eq!(Some(todo), again);
//! # Ok::<(), quill_store::StoreError>(())
//! ```
//!
//! ## Layers
//!
//! - [`SchemaRegistry`] - static table of databases, collections and indexes
//! - [`SchemaMigrator`] - rebuilds collections inside an upgrade
//! - [`ConnectionManager`] - opens each database once per context and tracks
//!   its lifecycle
//! - [`RecordRepository`] - `add`, `get_by_id`, `get_all`, `query_by_index`,
//!   `update`, `remove`, `clear`
//! - [`SettingsStore`] - string-keyed settings that never fail to read
//! - [`ResetManager`] - deletes every database
//! - [`QuillStore`] - typed wrappers for the application's collections

pub mod app_stores;
pub mod local_db_config;
pub mod local_db_connection;
pub mod local_db_host;
pub mod local_db_migrator;
pub mod local_db_model;
pub mod local_db_repository;
pub mod local_db_reset;
pub mod local_db_schema;
pub mod local_db_settings;
pub mod store_error;

pub use app_stores::QuillStore;
pub use local_db_config::StorageConfig;
pub use local_db_connection::{ConnectionManager, ConnectionState};
pub use local_db_host::{Connection, ConnectionListener, StorageHost, UpgradeTransaction};
pub use local_db_migrator::{MigrationReport, SchemaMigrator};
pub use local_db_model::{IdGenerator, RecordKey, TimestampIdGenerator};
pub use local_db_repository::RecordRepository;
pub use local_db_reset::ResetManager;
pub use local_db_schema::{CollectionDescriptor, DatabaseDescriptor, IndexDescriptor, SchemaRegistry};
pub use local_db_settings::SettingsStore;
pub use store_error::{Result, StoreError};
