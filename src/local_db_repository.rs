//! Generic, collection-agnostic record operations.
//!
//! Every operation acquires the database through the
//! [`ConnectionManager`](crate::local_db_connection::ConnectionManager) and runs
//! in exactly one LMDB transaction over exactly one collection, so it either
//! applies completely or not at all.

use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::local_db_connection::ConnectionManager;
use crate::local_db_host::{Connection, StoredCollection};
use crate::local_db_model::{IdGenerator, RecordKey, TimestampIdGenerator};
use crate::store_error::{Result, StoreError};

/// CRUD over the collections of one named database.
#[derive(Clone)]
pub struct RecordRepository {
    connections: ConnectionManager,
    database: String,
    ids: Arc<dyn IdGenerator>,
}

impl RecordRepository {
    pub fn new(connections: ConnectionManager, database: impl Into<String>) -> Self {
        Self {
            connections,
            database: database.into(),
            ids: Arc::new(TimestampIdGenerator),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connections.acquire(&self.database)
    }

    /// Inserts `record`, synthesizing its primary key when absent.
    ///
    /// Returns the record as stored, key included. Fails with
    /// [`StoreError::DuplicateKey`] when the key is already used.
    pub fn add(&self, collection: &str, record: JsonValue) -> Result<JsonValue> {
        let conn = self.connection()?;
        conn.write(collection, |scope| {
            let field = key_field(scope.schema())?;
            let mut record = record;
            let object = record.as_object_mut().ok_or_else(|| {
                StoreError::schema(format!(
                    "records in collection '{collection}' must be JSON objects"
                ))
            })?;

            let key = match object.get(field) {
                None | Some(JsonValue::Null) => {
                    let id = self.ids.next_id();
                    object.insert(field.to_string(), JsonValue::from(id));
                    RecordKey::Int(id)
                }
                Some(value) => parse_key(collection, value)?,
            };

            scope.insert(&key, &record)?;
            debug!("Added {key} to '{collection}'");
            Ok(record)
        })
    }

    /// Inserts `value` under a caller-supplied key, for collections without a
    /// primary key field.
    pub fn add_with_key(&self, collection: &str, key: impl Into<RecordKey>, value: &JsonValue) -> Result<()> {
        let key = key.into();
        let conn = self.connection()?;
        conn.write(collection, |scope| {
            ensure_out_of_line(scope.schema())?;
            scope.insert(&key, value)
        })
    }

    pub fn get_by_id(&self, collection: &str, key: impl Into<RecordKey>) -> Result<Option<JsonValue>> {
        let key = key.into();
        let conn = self.connection()?;
        conn.read(collection, |scope| scope.get(&key))
    }

    /// Every record of `collection`, in storage order.
    pub fn get_all(&self, collection: &str) -> Result<Vec<JsonValue>> {
        let conn = self.connection()?;
        conn.read(collection, |scope| scope.all())
    }

    /// Records whose indexed field equals `value`. Empty when nothing matches.
    pub fn query_by_index(&self, collection: &str, index: &str, value: &JsonValue) -> Result<Vec<JsonValue>> {
        let conn = self.connection()?;
        conn.read(collection, |scope| scope.by_index(index, value))
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.connection()?;
        conn.read(collection, |scope| scope.count())
    }

    /// Overwrites (or creates) the record under its primary key.
    ///
    /// Fails with [`StoreError::MissingKey`] when the record has no key.
    pub fn update(&self, collection: &str, record: &JsonValue) -> Result<()> {
        let conn = self.connection()?;
        conn.write(collection, |scope| {
            let field = key_field(scope.schema())?;
            let key = match record.get(field) {
                None | Some(JsonValue::Null) => {
                    return Err(StoreError::MissingKey {
                        collection: collection.to_string(),
                        field: field.to_string(),
                    })
                }
                Some(value) => parse_key(collection, value)?,
            };
            scope.put(&key, record)
        })
    }

    /// Overwrites (or creates) the value under a caller-supplied key.
    pub fn put_with_key(&self, collection: &str, key: impl Into<RecordKey>, value: &JsonValue) -> Result<()> {
        let key = key.into();
        let conn = self.connection()?;
        conn.write(collection, |scope| {
            ensure_out_of_line(scope.schema())?;
            scope.put(&key, value)
        })
    }

    /// Deletes the record under `key`. Deleting a missing key succeeds.
    pub fn remove(&self, collection: &str, key: impl Into<RecordKey>) -> Result<()> {
        let key = key.into();
        let conn = self.connection()?;
        let removed = conn.write(collection, |scope| scope.delete(&key))?;
        if !removed {
            debug!("Remove of {key} from '{collection}' found nothing");
        }
        Ok(())
    }

    /// Deletes every record of `collection`.
    pub fn clear(&self, collection: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.write(collection, |scope| scope.clear())?;
        debug!("Cleared '{collection}' in '{}'", self.database);
        Ok(())
    }

    pub fn add_typed<T: Serialize + DeserializeOwned>(&self, collection: &str, record: &T) -> Result<T> {
        let stored = self.add(collection, serde_json::to_value(record)?)?;
        Ok(serde_json::from_value(stored)?)
    }

    pub fn update_typed<T: Serialize>(&self, collection: &str, record: &T) -> Result<()> {
        self.update(collection, &serde_json::to_value(record)?)
    }

    pub fn get_typed<T: DeserializeOwned>(&self, collection: &str, key: impl Into<RecordKey>) -> Result<Option<T>> {
        match self.get_by_id(collection, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

fn key_field(schema: &StoredCollection) -> Result<&str> {
    schema.primary_key.as_deref().ok_or_else(|| {
        StoreError::schema(format!(
            "collection '{}' has no primary key field; supply keys explicitly",
            schema.name
        ))
    })
}

fn ensure_out_of_line(schema: &StoredCollection) -> Result<()> {
    match &schema.primary_key {
        None => Ok(()),
        Some(field) => Err(StoreError::schema(format!(
            "collection '{}' keys records by their '{field}' field",
            schema.name
        ))),
    }
}

fn parse_key(collection: &str, value: &JsonValue) -> Result<RecordKey> {
    RecordKey::from_json(value).ok_or_else(|| {
        StoreError::schema(format!(
            "key {value} in collection '{collection}' is not an integer or string"
        ))
    })
}
