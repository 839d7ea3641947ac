use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::local_db_connection::ConnectionManager;
use crate::local_db_repository::RecordRepository;
use crate::local_db_schema::{SETTINGS, SETTINGS_DB};
use crate::store_error::{Result, StoreError};

/// String-keyed settings on top of an out-of-line collection.
///
/// Reads never fail: a missing key, an unreadable store or a value of the
/// wrong shape all yield the caller's default.
#[derive(Clone)]
pub struct SettingsStore {
    repository: RecordRepository,
    collection: String,
}

impl SettingsStore {
    pub fn new(connections: ConnectionManager) -> Self {
        Self::at(connections, SETTINGS_DB, SETTINGS)
    }

    pub fn at(connections: ConnectionManager, database: &str, collection: &str) -> Self {
        Self {
            repository: RecordRepository::new(connections, database),
            collection: collection.to_string(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.repository.get_by_id(&self.collection, key) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Setting '{key}' has an unexpected shape, using default: {e}");
                    default
                }
            },
            Ok(None) => default,
            Err(StoreError::ServerSideUnavailable) => {
                debug!("Setting '{key}' read outside a storage context, using default");
                default
            }
            Err(e) => {
                warn!("Failed to read setting '{key}', using default: {e}");
                default
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.repository.put_with_key(&self.collection, key, &value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.repository.remove(&self.collection, key)
    }
}
