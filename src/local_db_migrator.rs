//! Destructive schema migration.
//!
//! No record-level migration is attempted. A collection whose registered
//! `revision` is newer than the stored database version is dropped and
//! recreated empty with its registered key and indexes; collections that are
//! already current are left alone, and physical collections that are no longer
//! registered are dropped.

use log::{debug, info};

use crate::local_db_host::UpgradeTransaction;
use crate::local_db_schema::DatabaseDescriptor;
use crate::store_error::{Result, StoreError};

/// What a migration did, per collection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub created: Vec<String>,
    pub rebuilt: Vec<String>,
    pub dropped: Vec<String>,
    pub kept: Vec<String>,
}

pub struct SchemaMigrator;

impl SchemaMigrator {
    /// Brings the collections staged in `tx` to the shape of `target`.
    ///
    /// Only callable from inside an upgrade; `tx` must be the upgrade of
    /// `target.name` to `target.version`.
    pub fn migrate(tx: &mut UpgradeTransaction, target: &DatabaseDescriptor) -> Result<MigrationReport> {
        if tx.database() != target.name {
            return Err(StoreError::schema(format!(
                "upgrade of '{}' cannot apply the schema of '{}'",
                tx.database(),
                target.name
            )));
        }
        if tx.new_version() != target.version {
            return Err(StoreError::schema(format!(
                "upgrade of '{}' targets version {}, registered version is {}",
                target.name,
                tx.new_version(),
                target.version
            )));
        }

        let old_version = tx.old_version();
        let mut report = MigrationReport::default();

        for name in tx.collection_names() {
            if target.find_collection(&name).is_none() {
                tx.drop_collection(&name)?;
                debug!("Dropped unregistered collection '{name}' from '{}'", target.name);
                report.dropped.push(name);
            }
        }

        for collection in &target.collections {
            let exists = tx.has_collection(&collection.name);
            if exists && old_version >= collection.revision {
                report.kept.push(collection.name.clone());
                continue;
            }

            if exists {
                tx.drop_collection(&collection.name)?;
            }
            tx.create_collection(&collection.name, collection.primary_key.as_deref())?;
            for index in &collection.indexes {
                tx.create_index(&collection.name, index.clone())?;
            }

            if exists {
                report.rebuilt.push(collection.name.clone());
            } else {
                report.created.push(collection.name.clone());
            }
        }

        info!(
            "Migrated '{}' v{old_version} -> v{}: created {:?}, rebuilt {:?}, dropped {:?}",
            target.name, target.version, report.created, report.rebuilt, report.dropped
        );
        Ok(report)
    }
}
