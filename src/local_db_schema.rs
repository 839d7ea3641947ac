//! Schema registry: the static table of named databases, their versions,
//! collections and secondary indexes.
//!
//! Every collection carries a `revision`, the database version at which its
//! structure last changed. The migrator rebuilds a collection only when the
//! stored database version is older than that revision.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::store_error::{Result, StoreError};

pub const MAIN_DB: &str = "quill_main";
pub const SETTINGS_DB: &str = "quill_settings";
pub const NAVIGATION_DB: &str = "quill_navigation";
pub const CREATIVE_MAP_DB: &str = "quill_creative_map";

pub const TODOS: &str = "todos";
pub const WORKS: &str = "works";
pub const PROMPTS: &str = "prompts";
pub const ARCHIVES: &str = "archives";
pub const SETTINGS: &str = "settings";
pub const NAVIGATION: &str = "navigation";
pub const CREATIVE_MAP_ITEMS: &str = "creativeMapItems";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub field: String,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    /// Field holding the primary key, or `None` for out-of-line keys.
    pub primary_key: Option<String>,
    pub indexes: Vec<IndexDescriptor>,
    pub revision: u32,
}

impl CollectionDescriptor {
    /// A collection whose records carry their key in `field`.
    pub fn keyed(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: Some(field.into()),
            indexes: Vec::new(),
            revision: 1,
        }
    }

    /// A collection whose keys are supplied by the caller on every write.
    pub fn out_of_line(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            indexes: Vec::new(),
            revision: 1,
        }
    }

    /// Adds an index named after the field it covers.
    pub fn index(self, field: &str) -> Self {
        self.named_index(field, field)
    }

    pub fn named_index(mut self, name: &str, field: &str) -> Self {
        self.indexes.push(IndexDescriptor::new(name, field));
        self
    }

    pub fn revised_at(mut self, version: u32) -> Self {
        self.revision = version;
        self
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub name: String,
    pub version: u32,
    pub collections: Vec<CollectionDescriptor>,
}

impl DatabaseDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            collections: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: CollectionDescriptor) -> Self {
        self.collections.push(collection);
        self
    }

    pub fn find_collection(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::schema("database name cannot be empty"));
        }
        if self.version < 1 {
            return Err(StoreError::schema(format!(
                "database '{}' must have a version of at least 1",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for collection in &self.collections {
            if collection.name.is_empty() {
                return Err(StoreError::schema(format!(
                    "database '{}' has a collection with an empty name",
                    self.name
                )));
            }
            if !seen.insert(collection.name.as_str()) {
                return Err(StoreError::schema(format!(
                    "collection '{}' is declared twice in database '{}'",
                    collection.name, self.name
                )));
            }
            if collection.revision < 1 || collection.revision > self.version {
                return Err(StoreError::schema(format!(
                    "collection '{}' revision {} is outside 1..={} of database '{}'",
                    collection.name, collection.revision, self.version, self.name
                )));
            }
            if matches!(collection.primary_key.as_deref(), Some("")) {
                return Err(StoreError::schema(format!(
                    "collection '{}' has an empty primary key field",
                    collection.name
                )));
            }

            let mut index_names = BTreeSet::new();
            for index in &collection.indexes {
                if index.name.is_empty() || index.field.is_empty() {
                    return Err(StoreError::schema(format!(
                        "collection '{}' has an index with an empty name or field",
                        collection.name
                    )));
                }
                if !index_names.insert(index.name.as_str()) {
                    return Err(StoreError::schema(format!(
                        "index '{}' is declared twice on collection '{}'",
                        index.name, collection.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lookup table of every named database. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    databases: BTreeMap<String, DatabaseDescriptor>,
}

impl SchemaRegistry {
    pub fn new(databases: Vec<DatabaseDescriptor>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for descriptor in databases {
            descriptor.validate()?;
            let name = descriptor.name.clone();
            if table.insert(name.clone(), descriptor).is_some() {
                return Err(StoreError::schema(format!(
                    "database '{name}' is registered twice"
                )));
            }
        }
        Ok(Self { databases: table })
    }

    /// The schema the Quill application ships with.
    pub fn application() -> Self {
        let databases = application_databases()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { databases }
    }

    pub fn describe(&self, name: &str) -> Result<&DatabaseDescriptor> {
        self.databases
            .get(name)
            .ok_or_else(|| StoreError::UnknownDatabase(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

fn application_databases() -> Vec<DatabaseDescriptor> {
    vec![
        DatabaseDescriptor::new(MAIN_DB, 3)
            .collection(CollectionDescriptor::keyed(TODOS, "id").index("createdAt"))
            .collection(
                CollectionDescriptor::keyed(WORKS, "id")
                    .index("updatedAt")
                    .index("type")
                    .revised_at(2),
            )
            .collection(
                CollectionDescriptor::keyed(PROMPTS, "id")
                    .index("updatedAt")
                    .index("type")
                    .revised_at(2),
            )
            .collection(
                CollectionDescriptor::keyed(ARCHIVES, "id")
                    .index("updatedAt")
                    .index("category")
                    .index("workId")
                    .revised_at(3),
            ),
        DatabaseDescriptor::new(SETTINGS_DB, 1)
            .collection(CollectionDescriptor::out_of_line(SETTINGS)),
        DatabaseDescriptor::new(NAVIGATION_DB, 1)
            .collection(CollectionDescriptor::out_of_line(NAVIGATION)),
        DatabaseDescriptor::new(CREATIVE_MAP_DB, 1)
            .collection(CollectionDescriptor::keyed(CREATIVE_MAP_ITEMS, "id")),
    ]
}
