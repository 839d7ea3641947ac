//! LMDB-backed storage host shared by every execution context of one origin.
//!
//! Each named database lives in its own LMDB environment at
//! `<root>/<name>.lmdb`. Inside an environment:
//!
//! - `__meta` holds the stored `version` and the `catalog` of collections,
//! - `store:<collection>` maps the JSON-encoded primary key to the JSON record,
//! - `index:<collection>:<index>` is a sorted-duplicates table mapping a
//!   JSON-encoded field value to the JSON-encoded primary key of every record
//!   carrying that value. Integral floats are stored as integers, and a value
//!   whose encoding does not fit in an LMDB key is stored under its SHA-256
//!   digest; lookups re-check the field on every record they return.
//!
//! The host hands out [`Connection`]s. Opening a database at a version above the
//! stored one first asks every other open connection to that database to close
//! (the version-change signal); only when all of them have let go does the
//! upgrade hook run, inside an [`UpgradeTransaction`]. The hook's structural
//! changes, the wiped collections and the new version are committed in a single
//! LMDB write transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::local_db_config::StorageConfig;
use crate::local_db_model::{RecordKey, MAX_KEY_BYTES};
use crate::local_db_schema::IndexDescriptor;
use crate::store_error::{Result, StoreError};

const META_DB: &str = "__meta";
const META_VERSION: &str = "version";
const META_CATALOG: &str = "catalog";

/// Physical shape of a collection, as recorded in the database catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCollection {
    pub name: String,
    pub primary_key: Option<String>,
    pub indexes: Vec<IndexDescriptor>,
}

/// Lifecycle signals delivered to the owner of a connection.
///
/// Both callbacks run on the thread of the context that caused them, never
/// while the host holds its internal locks.
pub trait ConnectionListener: Send + Sync {
    /// Another context wants to upgrade (`Some(version)`) or delete (`None`)
    /// the database this connection is holding open.
    fn on_version_change(&self, _connection: &Arc<Connection>, _new_version: Option<u32>) {}

    /// The connection died outside a normal close. It is already unusable.
    fn on_terminated(&self, _connection: &Arc<Connection>) {}
}

/// Listener that ignores every signal: a connection owned by it never yields
/// to an upgrade.
pub struct IgnoreSignals;

impl ConnectionListener for IgnoreSignals {}

/// One LMDB environment plus the sub-database handles opened in it so far.
struct DatabaseFiles {
    env: Environment,
    handles: Mutex<HashMap<String, Database>>,
}

impl DatabaseFiles {
    fn open(config: &StorageConfig, name: &str) -> Result<Self> {
        let dir = config.database_dir(name);
        std::fs::create_dir_all(&dir)?;

        let env = Environment::new()
            .set_max_dbs(config.max_dbs)
            .set_map_size(config.map_size)
            .open(&dir)?;
        debug!("Opened LMDB environment at {}", dir.display());

        Ok(Self {
            env,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the handle of a named sub-database, creating it if needed.
    ///
    /// Must not be called while this thread holds a write transaction on the
    /// same environment.
    fn handle(&self, sub_name: &str, flags: DatabaseFlags) -> Result<Database> {
        let mut handles = self.handles.lock();
        if let Some(db) = handles.get(sub_name) {
            return Ok(*db);
        }
        let db = self.env.create_db(Some(sub_name), flags)?;
        handles.insert(sub_name.to_string(), db);
        Ok(db)
    }

    fn read_meta(&self) -> Result<(u32, Vec<StoredCollection>)> {
        let meta = self.meta_handle()?;
        let txn = self.env.begin_ro_txn()?;

        let version = match txn.get(meta, &META_VERSION) {
            Ok(bytes) => serde_json::from_slice(bytes)?,
            Err(lmdb::Error::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };
        let catalog = match txn.get(meta, &META_CATALOG) {
            Ok(bytes) => serde_json::from_slice(bytes)?,
            Err(lmdb::Error::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        txn.abort();

        Ok((version, catalog))
    }

    fn meta_handle(&self) -> Result<Database> {
        self.handle(META_DB, DatabaseFlags::empty())
    }

    fn records_handle(&self, collection: &str) -> Result<Database> {
        self.handle(&format!("store:{collection}"), DatabaseFlags::empty())
    }

    fn index_handle(&self, collection: &str, index: &str) -> Result<Database> {
        self.handle(&format!("index:{collection}:{index}"), DatabaseFlags::DUP_SORT)
    }
}

struct OpenConnection {
    name: String,
    connection: Weak<Connection>,
    listener: Arc<dyn ConnectionListener>,
}

#[derive(Default)]
struct HostState {
    files: HashMap<String, Arc<DatabaseFiles>>,
    connections: HashMap<u64, OpenConnection>,
    next_id: u64,
}

impl HostState {
    fn live_connections(&mut self, name: &str) -> Vec<(Arc<Connection>, Arc<dyn ConnectionListener>)> {
        self.connections
            .retain(|_, open| open.connection.strong_count() > 0);
        self.connections
            .values()
            .filter(|open| open.name == name)
            .filter_map(|open| {
                open.connection
                    .upgrade()
                    .map(|conn| (conn, Arc::clone(&open.listener)))
            })
            .collect()
    }
}

/// The storage engine of one origin. Shared (via `Arc`) by every
/// [`ConnectionManager`](crate::local_db_connection::ConnectionManager) that
/// represents an execution context of that origin.
pub struct StorageHost {
    config: StorageConfig,
    state: Mutex<HostState>,
    /// Serializes open, upgrade and delete requests.
    open_lock: Mutex<()>,
    open_requests: AtomicU64,
}

impl StorageHost {
    pub fn new(config: StorageConfig) -> Arc<Self> {
        info!("Storage host rooted at {}", config.root().display());
        Arc::new(Self {
            config,
            state: Mutex::new(HostState::default()),
            open_lock: Mutex::new(()),
            open_requests: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Number of `open` requests received since the host was created.
    pub fn open_requests(&self) -> u64 {
        self.open_requests.load(Ordering::SeqCst)
    }

    pub fn open_connection_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .live_connections(name)
            .iter()
            .filter(|(conn, _)| !conn.is_closed())
            .count()
    }

    /// Version currently stored on disk for `name` (0 if never opened).
    pub fn stored_version(&self, name: &str) -> Result<u32> {
        let _serial = self.open_lock.lock();
        if !self.config.database_dir(name).exists() {
            return Ok(0);
        }
        let files = self.files_for(name)?;
        Ok(files.read_meta()?.0)
    }

    /// Opens `name` at `version`.
    ///
    /// When the stored version is lower, every other open connection to `name`
    /// receives a version-change signal; if any of them stays open the request
    /// fails with [`StoreError::BlockedByOtherContext`]. Otherwise `upgrade` runs
    /// and its result is committed atomically with the new version. A stored
    /// version above `version` fails with [`StoreError::VersionRegression`].
    pub fn open(
        self: &Arc<Self>,
        name: &str,
        version: u32,
        listener: Arc<dyn ConnectionListener>,
        upgrade: &mut dyn FnMut(&mut UpgradeTransaction) -> Result<()>,
    ) -> Result<Arc<Connection>> {
        self.open_requests.fetch_add(1, Ordering::SeqCst);
        if version == 0 {
            return Err(StoreError::schema(format!(
                "database '{name}' cannot be opened at version 0"
            )));
        }

        let _serial = self.open_lock.lock();
        let files = self.files_for(name)?;
        let (stored, catalog) = files.read_meta()?;

        if stored > version {
            return Err(StoreError::VersionRegression {
                name: name.to_string(),
                stored,
                requested: version,
            });
        }

        let catalog = if stored < version {
            self.request_exclusive(name, Some(version))?;
            info!("Upgrading database '{name}' from version {stored} to {version}");
            apply_upgrade(&files, name, stored, version, catalog, upgrade)?
        } else {
            catalog
        };

        let mut collections = HashMap::new();
        for schema in catalog {
            let records = files.records_handle(&schema.name)?;
            let mut indexes = Vec::with_capacity(schema.indexes.len());
            for index in &schema.indexes {
                indexes.push((
                    index.clone(),
                    files.index_handle(&schema.name, &index.name)?,
                ));
            }
            collections.insert(
                schema.name.clone(),
                CollectionHandles {
                    schema,
                    records,
                    indexes,
                },
            );
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let connection = Arc::new(Connection {
            id,
            name: name.to_string(),
            version,
            files,
            collections,
            host: Arc::downgrade(self),
            closed: AtomicBool::new(false),
        });
        state.connections.insert(
            id,
            OpenConnection {
                name: name.to_string(),
                connection: Arc::downgrade(&connection),
                listener,
            },
        );
        debug!("Connection #{id} opened to '{name}' at version {version}");

        Ok(connection)
    }

    /// Deletes `name` and everything in it.
    ///
    /// Open connections receive a version-change signal first; one that stays
    /// open makes the request fail with [`StoreError::BlockedByOtherContext`].
    pub fn delete_database(&self, name: &str) -> Result<()> {
        let _serial = self.open_lock.lock();
        self.request_exclusive(name, None)?;

        let removed = self.state.lock().files.remove(name);
        drop(removed);

        let dir = self.config.database_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            info!("Deleted database '{name}' at {}", dir.display());
        } else {
            debug!("Database '{name}' has no files to delete");
        }
        Ok(())
    }

    /// Kills every connection to `name` without a normal close, as when the
    /// platform evicts the storage. Owners are told through
    /// [`ConnectionListener::on_terminated`].
    pub fn terminate_connections(&self, name: &str) -> usize {
        let victims = {
            let mut state = self.state.lock();
            let victims = state.live_connections(name);
            for (conn, _) in &victims {
                state.connections.remove(&conn.id);
            }
            victims
        };

        for (conn, _) in &victims {
            conn.closed.store(true, Ordering::SeqCst);
        }
        for (conn, listener) in &victims {
            warn!("Connection #{} to '{}' was terminated", conn.id, conn.name);
            listener.on_terminated(conn);
        }
        victims.len()
    }

    fn files_for(&self, name: &str) -> Result<Arc<DatabaseFiles>> {
        let mut state = self.state.lock();
        if let Some(files) = state.files.get(name) {
            return Ok(Arc::clone(files));
        }
        let files = Arc::new(DatabaseFiles::open(&self.config, name)?);
        state.files.insert(name.to_string(), Arc::clone(&files));
        Ok(files)
    }

    /// Asks every open connection to `name` to close; fails if one stays open.
    fn request_exclusive(&self, name: &str, new_version: Option<u32>) -> Result<()> {
        let holders = self.state.lock().live_connections(name);
        if holders.is_empty() {
            return Ok(());
        }

        for (conn, listener) in &holders {
            if !conn.is_closed() {
                debug!(
                    "Sending version change to connection #{} on '{name}'",
                    conn.id
                );
                listener.on_version_change(conn, new_version);
            }
        }

        let still_open = holders.iter().filter(|(conn, _)| !conn.is_closed()).count();
        if still_open > 0 {
            warn!(
                "Database '{name}' is blocked by {still_open} open connection(s) in other contexts"
            );
            return Err(StoreError::BlockedByOtherContext {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn release(&self, id: u64) {
        if self.state.lock().connections.remove(&id).is_some() {
            debug!("Connection #{id} released");
        }
    }
}

fn apply_upgrade(
    files: &DatabaseFiles,
    name: &str,
    old_version: u32,
    new_version: u32,
    catalog: Vec<StoredCollection>,
    upgrade: &mut dyn FnMut(&mut UpgradeTransaction) -> Result<()>,
) -> Result<Vec<StoredCollection>> {
    let mut tx = UpgradeTransaction::new(name, old_version, new_version, catalog);
    upgrade(&mut tx)?;

    let UpgradeTransaction {
        previous,
        collections,
        touched,
        ..
    } = tx;

    let mut wiped = Vec::new();
    for collection in &touched {
        for schema in [previous.get(collection), collections.get(collection)]
            .into_iter()
            .flatten()
        {
            wiped.push(files.records_handle(&schema.name)?);
            for index in &schema.indexes {
                wiped.push(files.index_handle(&schema.name, &index.name)?);
            }
        }
    }
    let meta = files.meta_handle()?;
    let catalog: Vec<StoredCollection> = collections.into_values().collect();

    let mut txn = files.env.begin_rw_txn()?;
    for db in wiped {
        txn.clear_db(db)?;
    }
    txn.put(
        meta,
        &META_VERSION,
        &serde_json::to_vec(&new_version)?,
        WriteFlags::empty(),
    )?;
    txn.put(
        meta,
        &META_CATALOG,
        &serde_json::to_vec(&catalog)?,
        WriteFlags::empty(),
    )?;
    txn.commit()?;

    info!(
        "Database '{name}' now at version {new_version} ({} collection(s) rebuilt)",
        touched.len()
    );
    Ok(catalog)
}

/// The only place collections and indexes can be created or dropped.
///
/// Handed to the upgrade hook by [`StorageHost::open`]; changes are staged
/// here and committed together with the new version once the hook returns
/// `Ok`. A hook error discards everything.
pub struct UpgradeTransaction {
    database: String,
    old_version: u32,
    new_version: u32,
    previous: BTreeMap<String, StoredCollection>,
    collections: BTreeMap<String, StoredCollection>,
    touched: BTreeSet<String>,
}

impl UpgradeTransaction {
    fn new(database: &str, old_version: u32, new_version: u32, catalog: Vec<StoredCollection>) -> Self {
        let previous: BTreeMap<String, StoredCollection> = catalog
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        Self {
            database: database.to_string(),
            old_version,
            new_version,
            collections: previous.clone(),
            previous,
            touched: BTreeSet::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collection(&self, name: &str) -> Option<&StoredCollection> {
        self.collections.get(name)
    }

    /// Creates an empty collection. Fails if one with that name exists.
    pub fn create_collection(&mut self, name: &str, primary_key: Option<&str>) -> Result<()> {
        if self.collections.contains_key(name) {
            return Err(StoreError::schema(format!(
                "collection '{name}' already exists in database '{}'",
                self.database
            )));
        }
        self.collections.insert(
            name.to_string(),
            StoredCollection {
                name: name.to_string(),
                primary_key: primary_key.map(str::to_string),
                indexes: Vec::new(),
            },
        );
        self.touched.insert(name.to_string());
        Ok(())
    }

    /// Drops a collection and all of its records.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        if self.collections.remove(name).is_none() {
            return Err(StoreError::schema(format!(
                "collection '{name}' does not exist in database '{}'",
                self.database
            )));
        }
        self.touched.insert(name.to_string());
        Ok(())
    }

    /// Attaches an index to a collection created in this transaction.
    pub fn create_index(&mut self, collection: &str, index: IndexDescriptor) -> Result<()> {
        if !self.touched.contains(collection) {
            return Err(StoreError::schema(format!(
                "index '{}' can only be added to a collection created in this upgrade, not '{collection}'",
                index.name
            )));
        }
        let schema = self.collections.get_mut(collection).ok_or_else(|| {
            StoreError::schema(format!(
                "collection '{collection}' does not exist in database '{}'",
                self.database
            ))
        })?;
        if schema.indexes.iter().any(|i| i.name == index.name) {
            return Err(StoreError::schema(format!(
                "index '{}' already exists on collection '{collection}'",
                index.name
            )));
        }
        schema.indexes.push(index);
        Ok(())
    }
}

pub(crate) struct CollectionHandles {
    schema: StoredCollection,
    records: Database,
    indexes: Vec<(IndexDescriptor, Database)>,
}

impl CollectionHandles {
    fn index(&self, name: &str) -> Result<&(IndexDescriptor, Database)> {
        self.indexes
            .iter()
            .find(|(index, _)| index.name == name)
            .ok_or_else(|| {
                StoreError::schema(format!(
                    "index '{name}' is not defined on collection '{}'",
                    self.schema.name
                ))
            })
    }
}

/// An open handle to one named database at one version.
pub struct Connection {
    id: u64,
    name: String,
    version: u32,
    files: Arc<DatabaseFiles>,
    collections: HashMap<String, CollectionHandles>,
    host: Weak<StorageHost>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    pub fn collection_schema(&self, name: &str) -> Option<&StoredCollection> {
        self.collections.get(name).map(|c| &c.schema)
    }

    /// Closes the connection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            host.release(self.id);
        }
        debug!("Connection #{} to '{}' closed", self.id, self.name);
    }

    /// Runs `f` in a read-only transaction over one collection.
    pub fn read<T>(&self, collection: &str, f: impl FnOnce(&ReadScope<'_>) -> Result<T>) -> Result<T> {
        let handles = self.usable_collection(collection)?;
        let txn = self.files.env.begin_ro_txn()?;
        let scope = ReadScope { txn, handles };
        let out = f(&scope)?;
        scope.txn.abort();
        Ok(out)
    }

    /// Runs `f` in a write transaction over one collection. The transaction
    /// commits only if `f` returns `Ok`.
    pub fn write<T>(&self, collection: &str, f: impl FnOnce(&mut WriteScope<'_>) -> Result<T>) -> Result<T> {
        let handles = self.usable_collection(collection)?;
        let txn = self.files.env.begin_rw_txn()?;
        // An upgrade may have committed while this thread waited for the
        // writer lock; the handles then describe a rebuilt collection.
        if self.is_closed() {
            txn.abort();
            return Err(StoreError::ConnectionClosed(self.name.clone()));
        }
        let mut scope = WriteScope { txn, handles };
        let out = f(&mut scope)?;
        scope.txn.commit()?;
        Ok(out)
    }

    fn usable_collection(&self, collection: &str) -> Result<&CollectionHandles> {
        if self.is_closed() {
            return Err(StoreError::ConnectionClosed(self.name.clone()));
        }
        self.collections.get(collection).ok_or_else(|| {
            StoreError::schema(format!(
                "collection '{collection}' does not exist in database '{}'",
                self.name
            ))
        })
    }
}

/// Read access to one collection inside a read-only transaction.
pub struct ReadScope<'a> {
    txn: lmdb::RoTransaction<'a>,
    handles: &'a CollectionHandles,
}

impl ReadScope<'_> {
    pub fn schema(&self) -> &StoredCollection {
        &self.handles.schema
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<JsonValue>> {
        get_record(&self.txn, self.handles, key)
    }

    pub fn all(&self) -> Result<Vec<JsonValue>> {
        all_records(&self.txn, self.handles)
    }

    pub fn by_index(&self, index: &str, value: &JsonValue) -> Result<Vec<JsonValue>> {
        records_by_index(&self.txn, self.handles, index, value)
    }

    pub fn count(&self) -> Result<usize> {
        let mut cursor = self.txn.open_ro_cursor(self.handles.records)?;
        Ok(cursor.iter().count())
    }
}

/// Read/write access to one collection inside a write transaction.
///
/// Index entries are kept in step with every record change.
pub struct WriteScope<'a> {
    txn: RwTransaction<'a>,
    handles: &'a CollectionHandles,
}

impl WriteScope<'_> {
    pub fn schema(&self) -> &StoredCollection {
        &self.handles.schema
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<JsonValue>> {
        get_record(&self.txn, self.handles, key)
    }

    /// Stores a new record; fails with [`StoreError::DuplicateKey`] if `key`
    /// is taken.
    pub fn insert(&mut self, key: &RecordKey, record: &JsonValue) -> Result<()> {
        if self.get(key)?.is_some() {
            return Err(self.duplicate(key));
        }
        let encoded = key.encode()?;
        let bytes = serde_json::to_vec(record)?;
        match self
            .txn
            .put(self.handles.records, &encoded, &bytes, WriteFlags::NO_OVERWRITE)
        {
            Ok(()) => {}
            Err(lmdb::Error::KeyExist) => return Err(self.duplicate(key)),
            Err(e) => return Err(e.into()),
        }
        self.add_index_entries(key, record)
    }

    /// Stores `record` under `key`, replacing any previous value.
    pub fn put(&mut self, key: &RecordKey, record: &JsonValue) -> Result<()> {
        if let Some(previous) = self.get(key)? {
            self.remove_index_entries(key, &previous)?;
        }
        let encoded = key.encode()?;
        let bytes = serde_json::to_vec(record)?;
        self.txn
            .put(self.handles.records, &encoded, &bytes, WriteFlags::empty())?;
        self.add_index_entries(key, record)
    }

    /// Removes `key`. Returns whether a record was there.
    pub fn delete(&mut self, key: &RecordKey) -> Result<bool> {
        let Some(previous) = self.get(key)? else {
            return Ok(false);
        };
        self.remove_index_entries(key, &previous)?;
        let encoded = key.encode()?;
        self.txn.del(self.handles.records, &encoded, None)?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.txn.clear_db(self.handles.records)?;
        for (_, db) in &self.handles.indexes {
            self.txn.clear_db(*db)?;
        }
        Ok(())
    }

    fn duplicate(&self, key: &RecordKey) -> StoreError {
        StoreError::DuplicateKey {
            collection: self.handles.schema.name.clone(),
            key: key.to_string(),
        }
    }

    fn add_index_entries(&mut self, key: &RecordKey, record: &JsonValue) -> Result<()> {
        let primary = key.encode()?;
        for (index, db) in &self.handles.indexes {
            let Some(value) = indexed_value(record, &index.field) else {
                continue;
            };
            match self
                .txn
                .put(*db, &index_key(value)?, &primary, WriteFlags::NO_DUP_DATA)
            {
                Ok(()) | Err(lmdb::Error::KeyExist) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn remove_index_entries(&mut self, key: &RecordKey, record: &JsonValue) -> Result<()> {
        let primary = key.encode()?;
        for (index, db) in &self.handles.indexes {
            let Some(value) = indexed_value(record, &index.field) else {
                continue;
            };
            let value_key = index_key(value)?;
            let mut cursor = self.txn.open_rw_cursor(*db)?;
            // Leaves the cursor on the matching duplicate.
            let found = match cursor.iter_dup_of(&value_key) {
                Ok(mut dups) => dups.any(|(_, k)| k == primary.as_slice()),
                Err(lmdb::Error::NotFound) => false,
                Err(e) => return Err(e.into()),
            };
            if found {
                cursor.del(WriteFlags::empty())?;
            }
        }
        Ok(())
    }
}

/// Records without the field (or with `null`) are not indexed.
fn indexed_value<'r>(record: &'r JsonValue, field: &str) -> Option<&'r JsonValue> {
    match record.get(field) {
        None | Some(JsonValue::Null) => None,
        Some(value) => Some(value),
    }
}

/// JSON encoding used to compare indexed values. Integral floats encode as
/// integers, so `5.0` and `5` are the same value.
fn comparable(value: &JsonValue) -> Result<Vec<u8>> {
    if let (true, Some(f)) = (value.is_f64(), value.as_f64()) {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            return Ok(serde_json::to_vec(&(f as i64))?);
        }
    }
    Ok(serde_json::to_vec(value)?)
}

fn index_key(value: &JsonValue) -> Result<Vec<u8>> {
    let encoded = comparable(value)?;
    if encoded.len() <= MAX_KEY_BYTES {
        return Ok(encoded);
    }
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(format!("#sha256:{:x}", hasher.finalize()).into_bytes())
}

fn record_at<T: Transaction>(txn: &T, records: Database, encoded: &[u8]) -> Result<Option<JsonValue>> {
    match txn.get(records, &encoded) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn get_record<T: Transaction>(txn: &T, handles: &CollectionHandles, key: &RecordKey) -> Result<Option<JsonValue>> {
    record_at(txn, handles.records, &key.encode()?)
}

fn all_records<T: Transaction>(txn: &T, handles: &CollectionHandles) -> Result<Vec<JsonValue>> {
    let mut cursor = txn.open_ro_cursor(handles.records)?;
    let mut records = Vec::new();
    for (_key, value) in cursor.iter() {
        records.push(serde_json::from_slice(value)?);
    }
    Ok(records)
}

fn records_by_index<T: Transaction>(
    txn: &T,
    handles: &CollectionHandles,
    index: &str,
    value: &JsonValue,
) -> Result<Vec<JsonValue>> {
    let (descriptor, db) = handles.index(index)?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    let wanted = comparable(value)?;

    let primaries: Vec<Vec<u8>> = {
        let mut cursor = txn.open_ro_cursor(*db)?;
        match cursor.iter_dup_of(&index_key(value)?) {
            Ok(dups) => dups.map(|(_, k)| k.to_vec()).collect(),
            Err(lmdb::Error::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        }
    };

    let mut records = Vec::with_capacity(primaries.len());
    for primary in primaries {
        let Some(record) = record_at(txn, handles.records, &primary)? else {
            continue;
        };
        let matches = match indexed_value(&record, &descriptor.field) {
            Some(field) => comparable(field)? == wanted,
            None => false,
        };
        if matches {
            records.push(record);
        }
    }
    Ok(records)
}
