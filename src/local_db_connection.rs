//! Per-context connection cache.
//!
//! A [`ConnectionManager`] stands for one execution context (a window, a
//! worker). It opens each registered database at most once, installs the
//! [`SchemaMigrator`] as the upgrade hook, and moves every database through:
//!
//! ```text
//! Closed -> Opening -> Open -> Closed
//!              |         |
//!              |         +-> ForcedClosing -> Closed   (another context upgrades)
//!              +-> BlockedWait                         (another context refuses to close)
//! ```
//!
//! Callers that ask for a database while it is `Opening` wait for that open
//! and receive its result; no second open is issued.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::local_db_host::{Connection, ConnectionListener, StorageHost, UpgradeTransaction};
use crate::local_db_migrator::SchemaMigrator;
use crate::local_db_schema::SchemaRegistry;
use crate::store_error::{Result, StoreError};

/// Observable state of one database in one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    BlockedWait,
    ForcedClosing,
}

enum Slot {
    Closed,
    Opening,
    Open(Arc<Connection>),
    BlockedWait,
    ForcedClosing,
}

struct SlotEntry {
    slot: Slot,
    /// Bumped every time an open attempt finishes.
    generation: u64,
    last_error: Option<StoreError>,
}

impl Default for SlotEntry {
    fn default() -> Self {
        Self {
            slot: Slot::Closed,
            generation: 0,
            last_error: None,
        }
    }
}

struct ManagerInner {
    registry: Arc<SchemaRegistry>,
    host: Option<Arc<StorageHost>>,
    slots: Mutex<HashMap<String, SlotEntry>>,
    changed: Condvar,
}

impl ManagerInner {
    fn force_close(&self, connection: &Arc<Connection>, new_version: Option<u32>) {
        let name = connection.name().to_string();
        {
            let mut slots = self.slots.lock();
            if let Some(entry) = slots.get_mut(&name) {
                if matches!(&entry.slot, Slot::Open(c) if c.id() == connection.id()) {
                    entry.slot = Slot::ForcedClosing;
                }
            }
        }

        match new_version {
            Some(version) => info!(
                "Closing connection to '{name}' so another context can upgrade it to version {version}"
            ),
            None => info!("Closing connection to '{name}' so another context can delete it"),
        }
        connection.close();

        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(&name) {
            if matches!(entry.slot, Slot::ForcedClosing) {
                entry.slot = Slot::Closed;
            }
        }
        self.changed.notify_all();
    }

    fn forget(&self, connection: &Arc<Connection>) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(connection.name()) {
            if matches!(&entry.slot, Slot::Open(c) if c.id() == connection.id()) {
                entry.slot = Slot::Closed;
                warn!(
                    "Connection to '{}' terminated; it will be reopened on next use",
                    connection.name()
                );
            }
        }
        self.changed.notify_all();
    }
}

/// Routes host lifecycle signals back to the manager that owns a connection.
struct SlotListener {
    manager: Weak<ManagerInner>,
}

impl ConnectionListener for SlotListener {
    fn on_version_change(&self, connection: &Arc<Connection>, new_version: Option<u32>) {
        match self.manager.upgrade() {
            Some(manager) => manager.force_close(connection, new_version),
            None => connection.close(),
        }
    }

    fn on_terminated(&self, connection: &Arc<Connection>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.forget(connection);
        }
    }
}

/// Connection cache of one execution context. Cheap to clone; clones share
/// the cache.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SchemaRegistry>, host: Arc<StorageHost>) -> Self {
        Self::build(registry, Some(host))
    }

    /// A manager for a context without storage access (server-side
    /// rendering). Every `acquire` fails with
    /// [`StoreError::ServerSideUnavailable`].
    pub fn server_side(registry: Arc<SchemaRegistry>) -> Self {
        Self::build(registry, None)
    }

    fn build(registry: Arc<SchemaRegistry>, host: Option<Arc<StorageHost>>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                host,
                slots: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn host(&self) -> Result<&Arc<StorageHost>> {
        self.inner
            .host
            .as_ref()
            .ok_or(StoreError::ServerSideUnavailable)
    }

    /// Returns the open connection to `name`, opening (and migrating) it first
    /// if needed.
    pub fn acquire(&self, name: &str) -> Result<Arc<Connection>> {
        let host = self.host()?;
        let descriptor = self.inner.registry.describe(name)?.clone();

        {
            let mut slots = self.inner.slots.lock();
            loop {
                let entry = slots.entry(name.to_string()).or_default();
                match &entry.slot {
                    Slot::Open(conn) if !conn.is_closed() => return Ok(Arc::clone(conn)),
                    Slot::Opening | Slot::ForcedClosing => {
                        let waiting_on = entry.generation;
                        self.inner.changed.wait(&mut slots);
                        if let Some(entry) = slots.get(name) {
                            let finished = entry.generation != waiting_on;
                            if finished && !matches!(entry.slot, Slot::Open(_)) {
                                if let Some(err) = &entry.last_error {
                                    return Err(err.clone());
                                }
                            }
                        }
                    }
                    _ => {
                        entry.slot = Slot::Opening;
                        break;
                    }
                }
            }
        }

        debug!("Opening '{name}' at version {}", descriptor.version);
        let listener: Arc<dyn ConnectionListener> = Arc::new(SlotListener {
            manager: Arc::downgrade(&self.inner),
        });
        let mut migrate = |tx: &mut UpgradeTransaction| -> Result<()> {
            SchemaMigrator::migrate(tx, &descriptor).map(|_| ())
        };
        let result = host.open(name, descriptor.version, listener, &mut migrate);

        let mut slots = self.inner.slots.lock();
        let entry = slots.entry(name.to_string()).or_default();
        entry.generation += 1;
        match &result {
            Ok(conn) => {
                entry.slot = Slot::Open(Arc::clone(conn));
                entry.last_error = None;
                info!("Database '{name}' open at version {}", conn.version());
            }
            Err(err @ StoreError::BlockedByOtherContext { .. }) => {
                entry.slot = Slot::BlockedWait;
                entry.last_error = Some(err.clone());
                warn!(
                    "Opening '{name}' is blocked: close other windows of the application that still use it, then try again"
                );
            }
            Err(err) => {
                entry.slot = Slot::Closed;
                entry.last_error = Some(err.clone());
                warn!("Failed to open '{name}': {err}");
            }
        }
        self.inner.changed.notify_all();

        result
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        let slots = self.inner.slots.lock();
        match slots.get(name).map(|entry| &entry.slot) {
            None | Some(Slot::Closed) => ConnectionState::Closed,
            Some(Slot::Opening) => ConnectionState::Opening,
            Some(Slot::Open(conn)) if conn.is_closed() => ConnectionState::Closed,
            Some(Slot::Open(_)) => ConnectionState::Open,
            Some(Slot::BlockedWait) => ConnectionState::BlockedWait,
            Some(Slot::ForcedClosing) => ConnectionState::ForcedClosing,
        }
    }

    /// Closes the cached connection to `name`, if any.
    pub fn close(&self, name: &str) -> bool {
        let taken = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(name) {
                Some(entry) if matches!(entry.slot, Slot::Open(_)) => {
                    match std::mem::replace(&mut entry.slot, Slot::Closed) {
                        Slot::Open(conn) => Some(conn),
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        self.inner.changed.notify_all();

        match taken {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Closes every cached connection. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let taken: Vec<Arc<Connection>> = {
            let mut slots = self.inner.slots.lock();
            slots
                .values_mut()
                .filter(|entry| matches!(entry.slot, Slot::Open(_)))
                .filter_map(|entry| match std::mem::replace(&mut entry.slot, Slot::Closed) {
                    Slot::Open(conn) => Some(conn),
                    _ => None,
                })
                .collect()
        };
        self.inner.changed.notify_all();

        let count = taken.iter().filter(|conn| !conn.is_closed()).count();
        for conn in taken {
            conn.close();
        }
        count
    }
}
