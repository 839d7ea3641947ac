use log::{info, warn};

use crate::local_db_connection::ConnectionManager;
use crate::store_error::Result;

/// Emergency recovery: wipes every registered database.
///
/// Every handle acquired before the reset is invalid afterwards; callers
/// normally confirm with the user first and reload the application after.
pub struct ResetManager {
    connections: ConnectionManager,
}

impl ResetManager {
    pub fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }

    /// Closes this context's connections, then deletes every registered
    /// database. Irreversible.
    pub fn reset_all(&self) -> Result<()> {
        let host = self.connections.host()?;

        let closed = self.connections.close_all();
        info!("Reset: closed {closed} cached connection(s)");

        let names: Vec<String> = self
            .connections
            .registry()
            .names()
            .map(str::to_string)
            .collect();

        for name in &names {
            if let Err(e) = host.delete_database(name) {
                warn!("Reset stopped at '{name}': {e}");
                return Err(e);
            }
        }

        warn!("Reset: deleted {} database(s)", names.len());
        Ok(())
    }
}
