//! The process-wide [`Database`].
//!
//! Applications call [`install`] once from their startup routine. Code
//! that runs without one gets the default [`Database::bootstrap`] handles
//! on first reference to [`database`].

use std::sync::OnceLock;

use taxi_core::{Error, Result};

use crate::bootstrap::Database;

static DATABASE: OnceLock<Database> = OnceLock::new();

/// Publish `database` as the process-wide handles.
///
/// Fails with a conflict if handles were already installed or created.
pub fn install(database: Database) -> Result<&'static Database> {
    let mut installed = false;
    let current = DATABASE.get_or_init(|| {
        installed = true;
        database
    });

    if installed {
        Ok(current)
    } else {
        Err(Error::conflict(format!(
            "database handles already initialized for {}",
            current.engine().url()
        )))
    }
}

/// The process-wide handles, creating the defaults if none were installed.
pub fn database() -> &'static Database {
    DATABASE.get_or_init(Database::bootstrap)
}

/// The process-wide handles, if they exist yet.
pub fn try_database() -> Option<&'static Database> {
    DATABASE.get()
}
