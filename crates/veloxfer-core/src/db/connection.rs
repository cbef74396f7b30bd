//! Database connection management

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = include_str!("../../../../migrations/001_initial.sql");

/// Get the default database path
pub fn get_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veloxfer");

    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("veloxfer.db")
}

/// Initialize the database at the default location
pub fn init_database() -> Result<Database> {
    init_database_at(&get_db_path())
}

/// Initialize the database at an explicit path
pub fn init_database_at(path: &Path) -> Result<Database> {
    log::info!("Initializing database at: {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn = Connection::open(path)?;

    // Run migrations
    conn.execute_batch(SCHEMA)?;

    Ok(Database {
        conn: Arc::new(Mutex::new(conn)),
    })
}

/// Database wrapper with thread-safe connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// In-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a function with the database connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| {
            Error::Database(format!("Failed to lock database: {}", e))
        })?;
        f(&conn).map_err(Into::into)
    }
}
