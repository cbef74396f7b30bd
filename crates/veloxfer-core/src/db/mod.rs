//! Database module - SQLite persistence layer

mod connection;
mod stats;

pub use connection::{get_db_path, init_database, init_database_at, Database};
pub use stats::{StatsDb, StatsTotals};
