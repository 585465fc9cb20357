//! Database module for batch-connector.
//!
//! Provides SQLite storage for connection attempts.

mod models;
mod store;

pub use models::*;
pub use store::*;
