//! batch-connector: bookkeeping for batches of outbound connection attempts.
//!
//! Attempts are stored in SQLite and resolved by dialing their targets,
//! directly or through a SOCKS5 proxy chosen from the live runtime config.

pub mod config;
pub mod db;
pub mod dialer;
pub mod manager;
pub mod probe;
pub mod web;

pub use config::{ConfigError, ConfigStore, ProxyConfig, RuntimeConfig, ServerConfig};
pub use db::{ConnectionAttempt, DbError, NewAttempt, Status, Store};
pub use dialer::{DialContext, DialError, Dialer, Route, Target};
pub use manager::{ConnectionManager, ManagerError, Outcome};
