//! # Enrichment Common Library
//!
//! Shared code for the enrichment audit crates:
//! - Error type and result alias
//! - Bootstrap configuration (TOML)
//! - SQLite initialization and lock-retry helper
//! - Entity references (company, domain, person)
//! - Clock abstraction and timestamp conversion

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod time;

pub use error::{Error, Result};
pub use models::{EntityKind, EntityRef};
pub use time::{Clock, ManualClock, SystemClock};
