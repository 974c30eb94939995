//! SQLite storage backend for Leadline.
//!
//! Implements [`leadline_core::store::PipelineStore`] and the schema
//! evolution seams ([`leadline_core::evolution::MigrationLedger`],
//! [`leadline_core::evolution::ShapeMigration`]) using
//! [`tokio_rusqlite`] for async access to a single SQLite file.

mod aggregate;
mod consolidate;
mod encode;
pub mod error;
mod schema;
mod store;

pub use aggregate::Shape;
pub use consolidate::{ConsolidateLeadShape, MIGRATION_ID};
pub use error::{Error, Result};
pub use store::SqliteStore;
