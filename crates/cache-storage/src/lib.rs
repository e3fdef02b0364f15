#![doc(issue_tracker_base_url = "https://github.com/stockcache/fabric/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Implementations of [`cache_core::StorageBackend`]:
//!
//! - [`SqliteBackend`] - embedded, single-file persistence (default, `sqlite` feature)
//! - [`PostgresBackend`] - hosted, shared persistence (`postgres` feature)
//! - [`InMemoryBackend`] - in-memory backend for tests and the no-persistence mode

/// In-memory storage backend.
pub mod memory;

/// Embedded SQLite storage backend.
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Hosted Postgres storage backend.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use cache_core::storage::StorageBackend;
pub use memory::InMemoryBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
