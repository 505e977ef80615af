//! ccdindex-storage: storage backends for CCDIndex.
//!
//! Backends:
//! - `memory` (default feature): in-memory, for tests and dry runs
//! - `postgres`: PostgreSQL via `sqlx`, one transaction per session

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::{InMemoryStorage, MemoryRepository, MemoryTransaction};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStorage};
