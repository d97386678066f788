//! # Infrastructure Adapters
//!
//! Infrastructure implementations of the account store and dead-letter interfaces.

pub mod filesystem_dead_letter;
pub mod memory_dead_letter;
pub mod memory_store;

#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use filesystem_dead_letter::FilesystemDeadLetterSink;
pub use memory_dead_letter::InMemoryDeadLetterSink;
pub use memory_store::InMemoryAccountStore;

#[cfg(feature = "postgres")]
pub use postgres_store::PostgresAccountStore;
