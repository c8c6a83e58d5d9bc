//! Persistence collaborator: whole-record key/value storage for actor state.

mod error;
mod memory;
mod models;
mod schema; // Diesel generated schema - internal use only
mod sqlite;
mod state;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use state::PersistentState;

use async_trait::async_trait;

/// Key/value storage for serialized actor records.
///
/// Writes replace the whole record; there are no partial updates.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Reads the record stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the record stored under `key`.
    async fn write(&self, key: &str, record: Vec<u8>) -> Result<(), StoreError>;
}
