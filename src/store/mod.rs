//! Preference store
//!
//! Small key-value persistence boundary used for the operation queue, the
//! cached identity, and the anonymous shadow data. Values are whole JSON
//! documents written atomically per key; the engine never needs cross-key
//! transactions. Two implementations are provided: [`SqliteStore`] for
//! durable storage and [`MemoryStore`] for tests and ephemeral embedders.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Atomic single-key JSON storage.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Removes the value stored under `key`.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}
