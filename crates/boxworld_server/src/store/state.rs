//! Typed whole-record persistence for one actor.

use crate::store::{StateStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// An actor's persisted record plus the key it lives under.
///
/// `write` only replaces the in-memory record after the store accepted
/// it, so a failed write leaves the actor exactly as it was.
#[derive(Debug)]
pub struct PersistentState<T> {
    key: String,
    record: T,
    exists: bool,
    store: Arc<dyn StateStore>,
}

impl<T> PersistentState<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Loads the record under `key`, or `T::default()` if none is stored.
    #[instrument(skip(store))]
    pub async fn load(store: Arc<dyn StateStore>, key: String) -> Result<Self, StoreError> {
        let stored = store.read(&key).await.inspect_err(|e| {
            error!(error = %e, "State read failed");
        })?;
        let (record, exists) = match stored {
            Some(bytes) => (serde_json::from_slice(&bytes)?, true),
            None => (T::default(), false),
        };
        debug!(exists, "Loaded state");
        Ok(Self {
            key,
            record,
            exists,
            store,
        })
    }

    /// Storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current record.
    pub fn get(&self) -> &T {
        &self.record
    }

    /// Whether a record has ever been written.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Persists `record` and makes it current.
    #[instrument(skip(self, record), fields(key = %self.key))]
    pub async fn write(&mut self, record: T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&record)?;
        if let Err(e) = self.store.write(&self.key, bytes).await {
            error!(error = %e, "State write failed, keeping previous record");
            return Err(e);
        }
        self.record = record;
        self.exists = true;
        debug!("State written");
        Ok(())
    }
}
