//! SQLite-backed storage via diesel.

use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info, instrument};

use crate::store::models::{NewStateRow, StateRow};
use crate::store::{StateStore, StoreError, schema};
use async_trait::async_trait;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Stores actor records in one SQLite table.
///
/// Each call opens its own connection on a blocking thread, so the path
/// must name a file; `":memory:"` would give every call a fresh database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: String,
}

impl SqliteStore {
    /// Opens (creating if needed) the database and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or migrated.
    #[instrument(skip(db_path), fields(db_path = %db_path))]
    pub fn open(db_path: String) -> Result<Self, StoreError> {
        info!(path = %db_path, "Opening SqliteStore");
        let store = Self { db_path };
        let mut conn = store.connection()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::new(format!("Migrations failed: {}", e)))?;
        info!(applied = applied.len(), "Migrations applied");
        Ok(store)
    }

    /// Establishes a database connection.
    ///
    /// Writers on other connections are waited for instead of failing
    /// with `SQLITE_BUSY`.
    #[instrument(skip(self))]
    fn connection(&self) -> Result<SqliteConnection, StoreError> {
        debug!(path = %self.db_path, "Establishing connection");
        let mut conn = SqliteConnection::establish(&self.db_path).map_err(|e| {
            StoreError::new(format!("Failed to connect to '{}': {}", self.db_path, e))
        })?;
        diesel::sql_query(format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT_MS)).execute(&mut conn)?;
        Ok(conn)
    }

    #[instrument(skip(self))]
    fn read_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection()?;
        let row = schema::actor_state::table
            .find(key)
            .select(StateRow::as_select())
            .first(&mut conn)
            .optional()?;
        debug!(found = row.is_some(), "Read record");
        Ok(row.map(StateRow::into_record))
    }

    #[instrument(skip(self, record), fields(bytes = record.len()))]
    fn write_blocking(&self, key: String, record: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let row = NewStateRow::new(key, record, chrono::Utc::now().naive_utc());
        diesel::replace_into(schema::actor_state::table)
            .values(&row)
            .execute(&mut conn)?;
        debug!("Wrote record");
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.read_blocking(&key)).await?
    }

    async fn write(&self, key: &str, record: Vec<u8>) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.write_blocking(key, record)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn setup_test_db() -> (NamedTempFile, SqliteStore) {
        let db_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = db_file.path().to_str().expect("Invalid path").to_string();
        let store = SqliteStore::open(db_path).expect("Failed to open store");
        (db_file, store)
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let (_db, store) = setup_test_db();
        assert_eq!(store.read("Checkbox:absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_replaces_whole_record() {
        let (_db, store) = setup_test_db();
        store.write("War:1", b"first".to_vec()).await.unwrap();
        store.write("War:1", b"second".to_vec()).await.unwrap();
        assert_eq!(
            store.read("War:1").await.unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let (db, store) = setup_test_db();
        store.write("User:u1", vec![1, 2, 3]).await.unwrap();
        let path = db.path().to_str().unwrap().to_string();
        let reopened = SqliteStore::open(path).unwrap();
        assert_eq!(reopened.read("User:u1").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
