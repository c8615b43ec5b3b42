use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not open database: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Logical tables inside the single database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Jobs,
    Logs,
    LogErrors,
    Tokens,
    Aliases,
}

impl Bucket {
    fn as_str(&self) -> &'static str {
        match self {
            Bucket::Jobs => "jobs",
            Bucket::Logs => "logs",
            Bucket::LogErrors => "log_errors",
            Bucket::Tokens => "tokens",
            Bucket::Aliases => "aliases",
        }
    }
}

/// Serializes a job id as an 8 byte big endian key so that bytewise key
/// ordering matches numeric ordering.
pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Embedded key ordered KV store over a single SQLite file.
///
/// Every public call runs as one transaction; writes are all or nothing.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database file and its schema.
    pub async fn open(db: &config::Database) -> Result<Store> {
        let conn = Connection::open(&db.path)?;
        conn.busy_timeout(db.timeout())?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key    BLOB NOT NULL,
                value  BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            CREATE TABLE IF NOT EXISTS counters (
                name  TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &db.path,
                std::fs::Permissions::from_mode(db.file_mode),
            )?;
        }

        debug!("opened database at {}", db.path.display());

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a store on a throwaway file under `dir`, for tests.
    pub async fn open_in_dir(dir: &Path) -> Result<Store> {
        let db = config::Database {
            path: dir.join("meeseeks.db"),
            ..Default::default()
        };
        Store::open(&db).await
    }

    /// Returns the next value of the persistent monotonic id sequence.
    ///
    /// Ids survive restarts and are never reused.
    pub async fn next_id(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO counters (name, value) VALUES ('jobs', 0)
             ON CONFLICT (name) DO NOTHING",
            [],
        )?;
        conn.execute("UPDATE counters SET value = value + 1 WHERE name = 'jobs'", [])?;
        let id: i64 =
            conn.query_row("SELECT value FROM counters WHERE name = 'jobs'", [], |row| {
                row.get(0)
            })?;
        Ok(id as u64)
    }

    pub async fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket.as_str(), key, value],
        )?;
        Ok(())
    }

    /// Appends `chunk` to the value stored under `key`, creating it when
    /// missing. Used for the per job log blobs.
    pub async fn append(&self, bucket: Bucket, key: &[u8], chunk: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = kv.value || excluded.value",
            params![bucket.as_str(), key, chunk],
        )?;
        Ok(())
    }

    pub async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket.as_str(), key],
        )?;
        Ok(())
    }

    /// Returns `(key, value)` pairs with `start <= key <= end` in ascending
    /// key order.
    pub async fn scan_range(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE bucket = ?1 AND key >= ?2 AND key <= ?3
             ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![bucket.as_str(), start, end], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Same as [`scan_range`](Store::scan_range) but in descending key
    /// order, used to list the most recent jobs first.
    pub async fn scan_rev(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE bucket = ?1 AND key >= ?2 AND key <= ?3
             ORDER BY key DESC",
        )?;
        let rows = stmt.query_map(params![bucket.as_str(), start, end], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Lists every key in a bucket with the given prefix, ascending.
    pub async fn scan_prefix(
        &self,
        bucket: Bucket,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut end = prefix.to_vec();
        end.extend_from_slice(&[0xff; 8]);
        self.scan_range(bucket, prefix, &end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_id_is_monotonic_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = config::Database {
            path: dir.path().join("test.db"),
            ..Default::default()
        };

        let store = Store::open(&db).await.unwrap();
        assert_eq!(store.next_id().await.unwrap(), 1);
        assert_eq!(store.next_id().await.unwrap(), 2);
        drop(store);

        let store = Store::open(&db).await.unwrap();
        assert_eq!(store.next_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();

        store.put(Bucket::Tokens, b"tok", b"value").await.unwrap();
        assert_eq!(
            store.get(Bucket::Tokens, b"tok").await.unwrap(),
            Some(b"value".to_vec())
        );

        store.delete(Bucket::Tokens, b"tok").await.unwrap();
        assert_eq!(store.get(Bucket::Tokens, b"tok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();

        store.put(Bucket::Jobs, b"k", b"job").await.unwrap();
        store.put(Bucket::Logs, b"k", b"log").await.unwrap();

        assert_eq!(
            store.get(Bucket::Jobs, b"k").await.unwrap(),
            Some(b"job".to_vec())
        );
        assert_eq!(
            store.get(Bucket::Logs, b"k").await.unwrap(),
            Some(b"log".to_vec())
        );
    }

    #[tokio::test]
    async fn append_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();

        store.append(Bucket::Logs, b"k", b"one\n").await.unwrap();
        store.append(Bucket::Logs, b"k", b"two\n").await.unwrap();
        assert_eq!(
            store.get(Bucket::Logs, b"k").await.unwrap(),
            Some(b"one\ntwo\n".to_vec())
        );
    }

    #[tokio::test]
    async fn scan_range_orders_ids_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();

        for id in [1u64, 2, 10, 255, 256] {
            store
                .put(Bucket::Jobs, &id_key(id), id.to_string().as_bytes())
                .await
                .unwrap();
        }

        let rows = store
            .scan_range(Bucket::Jobs, &id_key(0), &id_key(u64::MAX))
            .await
            .unwrap();
        let ids: Vec<u64> = rows
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![1, 2, 10, 255, 256]);

        let rows = store
            .scan_rev(Bucket::Jobs, &id_key(2), &id_key(255))
            .await
            .unwrap();
        let ids: Vec<u64> = rows
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![255, 10, 2]);
    }
}
