//! Durable local mirror of the central database.
//!
//! Holds the signatures, the factory key table and one queue table per
//! payload category. It is a mirror, not a merge: whatever the gateway
//! fetches remotely overwrites what is stored here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::types::{FactoryKey, Payload, QueueCategory, QueuedItem, SignatureKind};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// One SQLite connection behind a lock. Writes are serialized through it
/// and transparently retried while the file is busy.
#[derive(Clone)]
pub(crate) struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub(crate) fn open(path: &Path, schema: &str) -> Result<Self, CacheError> {
        Self::init(Connection::open(path)?, schema)
    }

    pub(crate) fn in_memory(schema: &str) -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?, schema)
    }

    fn init(conn: Connection, schema: &str) -> Result<Self, CacheError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `op` on the blocking pool under the connection lock, retrying
    /// while SQLite reports busy.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || with_retry(&conn, op))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

fn with_retry<T>(
    conn: &Mutex<Connection>,
    op: impl Fn(&Connection) -> rusqlite::Result<T>,
) -> Result<T, CacheError> {
    let mut delay = BUSY_BACKOFF;
    for attempt in 1..=BUSY_ATTEMPTS {
        let result = {
            let conn = conn.lock();
            op(&conn)
        };
        match result {
            Err(e) if is_busy(&e) => {
                warn!(attempt, "store busy, backing off");
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other.map_err(CacheError::from),
        }
    }
    Err(CacheError::Busy(BUSY_ATTEMPTS))
}

pub struct CacheGateway {
    store: SqliteStore,
}

impl CacheGateway {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            store: SqliteStore::open(path.as_ref(), &schema())?,
        })
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Ok(Self {
            store: SqliteStore::in_memory(&schema())?,
        })
    }

    pub async fn set_signature(&self, kind: SignatureKind, value: &str) -> Result<(), CacheError> {
        let value = value.to_string();
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO signatures (kind, value) VALUES (?1, ?2)",
                    params![kind.as_str(), value],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn signature(&self, kind: SignatureKind) -> Result<Option<String>, CacheError> {
        self.store
            .run(move |conn| {
                conn.query_row(
                    "SELECT value FROM signatures WHERE kind = ?1",
                    params![kind.as_str()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn put_factory_key(&self, ident: &str, key: &FactoryKey) -> Result<(), CacheError> {
        let (ident, key) = (ident.to_string(), key.clone());
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO factory_keys (ident, key, good) VALUES (?1, ?2, ?3)",
                    params![ident, key.key, key.good],
                )
            })
            .await?;
        Ok(())
    }

    /// Replaces the whole table with `keys`.
    pub async fn replace_factory_keys(&self, keys: &HashMap<String, FactoryKey>) -> Result<(), CacheError> {
        let keys = keys.clone();
        self.store
            .run(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute("DELETE FROM factory_keys", [])?;
                for (ident, key) in &keys {
                    tx.execute(
                        "INSERT INTO factory_keys (ident, key, good) VALUES (?1, ?2, ?3)",
                        params![ident, key.key, key.good],
                    )?;
                }
                tx.commit()
            })
            .await
    }

    pub async fn factory_key(&self, ident: &str) -> Result<Option<FactoryKey>, CacheError> {
        let ident = ident.to_string();
        self.store
            .run(move |conn| {
                conn.query_row(
                    "SELECT key, good FROM factory_keys WHERE ident = ?1",
                    params![ident],
                    |row| {
                        Ok(FactoryKey {
                            key: row.get(0)?,
                            good: row.get(1)?,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    pub async fn factory_keys(&self) -> Result<HashMap<String, FactoryKey>, CacheError> {
        self.store
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT ident, key, good FROM factory_keys")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        FactoryKey {
                            key: row.get(1)?,
                            good: row.get(2)?,
                        },
                    ))
                })?;
                let keys: rusqlite::Result<HashMap<_, _>> = rows.collect();
                keys
            })
            .await
    }

    /// Stores `items` for the agent, returns how many rows were written.
    pub async fn store_queue(
        &self,
        category: QueueCategory,
        agent_id: &str,
        items: &[QueuedItem],
    ) -> Result<usize, CacheError> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (agent_id, item_id, kind, name, content, depth)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            category.as_str()
        );
        let (owner, items) = (agent_id.to_string(), items.to_vec());
        let stored = self
            .store
            .run(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let mut stored = 0;
                for item in &items {
                    let (kind, name, content, depth) = payload_columns(&item.payload);
                    stored += tx.execute(&sql, params![owner, item.id, kind, name, content, depth])?;
                }
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        debug!(category = category.as_str(), agent_id, stored, "queue cached");
        Ok(stored)
    }

    pub async fn queue_count(&self, category: QueueCategory, agent_id: &str) -> Result<usize, CacheError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE agent_id = ?1", category.as_str());
        let agent_id = agent_id.to_string();
        let count: i64 = self
            .store
            .run(move |conn| conn.query_row(&sql, params![agent_id], |row| row.get(0)))
            .await?;
        Ok(count as usize)
    }

    /// Lowest item id for the agent; numeric ids compare as numbers.
    pub async fn queue_first(
        &self,
        category: QueueCategory,
        agent_id: &str,
    ) -> Result<Option<QueuedItem>, CacheError> {
        let sql = format!(
            "SELECT item_id, kind, name, content, depth FROM {}
             WHERE agent_id = ?1 ORDER BY length(item_id) ASC, item_id ASC LIMIT 1",
            category.as_str()
        );
        let agent_id = agent_id.to_string();
        let row = self
            .store
            .run(move |conn| {
                conn.query_row(&sql, params![agent_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                        row.get::<_, Option<u32>>(4)?,
                    ))
                })
                .optional()
            })
            .await?;

        match row {
            None => Ok(None),
            Some((id, kind, name, content, depth)) => {
                let payload = payload_from_columns(&kind, name, content, depth)?;
                Ok(Some(QueuedItem { id, payload }))
            }
        }
    }

    pub async fn queue_delete(
        &self,
        category: QueueCategory,
        agent_id: &str,
        item_id: &str,
    ) -> Result<bool, CacheError> {
        let sql = format!(
            "DELETE FROM {} WHERE agent_id = ?1 AND item_id = ?2",
            category.as_str()
        );
        let (agent_id, item_id) = (agent_id.to_string(), item_id.to_string());
        let rows = self
            .store
            .run(move |conn| conn.execute(&sql, params![agent_id, item_id]))
            .await?;
        Ok(rows > 0)
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<(), CacheError> {
        let sql = sql.to_string();
        self.store.run(move |conn| conn.execute_batch(&sql)).await
    }
}

fn schema() -> String {
    let mut schema = String::from(
        "CREATE TABLE IF NOT EXISTS signatures (
            kind TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS factory_keys (
            ident TEXT PRIMARY KEY NOT NULL,
            key TEXT NOT NULL,
            good INTEGER NOT NULL
        );",
    );
    for category in QueueCategory::ALL {
        schema.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                agent_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                content BLOB,
                depth INTEGER,
                PRIMARY KEY (agent_id, item_id)
            );",
            category.as_str()
        ));
    }
    schema
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn payload_columns(payload: &Payload) -> (&'static str, &str, Option<&[u8]>, Option<u32>) {
    match payload {
        Payload::File { filename, content } => {
            ("file", filename.as_str(), Some(content.as_slice()), None)
        }
        Payload::Pattern { path } => ("pattern", path.as_str(), None, None),
        Payload::Listing { path, depth } => ("listing", path.as_str(), None, Some(*depth)),
        Payload::Command { command } => ("command", command.as_str(), None, None),
    }
}

fn payload_from_columns(
    kind: &str,
    name: String,
    content: Option<Vec<u8>>,
    depth: Option<u32>,
) -> Result<Payload, CacheError> {
    match kind {
        "file" => Ok(Payload::File {
            filename: name,
            content: content.unwrap_or_default(),
        }),
        "pattern" => Ok(Payload::Pattern { path: name }),
        "listing" => Ok(Payload::Listing {
            path: name,
            depth: depth.unwrap_or(1),
        }),
        "command" => Ok(Payload::Command { command: name }),
        other => Err(CacheError::Corrupt(format!("unknown payload kind {other}"))),
    }
}
