//! Gateway to the central database with local cache fallback.
//!
//! Every remote call goes through [`DatabaseGateway::call`], which bounds it
//! with a timeout and flips the gateway to unavailable on any failure. While
//! unavailable no remote call is attempted; reads are served from the
//! [`CacheGateway`] and writes become no-ops until the next reconnect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::cache::CacheGateway;
use crate::core::observability::{self, HealthState};
use crate::crypto::{self, Key};
use crate::error::{DatabaseError, RelayError, RelayResult};
use crate::types::{
    AgentIdentity, AgentStatus, FactoryKey, QueueCategory, QueuedItem, SignatureKind, StatusReply,
    SubmitOutcome, SyncInfo, Taken,
};

/// Logical RPCs offered by the central database. Implementations must
/// tolerate at-least-once delivery.
#[async_trait]
pub trait CentralDatabase: Send + Sync {
    async fn ping(&self) -> Result<(), DatabaseError>;
    async fn signature(&self, kind: SignatureKind) -> Result<String, DatabaseError>;
    async fn factory_key(&self, ident: &str) -> Result<Option<FactoryKey>, DatabaseError>;
    async fn factory_keys(&self) -> Result<HashMap<String, FactoryKey>, DatabaseError>;
    async fn agent_status(&self, identity: &AgentIdentity) -> Result<StatusReply, DatabaseError>;
    async fn agent_uninstall(&self, agent_id: &str) -> Result<(), DatabaseError>;
    async fn sync_start(&self, info: &SyncInfo) -> Result<(), DatabaseError>;
    async fn sync_update(&self, info: &SyncInfo) -> Result<(), DatabaseError>;
    async fn sync_timeout(&self, info: &SyncInfo) -> Result<(), DatabaseError>;
    async fn sync_end(&self, info: &SyncInfo) -> Result<(), DatabaseError>;
    async fn send_evidence(&self, instance: &str, blob: &[u8]) -> Result<SubmitOutcome, DatabaseError>;
    async fn fetch_queue(
        &self,
        category: QueueCategory,
        agent_id: &str,
    ) -> Result<Vec<QueuedItem>, DatabaseError>;
    async fn delete_queue_item(
        &self,
        category: QueueCategory,
        agent_id: &str,
        item_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn purge_queue(&self, category: QueueCategory, agent_id: &str) -> Result<(), DatabaseError>;
}

pub struct DatabaseGateway {
    remote: Arc<dyn CentralDatabase>,
    cache: Arc<CacheGateway>,
    available: AtomicBool,
    factory_keys: RwLock<HashMap<String, FactoryKey>>,
    call_timeout: Duration,
}

impl DatabaseGateway {
    /// Starts unavailable with an empty factory key table; see
    /// [`DatabaseGateway::load_factory_keys`].
    pub fn new(remote: Arc<dyn CentralDatabase>, cache: Arc<CacheGateway>, call_timeout: Duration) -> Self {
        Self {
            remote,
            cache,
            available: AtomicBool::new(false),
            factory_keys: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Fills the in-memory factory key table from the cache.
    pub async fn load_factory_keys(&self) {
        match self.cache.factory_keys().await {
            Ok(keys) => {
                info!(count = keys.len(), "factory keys loaded from cache");
                self.factory_keys.write().extend(keys);
            }
            Err(e) => error!("cannot load factory keys from cache: {}", e),
        }
    }

    /// Memory first, then the cache.
    async fn known_factory_key(&self, ident: &str) -> Option<FactoryKey> {
        let cached = self.factory_keys.read().get(ident).cloned();
        if cached.is_some() {
            return cached;
        }
        match self.cache.factory_key(ident).await {
            Ok(Some(key)) => {
                self.factory_keys.write().insert(ident.to_string(), key.clone());
                Some(key)
            }
            Ok(None) => None,
            Err(e) => {
                error!(ident, "cannot read cached factory key: {}", e);
                None
            }
        }
    }

    fn mark_unavailable(&self, what: &str, e: &DatabaseError) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(call = what, "central database unavailable: {}", e);
            observability::set_health(HealthState::DEGRADED);
        } else {
            debug!(call = what, "central database still unavailable: {}", e);
        }
    }

    /// Runs one remote call. `None` when unavailable, failed or timed out.
    async fn call<T, F>(&self, what: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        if !self.is_available() {
            return None;
        }
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.mark_unavailable(what, &e);
                None
            }
            Err(_) => {
                self.mark_unavailable(what, &DatabaseError::Timeout);
                None
            }
        }
    }

    /// Probes the central database and, on success, refreshes the mirrored
    /// signatures and factory keys.
    pub async fn reconnect(&self) -> bool {
        let probe = tokio::time::timeout(self.call_timeout, self.remote.ping()).await;
        match probe {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_unavailable("ping", &e);
                return false;
            }
            Err(_) => {
                self.mark_unavailable("ping", &DatabaseError::Timeout);
                return false;
            }
        }

        if !self.available.swap(true, Ordering::AcqRel) {
            info!("central database available");
        }
        observability::set_health(HealthState::OK);

        for kind in SignatureKind::ALL {
            if let Err(e) = self.signature(kind).await {
                warn!(kind = kind.as_str(), "signature refresh failed: {}", e);
            }
        }
        if let Some(keys) = self.call("factory_keys", self.remote.factory_keys()).await {
            if let Err(e) = self.cache.replace_factory_keys(&keys).await {
                error!("cannot cache factory keys: {}", e);
            }
            info!(count = keys.len(), "factory keys refreshed");
            *self.factory_keys.write() = keys;
        }
        self.is_available()
    }

    /// Remote value if reachable (mirrored into the cache), else the last
    /// cached one. Never cached and unreachable is a hard failure.
    pub async fn signature(&self, kind: SignatureKind) -> RelayResult<String> {
        if let Some(value) = self.call("signature", self.remote.signature(kind)).await {
            if let Err(e) = self.cache.set_signature(kind, &value).await {
                error!(kind = kind.as_str(), "cannot cache signature: {}", e);
            }
            return Ok(value);
        }
        match self.cache.signature(kind).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(RelayError::MissingKeyMaterial(format!("{} signature", kind.as_str()))),
            Err(e) => {
                error!(kind = kind.as_str(), "cannot read cached signature: {}", e);
                Err(RelayError::MissingKeyMaterial(format!("{} signature", kind.as_str())))
            }
        }
    }

    /// AES key derived from the global agent signature.
    pub async fn agent_signature_key(&self) -> RelayResult<Key> {
        let signature = self.signature(SignatureKind::Agent).await?;
        Ok(crypto::derive_key(&[signature.as_bytes()]))
    }

    pub async fn factory_key_of(&self, ident: &str) -> RelayResult<FactoryKey> {
        if let Some(key) = self.known_factory_key(ident).await {
            return Ok(key);
        }
        debug!(ident, "factory key miss, asking central database");
        match self.call("factory_key", self.remote.factory_key(ident)).await.flatten() {
            Some(key) => {
                if let Err(e) = self.cache.put_factory_key(ident, &key).await {
                    error!(ident, "cannot cache factory key: {}", e);
                }
                self.factory_keys.write().insert(ident.to_string(), key.clone());
                Ok(key)
            }
            None => Err(RelayError::MissingKeyMaterial(format!("factory key {ident}"))),
        }
    }

    /// While the database is gone every known build is treated as active so
    /// agents keep syncing; the real status is resolved on transfer.
    pub async fn agent_status(&self, identity: &AgentIdentity) -> StatusReply {
        if let Some(reply) = self.call("agent_status", self.remote.agent_status(identity)).await {
            return reply;
        }
        let good = self
            .known_factory_key(&identity.ident)
            .await
            .map(|k| k.good)
            .unwrap_or(false);
        StatusReply {
            status: AgentStatus::Active,
            agent_id: None,
            good,
        }
    }

    /// Status straight from the central database, `None` if unreachable.
    pub async fn remote_agent_status(&self, identity: &AgentIdentity) -> Option<StatusReply> {
        self.call("agent_status", self.remote.agent_status(identity)).await
    }

    pub async fn agent_uninstall(&self, agent_id: &str) {
        self.call("agent_uninstall", self.remote.agent_uninstall(agent_id)).await;
    }

    pub async fn sync_start(&self, info: &SyncInfo) {
        self.call("sync_start", self.remote.sync_start(info)).await;
    }

    pub async fn sync_update(&self, info: &SyncInfo) {
        self.call("sync_update", self.remote.sync_update(info)).await;
    }

    pub async fn sync_timeout(&self, info: &SyncInfo) {
        self.call("sync_timeout", self.remote.sync_timeout(info)).await;
    }

    pub async fn sync_end(&self, info: &SyncInfo) {
        self.call("sync_end", self.remote.sync_end(info)).await;
    }

    pub async fn send_evidence(&self, instance: &str, blob: &[u8]) -> Option<SubmitOutcome> {
        self.call("send_evidence", self.remote.send_evidence(instance, blob)).await
    }

    /// Cached items win over a remote fetch, so stale-but-safe work is served
    /// without touching the network.
    pub async fn has_new(&self, category: QueueCategory, agent_id: &str) -> bool {
        match self.cache.queue_count(category, agent_id).await {
            Ok(count) if count > 0 => return true,
            Ok(_) => {}
            Err(e) => error!(category = category.as_str(), agent_id, "cache count failed: {}", e),
        }

        let Some(items) = self.call("fetch_queue", self.remote.fetch_queue(category, agent_id)).await else {
            return false;
        };
        if items.is_empty() {
            return false;
        }
        match self.cache.store_queue(category, agent_id, &items).await {
            Ok(stored) => stored > 0,
            Err(e) => {
                error!(category = category.as_str(), agent_id, "cannot cache queue: {}", e);
                false
            }
        }
    }

    /// Pops the lowest id for the agent and acknowledges it remotely. A local
    /// store failure is a miss: nothing is handed out or acknowledged.
    pub async fn take_one(&self, category: QueueCategory, agent_id: &str) -> Option<Taken> {
        let item = match self.cache.queue_first(category, agent_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return None,
            Err(e) => {
                error!(category = category.as_str(), agent_id, "cache read failed: {}", e);
                return None;
            }
        };
        match self.cache.queue_delete(category, agent_id, &item.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(category = category.as_str(), agent_id, item = %item.id, "queue item vanished");
                return None;
            }
            Err(e) => {
                error!(category = category.as_str(), agent_id, "cache delete failed: {}", e);
                return None;
            }
        }
        // the remote copy is still there, so the item comes back on the next fetch
        let remaining = match self.cache.queue_count(category, agent_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                error!(category = category.as_str(), agent_id, "cache count failed: {}", e);
                return None;
            }
        };

        if category.defers_remote_delete() {
            if remaining == 0 {
                self.call("purge_queue", self.remote.purge_queue(category, agent_id)).await;
            }
        } else {
            self.call(
                "delete_queue_item",
                self.remote.delete_queue_item(category, agent_id, &item.id),
            )
            .await;
        }

        debug!(category = category.as_str(), agent_id, item = %item.id, remaining, "queue item taken");
        Some(Taken { item, remaining })
    }

    /// Every item currently queued, in id order.
    pub async fn take_all(&self, category: QueueCategory, agent_id: &str) -> Vec<QueuedItem> {
        let mut items = Vec::new();
        while let Some(taken) = self.take_one(category, agent_id).await {
            items.push(taken.item);
            if taken.remaining == 0 {
                break;
            }
        }
        items
    }
}
