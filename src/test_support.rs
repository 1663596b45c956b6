//! Shared fixtures: an in-memory central database, a fully wired relay and
//! an agent that speaks both handshake variants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::auth::{AuthSettings, Authenticator};
use crate::cache::CacheGateway;
use crate::commands::{CommandDispatcher, Opcode};
use crate::crypto::{self, Key, Padding};
use crate::database::{CentralDatabase, DatabaseGateway};
use crate::error::DatabaseError;
use crate::evidence::EvidenceStore;
use crate::session::SessionManager;
use crate::transfer::TransferSupervisor;
use crate::types::{
    AgentIdentity, AgentLevel, AgentStatus, FactoryKey, Payload, Platform, QueueCategory, QueuedItem,
    SignatureKind, StatusReply, SubmitOutcome, SyncInfo, SCOUT_PLATFORMS,
};

pub const IDENT: &str = "RLY_0000000042";
/// Build field as an elite agent sends it, before the relay prefix.
pub const ELITE_WIRE_BUILD: &str = "BLD_0000000042";
pub const FACTORY_KEY: &str = "4c1a9e0f3b7d2c68a5e1f09b7d3c2a14";
pub const AGENT_SIGNATURE: &str = "e7f02b9c41d86a35";
pub const AGENT_ID: &str = "agent-42";
pub const INSTANCE: [u8; 20] = [0x42; 20];

pub fn identity() -> AgentIdentity {
    TestAgent::new().identity(AgentLevel::Elite, false)
}

pub fn file_item(id: &str) -> QueuedItem {
    QueuedItem {
        id: id.to_string(),
        payload: Payload::File {
            filename: format!("file-{id}"),
            content: format!("content-{id}").into_bytes(),
        },
    }
}

fn field<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = text.len().min(N);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
    out
}

pub struct MockDatabase {
    reachable: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
    signatures: Mutex<HashMap<SignatureKind, String>>,
    factory_keys: Mutex<HashMap<String, FactoryKey>>,
    status: Mutex<AgentStatus>,
    good: AtomicBool,
    queues: Mutex<HashMap<(QueueCategory, String), Vec<QueuedItem>>>,
    deleted: Mutex<Vec<String>>,
    purged: Mutex<Vec<String>>,
    uninstalled: Mutex<Vec<String>>,
    received: Mutex<Vec<Vec<u8>>>,
    fail_next_evidence: AtomicBool,
    panic_on_evidence: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    evidence_running: AtomicUsize,
    evidence_peak: AtomicUsize,
}

impl MockDatabase {
    pub fn new() -> Self {
        let signatures = SignatureKind::ALL
            .iter()
            .map(|kind| {
                let value = match kind {
                    SignatureKind::Agent => AGENT_SIGNATURE.to_string(),
                    other => format!("{}-signature", other.as_str()),
                };
                (*kind, value)
            })
            .collect();
        let mut factory_keys = HashMap::new();
        factory_keys.insert(
            IDENT.to_string(),
            FactoryKey {
                key: FACTORY_KEY.to_string(),
                good: true,
            },
        );

        Self {
            reachable: AtomicBool::new(true),
            calls: Mutex::new(HashMap::new()),
            signatures: Mutex::new(signatures),
            factory_keys: Mutex::new(factory_keys),
            status: Mutex::new(AgentStatus::Active),
            good: AtomicBool::new(true),
            queues: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            purged: Mutex::new(Vec::new()),
            uninstalled: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            fail_next_evidence: AtomicBool::new(false),
            panic_on_evidence: AtomicBool::new(false),
            gate: Mutex::new(None),
            evidence_running: AtomicUsize::new(0),
            evidence_peak: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_signature(&self, kind: SignatureKind, value: &str) {
        self.signatures.lock().insert(kind, value.to_string());
    }

    pub fn set_factory_key(&self, ident: &str, key: FactoryKey) {
        self.factory_keys.lock().insert(ident.to_string(), key);
    }

    pub fn set_status(&self, status: AgentStatus) {
        *self.status.lock() = status;
    }

    pub fn set_good(&self, good: bool) {
        self.good.store(good, Ordering::SeqCst);
    }

    /// Replaces the remote queue of the agent.
    pub fn queue(&self, category: QueueCategory, agent_id: &str, items: Vec<QueuedItem>) {
        self.queues.lock().insert((category, agent_id.to_string()), items);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// `category/agent/item` per acknowledged item.
    pub fn deleted_items(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// `category/agent` per purged queue.
    pub fn purged_queues(&self) -> Vec<String> {
        self.purged.lock().clone()
    }

    pub fn uninstalled(&self) -> Vec<String> {
        self.uninstalled.lock().clone()
    }

    pub fn evidence_received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn fail_evidence_once(&self) {
        self.fail_next_evidence.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_evidence(&self) {
        self.panic_on_evidence.store(true, Ordering::SeqCst);
    }

    /// Blocks every `send_evidence` until [`MockDatabase::release_evidence`].
    pub fn hold_evidence(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_evidence(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    pub fn max_concurrent_evidence(&self) -> usize {
        self.evidence_peak.load(Ordering::SeqCst)
    }

    fn enter(&self, method: &'static str) -> Result<(), DatabaseError> {
        *self.calls.lock().entry(method).or_insert(0) += 1;
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DatabaseError::Unreachable("mock offline".into()))
        }
    }
}

#[async_trait]
impl CentralDatabase for MockDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        self.enter("ping")
    }

    async fn signature(&self, kind: SignatureKind) -> Result<String, DatabaseError> {
        self.enter("signature")?;
        self.signatures
            .lock()
            .get(&kind)
            .cloned()
            .ok_or_else(|| DatabaseError::Rejected(format!("no {} signature", kind.as_str())))
    }

    async fn factory_key(&self, ident: &str) -> Result<Option<FactoryKey>, DatabaseError> {
        self.enter("factory_key")?;
        Ok(self.factory_keys.lock().get(ident).cloned())
    }

    async fn factory_keys(&self) -> Result<HashMap<String, FactoryKey>, DatabaseError> {
        self.enter("factory_keys")?;
        Ok(self.factory_keys.lock().clone())
    }

    async fn agent_status(&self, _identity: &AgentIdentity) -> Result<StatusReply, DatabaseError> {
        self.enter("agent_status")?;
        let status = *self.status.lock();
        Ok(StatusReply {
            status,
            agent_id: (status != AgentStatus::Unknown).then(|| AGENT_ID.to_string()),
            good: self.good.load(Ordering::SeqCst),
        })
    }

    async fn agent_uninstall(&self, agent_id: &str) -> Result<(), DatabaseError> {
        self.enter("agent_uninstall")?;
        self.uninstalled.lock().push(agent_id.to_string());
        Ok(())
    }

    async fn sync_start(&self, _info: &SyncInfo) -> Result<(), DatabaseError> {
        self.enter("sync_start")
    }

    async fn sync_update(&self, _info: &SyncInfo) -> Result<(), DatabaseError> {
        self.enter("sync_update")
    }

    async fn sync_timeout(&self, _info: &SyncInfo) -> Result<(), DatabaseError> {
        self.enter("sync_timeout")
    }

    async fn sync_end(&self, _info: &SyncInfo) -> Result<(), DatabaseError> {
        self.enter("sync_end")
    }

    async fn send_evidence(&self, _instance: &str, blob: &[u8]) -> Result<SubmitOutcome, DatabaseError> {
        self.enter("send_evidence")?;
        if self.panic_on_evidence.load(Ordering::SeqCst) {
            panic!("send_evidence exploded");
        }

        let running = self.evidence_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.evidence_peak.fetch_max(running, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            // closed on release
            let _ = gate.acquire().await;
        }
        self.evidence_running.fetch_sub(1, Ordering::SeqCst);

        if self.fail_next_evidence.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Unreachable("connection reset".into()));
        }
        if blob.is_empty() {
            return Ok(SubmitOutcome::Conflict);
        }
        self.received.lock().push(blob.to_vec());
        Ok(SubmitOutcome::Accepted)
    }

    async fn fetch_queue(&self, category: QueueCategory, agent_id: &str) -> Result<Vec<QueuedItem>, DatabaseError> {
        self.enter("fetch_queue")?;
        Ok(self
            .queues
            .lock()
            .get(&(category, agent_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_queue_item(
        &self,
        category: QueueCategory,
        agent_id: &str,
        item_id: &str,
    ) -> Result<(), DatabaseError> {
        self.enter("delete_queue_item")?;
        if let Some(items) = self.queues.lock().get_mut(&(category, agent_id.to_string())) {
            items.retain(|item| item.id != item_id);
        }
        self.deleted
            .lock()
            .push(format!("{}/{}/{}", category.as_str(), agent_id, item_id));
        Ok(())
    }

    async fn purge_queue(&self, category: QueueCategory, agent_id: &str) -> Result<(), DatabaseError> {
        self.enter("purge_queue")?;
        self.queues.lock().remove(&(category, agent_id.to_string()));
        self.purged.lock().push(format!("{}/{}", category.as_str(), agent_id));
        Ok(())
    }
}

/// Every relay service wired to one [`MockDatabase`].
pub struct TestRelay {
    pub mock: Arc<MockDatabase>,
    pub db: Arc<DatabaseGateway>,
    pub evidence: Arc<EvidenceStore>,
    pub sessions: Arc<SessionManager>,
    pub auth: Authenticator,
    pub dispatcher: CommandDispatcher,
    pub transfer: Arc<TransferSupervisor>,
}

impl TestRelay {
    pub async fn connected() -> Self {
        let mock = Arc::new(MockDatabase::new());
        let cache = Arc::new(CacheGateway::in_memory().unwrap());
        let db = Arc::new(DatabaseGateway::new(mock.clone(), cache, Duration::from_secs(2)));
        assert!(db.reconnect().await);

        let evidence = Arc::new(EvidenceStore::in_memory().unwrap());
        let sessions = Arc::new(SessionManager::new(db.clone(), evidence.clone()));
        let auth = Authenticator::new(
            db.clone(),
            sessions.clone(),
            evidence.clone(),
            AuthSettings {
                build_prefix: *b"RLY_",
                relay_version_floor: Some(10),
            },
        );
        let dispatcher = CommandDispatcher::new(db.clone(), sessions.clone(), evidence.clone());
        let transfer = Arc::new(TransferSupervisor::new(db.clone(), evidence.clone()));

        Self {
            mock,
            db,
            evidence,
            sessions,
            auth,
            dispatcher,
            transfer,
        }
    }

    /// A registered session for [`identity`] bound to [`AGENT_ID`].
    pub async fn session(&self) -> (String, Key) {
        let key = crypto::random_key();
        let id = identity();
        self.evidence.register(&id, Some(AGENT_ID), "peer").await.unwrap();
        let cookie = self.sessions.create(id, Some(AGENT_ID.to_string()), key, "peer");
        (cookie, key)
    }

    pub fn command(key: &Key, opcode: Opcode, body: &[u8]) -> Vec<u8> {
        let mut plain = opcode.code().to_le_bytes().to_vec();
        plain.extend_from_slice(body);
        crypto::encrypt_integrity(&plain, key)
    }

    pub fn open(key: &Key, reply: &[u8]) -> Vec<u8> {
        crypto::decrypt_integrity(crypto::normalize(reply), key, Padding::Pkcs7).unwrap()
    }

    /// Sends one command and returns the decrypted reply.
    pub async fn send(&self, cookie: &str, key: &Key, opcode: Opcode, body: &[u8]) -> Option<Vec<u8>> {
        let frame = Self::command(key, opcode, body);
        let reply = self.dispatcher.dispatch(cookie, "peer", &frame).await?;
        Some(Self::open(key, &reply))
    }
}

/// Client half of the elite handshake, kept to open the reply.
pub struct EliteHello {
    pub kd: Key,
    pub nonce: [u8; 16],
}

/// The agent side of the handshake.
pub struct TestAgent {
    pub factory_key: String,
    pub signature: String,
    pub instance: [u8; 20],
    pub platform: Platform,
}

impl TestAgent {
    pub fn new() -> Self {
        Self {
            factory_key: FACTORY_KEY.to_string(),
            signature: AGENT_SIGNATURE.to_string(),
            instance: INSTANCE,
            platform: Platform::Windows,
        }
    }

    pub fn identity(&self, level: AgentLevel, demo: bool) -> AgentIdentity {
        AgentIdentity {
            ident: IDENT.to_string(),
            instance: hex::encode(self.instance),
            platform: self.platform,
            demo,
            level,
        }
    }

    fn signature_key(&self) -> Key {
        crypto::derive_key(&[self.signature.as_bytes()])
    }

    pub fn elite_request(&self, pad: bool) -> (Vec<u8>, EliteHello) {
        let hello = EliteHello {
            kd: crypto::random_key(),
            nonce: crypto::random_key(),
        };
        let build: [u8; 16] = field(ELITE_WIRE_BUILD);
        let platform: [u8; 16] = field(self.platform.name());
        let digest = crypto::sha1(&[&build, &self.instance, &platform, self.factory_key.as_bytes()]);

        let mut plain = Vec::with_capacity(112);
        plain.extend_from_slice(&hello.kd);
        plain.extend_from_slice(&hello.nonce);
        plain.extend_from_slice(&build);
        plain.extend_from_slice(&self.instance);
        plain.extend_from_slice(&platform);
        plain.extend_from_slice(&digest);
        plain.extend_from_slice(&[0x08; 8]);

        let mut content = crypto::encrypt(&plain, &self.signature_key(), Padding::None).unwrap();
        if pad {
            content.extend(crypto::random_pad());
        }
        (content, hello)
    }

    /// `(opcode, session key)` if the reply is well formed.
    pub fn open_elite_reply(&self, body: &[u8], hello: &EliteHello) -> Option<(u32, Key)> {
        let body = crypto::normalize(body);
        if body.len() < 64 {
            return None;
        }
        let ks = crypto::decrypt(&body[..32], &self.signature_key(), Padding::Pkcs7).ok()?;
        let key = crypto::derive_key(&[self.factory_key.as_bytes(), &ks, &hello.kd]);
        let answer = crypto::decrypt(&body[32..], &key, Padding::Pkcs7).ok()?;
        if answer.len() != 20 || answer[..16] != hello.nonce {
            return None;
        }
        Some((u32::from_le_bytes([answer[16], answer[17], answer[18], answer[19]]), key))
    }

    pub fn scout_request(&self) -> (Vec<u8>, Key) {
        let kd = crypto::random_key();
        (self.seal_scout(&self.scout_fields(&kd)), kd)
    }

    /// The 80 plaintext bytes of a scout request.
    pub fn scout_fields(&self, kd: &Key) -> Vec<u8> {
        let build: [u8; 16] = field(IDENT);
        let index = SCOUT_PLATFORMS
            .iter()
            .position(|p| *p == self.platform)
            .unwrap_or(0) as u8;

        let mut plain = Vec::with_capacity(80);
        plain.extend_from_slice(&1u32.to_le_bytes());
        plain.extend_from_slice(kd);
        plain.extend_from_slice(&crypto::sha1(&[self.factory_key.as_bytes(), kd]));
        plain.extend_from_slice(&build);
        plain.extend_from_slice(&self.instance);
        plain.extend_from_slice(&[index, 0, 0, 0]);
        plain
    }

    /// Encrypts, pads and base64-encodes a scout plaintext.
    pub fn seal_scout(&self, plain: &[u8]) -> Vec<u8> {
        let mut sealed = crypto::encrypt(plain, &self.signature_key(), Padding::Pkcs7).unwrap();
        sealed.extend(crypto::random_pad());
        STANDARD.encode(sealed).into_bytes()
    }

    pub fn open_scout_reply(&self, body: &[u8], kd: &Key) -> Option<(u32, Key)> {
        let decoded = STANDARD.decode(body).ok()?;
        let body = crypto::normalize(&decoded);
        if body.len() < 64 {
            return None;
        }
        let ks = crypto::decrypt(&body[..32], &self.signature_key(), Padding::Pkcs7).ok()?;
        let key = crypto::derive_key(&[self.factory_key.as_bytes(), &ks, kd]);
        let answer = crypto::decrypt(&body[32..], &key, Padding::Pkcs7).ok()?;
        if answer.len() != 24 || answer[..20] != crypto::sha1(&[&key, &ks]) {
            return None;
        }
        Some((u32::from_le_bytes([answer[20], answer[21], answer[22], answer[23]]), key))
    }
}
