//! Agent handshake.
//!
//! Two wire generations share one flow: decrypt with the agent signature,
//! read the fixed fields, check the identity digest against the build's
//! factory key, derive the session key from both random halves, ask the
//! central database for the agent status and answer with an encrypted
//! opcode. Anything that does not check out is dropped without a reply.
//!
//! Elite frame (after decryption, 104 bytes used):
//!
//! ```text
//! Kd(16) | Nonce(16) | BuildId(16) | InstanceId(20) | Platform(16) | SHA1(20)
//! ```
//!
//! Scout frame (base64 on the wire, 80 bytes after decryption):
//!
//! ```text
//! Version(4) | Kd(16) | SHA1(20) | BuildId(16) | InstanceId(20) |
//! Platform(1) | Demo(1) | Level(1) | Flags(1)
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::commands::Opcode;
use crate::core::observability;
use crate::crypto::{self, CryptoError, Key, Padding};
use crate::database::DatabaseGateway;
use crate::error::RelayError;
use crate::evidence::EvidenceStore;
use crate::frame::{trim_nul, FrameError, FrameReader};
use crate::session::SessionManager;
use crate::types::{AgentIdentity, AgentLevel, AgentStatus, Platform, StatusReply};

/// Requests longer than this are scout frames.
pub const SCOUT_THRESHOLD: usize = 128;
pub const ELITE_FIELDS: usize = 104;
/// Elite fields plus the client's own padding, in whole blocks.
pub const ELITE_FRAME: usize = 112;
pub const SCOUT_FIELDS: usize = 80;
pub const SCOUT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unexpected frame length {0}")]
    Length(usize),

    #[error("unsupported scout version {0}")]
    Version(u32),

    #[error("unknown platform")]
    Platform,

    #[error("unknown agent level {0}")]
    Level(u8),

    #[error("identity digest mismatch")]
    Digest,

    #[error("trust flag does not match relay version")]
    Trust,

    #[error("invalid base64 envelope")]
    Envelope,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    KeyMaterial(#[from] RelayError),
}

#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub content: &'a [u8],
    pub peer: &'a str,
    /// Version announced by the forwarding relay, if any.
    pub relay_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub body: Vec<u8>,
    pub cookie: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub build_prefix: [u8; 4],
    /// `None` disables the relay trust check.
    pub relay_version_floor: Option<u64>,
}

/// Everything both variants extract before the status check.
struct Claim {
    identity: AgentIdentity,
    kd: Key,
    factory_key: String,
}

pub struct Authenticator {
    db: Arc<DatabaseGateway>,
    sessions: Arc<SessionManager>,
    evidence: Arc<EvidenceStore>,
    settings: AuthSettings,
}

impl Authenticator {
    pub fn new(
        db: Arc<DatabaseGateway>,
        sessions: Arc<SessionManager>,
        evidence: Arc<EvidenceStore>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            db,
            sessions,
            evidence,
            settings,
        }
    }

    /// Never fails: a request that does not authenticate gets no reply.
    pub async fn authenticate(&self, request: AuthRequest<'_>) -> Option<AuthReply> {
        observability::record_auth_attempt();
        let result = if request.content.len() > SCOUT_THRESHOLD {
            self.scout(&request).await
        } else {
            self.elite(&request).await
        };

        match result {
            Ok(Some(reply)) => {
                if reply.cookie.is_some() {
                    observability::record_auth_accepted();
                }
                Some(reply)
            }
            Ok(None) => {
                observability::record_auth_dropped();
                None
            }
            Err(AuthError::KeyMaterial(e)) => {
                error!(peer = request.peer, "cannot authenticate without key material: {}", e);
                observability::record_auth_dropped();
                None
            }
            Err(e) => {
                debug!(peer = request.peer, "authentication dropped: {}", e);
                observability::record_auth_dropped();
                None
            }
        }
    }

    /// The cookie names a live session. Relays rewrite peers, so a different
    /// address is only worth a note.
    pub fn valid_authentication(&self, peer: &str, cookie: &str) -> bool {
        if !self.sessions.check(cookie) {
            return false;
        }
        if let Some(session) = self.sessions.get(cookie) {
            if session.peer != peer {
                debug!(instance = %session.identity.instance, old = %session.peer, new = peer, "peer changed");
            }
        }
        true
    }

    async fn elite(&self, request: &AuthRequest<'_>) -> Result<Option<AuthReply>, AuthError> {
        let frame = crypto::normalize(request.content);
        if frame.len() != ELITE_FRAME {
            return Err(AuthError::Length(request.content.len()));
        }

        let signature = self.db.agent_signature_key().await?;
        // some agents pad wrongly; the fields never reach the padding
        let plain = crypto::decrypt(frame, &signature, Padding::None)?;

        let mut reader = FrameReader::new(&plain[..ELITE_FIELDS]);
        let kd: Key = reader.array()?;
        let nonce: [u8; 16] = reader.array()?;
        let build: [u8; 16] = reader.array()?;
        let instance: [u8; 20] = reader.array()?;
        let platform_field: [u8; 16] = reader.array()?;
        let digest = reader.bytes(crypto::DIGEST_SIZE)?;

        // the digest covers the build field as sent; lookups use the relay prefix
        let mut prefixed = build;
        prefixed[..4].copy_from_slice(&self.settings.build_prefix);
        let ident = trim_nul(&prefixed);
        let platform = Platform::from_name(&trim_nul(&platform_field)).ok_or(AuthError::Platform)?;
        let factory = self.db.factory_key_of(&ident).await?;

        let expected = crypto::sha1(&[&build, &instance, &platform_field, factory.key.as_bytes()]);
        if !crypto::digest_eq(&expected, digest) {
            return Err(AuthError::Digest);
        }

        let claim = Claim {
            identity: AgentIdentity {
                ident,
                instance: hex::encode(instance),
                platform,
                demo: false,
                level: AgentLevel::Elite,
            },
            kd,
            factory_key: factory.key,
        };

        let ks = crypto::random_key();
        let Some((opcode, key, cookie)) = self.admit(claim, &ks, request).await? else {
            return Ok(None);
        };

        let mut body = crypto::encrypt(&ks, &signature, Padding::Pkcs7)?;
        let mut answer = nonce.to_vec();
        answer.extend_from_slice(&opcode.code().to_le_bytes());
        body.extend(crypto::encrypt(&answer, &key, Padding::Pkcs7)?);
        if crypto::has_trailing_pad(request.content) {
            body.extend(crypto::random_pad());
        }
        Ok(Some(AuthReply { body, cookie }))
    }

    async fn scout(&self, request: &AuthRequest<'_>) -> Result<Option<AuthReply>, AuthError> {
        let decoded = STANDARD.decode(request.content).map_err(|_| AuthError::Envelope)?;
        let frame = crypto::normalize(&decoded);

        let signature = self.db.agent_signature_key().await?;
        let plain = crypto::decrypt(frame, &signature, Padding::Pkcs7)?;
        if plain.len() != SCOUT_FIELDS {
            return Err(AuthError::Length(plain.len()));
        }

        let mut reader = FrameReader::new(&plain);
        let version = reader.u32_le()?;
        if version != SCOUT_VERSION {
            return Err(AuthError::Version(version));
        }
        let kd: Key = reader.array()?;
        let digest = reader.bytes(crypto::DIGEST_SIZE)?;
        let build: [u8; 16] = reader.array()?;
        let instance: [u8; 20] = reader.array()?;
        let platform = Platform::from_index(reader.u8()?).ok_or(AuthError::Platform)?;
        let demo = reader.u8()? != 0;
        let level_byte = reader.u8()?;
        let _flags = reader.u8()?;

        let ident = trim_nul(&build);
        let factory = self.db.factory_key_of(&ident).await?;
        let expected = crypto::sha1(&[factory.key.as_bytes(), &kd]);
        if !crypto::digest_eq(&expected, digest) {
            return Err(AuthError::Digest);
        }
        let level = AgentLevel::from_byte(level_byte).ok_or(AuthError::Level(level_byte))?;

        let claim = Claim {
            identity: AgentIdentity {
                ident,
                instance: hex::encode(instance),
                platform,
                demo,
                level,
            },
            kd,
            factory_key: factory.key,
        };

        let ks = crypto::random_key();
        let Some((opcode, key, cookie)) = self.admit(claim, &ks, request).await? else {
            return Ok(None);
        };

        let mut body = crypto::encrypt(&ks, &signature, Padding::Pkcs7)?;
        let mut answer = crypto::sha1(&[&key, &ks]).to_vec();
        answer.extend_from_slice(&opcode.code().to_le_bytes());
        body.extend(crypto::encrypt(&answer, &key, Padding::Pkcs7)?);
        if crypto::has_trailing_pad(&decoded) {
            body.extend(crypto::random_pad());
        }
        Ok(Some(AuthReply {
            body: STANDARD.encode(body).into_bytes(),
            cookie,
        }))
    }

    /// Status check shared by both variants. `None` drops the connection.
    async fn admit(
        &self,
        claim: Claim,
        ks: &Key,
        request: &AuthRequest<'_>,
    ) -> Result<Option<(Opcode, Key, Option<String>)>, AuthError> {
        let key = crypto::derive_key(&[claim.factory_key.as_bytes(), ks, &claim.kd]);
        let identity = claim.identity;
        let status = self.db.agent_status(&identity).await;

        if status.status == AgentStatus::Unknown {
            info!(ident = %identity.ident, instance = %identity.instance, "unknown agent");
            return Ok(None);
        }
        if !self.trusted(&status, request.relay_version) {
            warn!(
                ident = %identity.ident,
                instance = %identity.instance,
                good = status.good,
                relay_version = ?request.relay_version,
                "trust mismatch, dropping"
            );
            return Err(AuthError::Trust);
        }

        let outcome = match status.status {
            AgentStatus::Active => {
                let agent_id = match status.agent_id.clone() {
                    Some(agent_id) => Some(agent_id),
                    None => self.known_agent_id(&identity).await,
                };
                if let Err(e) = self.evidence.register(&identity, agent_id.as_deref(), request.peer).await {
                    warn!(instance = %identity.instance, "cannot register instance: {}", e);
                }
                let cookie = self.sessions.create(identity, agent_id, key, request.peer);
                (Opcode::Ok, key, Some(cookie))
            }
            AgentStatus::Queued => {
                info!(instance = %identity.instance, "agent queued, denying");
                (Opcode::No, key, None)
            }
            AgentStatus::Deleted | AgentStatus::Closed | AgentStatus::NotFound => {
                info!(instance = %identity.instance, status = ?status.status, "agent is gone, uninstalling");
                if let Some(agent_id) = &status.agent_id {
                    self.db.agent_uninstall(agent_id).await;
                }
                (Opcode::Uninstall, key, None)
            }
            AgentStatus::Unknown => return Ok(None),
        };
        Ok(Some(outcome))
    }

    /// A good agent must come through a recent relay, and a bad one must not.
    fn trusted(&self, status: &StatusReply, relay_version: Option<u64>) -> bool {
        match self.settings.relay_version_floor {
            None => true,
            Some(floor) => status.good == (relay_version.unwrap_or(0) >= floor),
        }
    }

    async fn known_agent_id(&self, identity: &AgentIdentity) -> Option<String> {
        match self.evidence.instance(&identity.instance).await {
            Ok(info) => info.and_then(|i| i.agent_id),
            Err(e) => {
                warn!(instance = %identity.instance, "cannot read instance: {}", e);
                None
            }
        }
    }
}
