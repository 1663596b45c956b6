#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    OBS_NONE,
    OBS_SAFE,
    OBS_DEV,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    OK,
    DEGRADED,
    FAULTED,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;

#[cfg(feature = "obs_dev")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;

#[cfg(all(not(feature = "obs_none"), not(feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

pub const OBS_NONE: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE);
pub const OBS_DEV: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_DEV);

use std::sync::atomic::{AtomicU64, Ordering};

static HEALTH_STATE: AtomicU64 = AtomicU64::new(HealthState::DEGRADED as u64);

#[inline]
pub fn set_health(state: HealthState) {
    HEALTH_STATE.store(state as u64, Ordering::Relaxed);
}

#[inline]
pub fn get_health() -> HealthState {
    match HEALTH_STATE.load(Ordering::Relaxed) {
        x if x == HealthState::OK as u64 => HealthState::OK,
        x if x == HealthState::DEGRADED as u64 => HealthState::DEGRADED,
        _ => HealthState::FAULTED,
    }
}

static AUTH_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static AUTH_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static AUTH_DROPPED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static EVIDENCE_STORED: AtomicU64 = AtomicU64::new(0);
static EVIDENCE_TRANSFERRED: AtomicU64 = AtomicU64::new(0);

const BYTE_BUCKETS: usize = 21;
static EVIDENCE_STORED_COARSE: [AtomicU64; BYTE_BUCKETS] = [const { AtomicU64::new(0) }; BYTE_BUCKETS];
static EVIDENCE_TRANSFERRED_COARSE: [AtomicU64; BYTE_BUCKETS] = [const { AtomicU64::new(0) }; BYTE_BUCKETS];

#[inline]
fn bump(counter: &AtomicU64) {
    if !OBS_NONE {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_auth_attempt() {
    bump(&AUTH_ATTEMPTS);
}

#[inline]
pub fn record_auth_accepted() {
    bump(&AUTH_ACCEPTED);
}

#[inline]
pub fn record_auth_dropped() {
    bump(&AUTH_DROPPED);
}

#[inline]
pub fn record_command() {
    bump(&COMMANDS_RECEIVED);
}

/// Size buckets are only kept at the dev level.
#[inline]
fn bump_size(buckets: &[AtomicU64; BYTE_BUCKETS], byte_len: usize) {
    if OBS_DEV {
        bump(&buckets[coarse_bucket_index(byte_len)]);
    }
}

#[inline]
pub fn record_evidence_stored(byte_len: usize) {
    bump(&EVIDENCE_STORED);
    bump_size(&EVIDENCE_STORED_COARSE, byte_len);
}

#[inline]
pub fn record_evidence_transferred(byte_len: usize) {
    bump(&EVIDENCE_TRANSFERRED);
    bump_size(&EVIDENCE_TRANSFERRED_COARSE, byte_len);
}

/// log2 bucket of a size; sizes themselves are never kept.
#[inline]
const fn coarse_bucket_index(byte_len: usize) -> usize {
    if byte_len == 0 {
        return 0;
    }
    let mut v = byte_len;
    let mut idx: usize = 0;
    while v > 1 && idx + 1 < BYTE_BUCKETS {
        v >>= 1;
        idx += 1;
    }
    idx
}

#[derive(Debug, Clone)]
pub struct ObservabilitySnapshot {
    pub health: HealthState,
    pub auth_attempts: u64,
    pub auth_accepted: u64,
    pub auth_dropped: u64,
    pub commands_received: u64,
    pub evidence_stored: u64,
    pub evidence_transferred: u64,
    pub evidence_stored_coarse: [u64; BYTE_BUCKETS],
    pub evidence_transferred_coarse: [u64; BYTE_BUCKETS],
}

fn load_buckets(buckets: &[AtomicU64; BYTE_BUCKETS]) -> [u64; BYTE_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        health: get_health(),
        auth_attempts: AUTH_ATTEMPTS.load(Ordering::Relaxed),
        auth_accepted: AUTH_ACCEPTED.load(Ordering::Relaxed),
        auth_dropped: AUTH_DROPPED.load(Ordering::Relaxed),
        commands_received: COMMANDS_RECEIVED.load(Ordering::Relaxed),
        evidence_stored: EVIDENCE_STORED.load(Ordering::Relaxed),
        evidence_transferred: EVIDENCE_TRANSFERRED.load(Ordering::Relaxed),
        evidence_stored_coarse: load_buckets(&EVIDENCE_STORED_COARSE),
        evidence_transferred_coarse: load_buckets(&EVIDENCE_TRANSFERRED_COARSE),
    }
}
