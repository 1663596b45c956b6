//! Evidence transfer to the central database.
//!
//! The supervisor polls the local evidence store and starts one worker per
//! instance with pending evidence. An instance is never drained by two
//! workers at once: its slot in the in-flight set is taken before the worker
//! is spawned and given back by a guard when the worker ends, however it ends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::observability;
use crate::database::DatabaseGateway;
use crate::error::RelayResult;
use crate::evidence::{EvidenceStore, InstanceInfo, SyncStatus};
use crate::types::{Identification, SubmitOutcome, SyncInfo, SyncStats};

pub struct TransferSupervisor {
    db: Arc<DatabaseGateway>,
    evidence: Arc<EvidenceStore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl TransferSupervisor {
    pub fn new(db: Arc<DatabaseGateway>, evidence: Arc<EvidenceStore>) -> Self {
        Self {
            db,
            evidence,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// One supervisor pass. Returns the workers it started.
    pub async fn poll_once(&self) -> Vec<JoinHandle<()>> {
        if !self.db.is_available() {
            return Vec::new();
        }
        let instances = match self.evidence.pending_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                error!("cannot list pending evidence: {}", e);
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for instance in instances {
            if !self.in_flight.lock().insert(instance.clone()) {
                debug!(instance = %instance, "transfer already running");
                continue;
            }

            let worker = Worker {
                db: self.db.clone(),
                evidence: self.evidence.clone(),
                instance: instance.clone(),
            };
            let in_flight = self.in_flight.clone();
            started.push(tokio::spawn(async move {
                let _slot = scopeguard::guard(instance, move |instance| {
                    in_flight.lock().remove(&instance);
                });
                worker.run().await;
            }));
        }
        started
    }

    pub async fn run(self: Arc<Self>, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    debug!("transfer supervisor stopping");
                    return;
                }
            }
        }
    }
}

struct Worker {
    db: Arc<DatabaseGateway>,
    evidence: Arc<EvidenceStore>,
    instance: String,
}

impl Worker {
    async fn run(&self) {
        if let Err(e) = self.transfer().await {
            error!(instance = %self.instance, "evidence transfer failed: {}", e);
        }
    }

    async fn transfer(&self) -> RelayResult<()> {
        if !self.db.is_available() {
            return Ok(());
        }
        let Some(info) = self.evidence.instance(&self.instance).await? else {
            warn!(instance = %self.instance, "evidence for an unregistered instance, waiting");
            return Ok(());
        };
        let Some(status) = self.db.remote_agent_status(&info.identity).await else {
            return Ok(());
        };

        if status.status.is_terminal() {
            let removed = self.evidence.purge(&self.instance).await?;
            info!(instance = %self.instance, status = ?status.status, removed, "agent gone, evidence dropped");
            return Ok(());
        }
        if status.agent_id.is_none() {
            debug!(instance = %self.instance, status = ?status.status, "agent not resolvable yet");
            return Ok(());
        }
        if status.agent_id != info.agent_id {
            if let Some(agent_id) = &status.agent_id {
                self.evidence.set_agent_id(&self.instance, agent_id).await?;
            }
        }

        let (total_items, total_bytes) = self.evidence.pending(&self.instance).await?;
        let mut sync = sync_info(&info, status.agent_id.clone());
        sync.stats.total_items = total_items;
        sync.stats.total_bytes = total_bytes;
        self.db.sync_start(&sync).await;
        self.mark(SyncStatus::InProgress).await;

        let mut interrupted = false;
        for id in self.evidence.ids(&self.instance).await? {
            let Some(blob) = self.evidence.get(id).await? else {
                continue;
            };
            match self.db.send_evidence(&self.instance, &blob).await {
                Some(outcome) => {
                    if outcome == SubmitOutcome::Conflict {
                        debug!(instance = %self.instance, id, "evidence conflict, dropping local copy");
                    }
                    self.evidence.delete(id).await?;
                    sync.stats.transferred_items += 1;
                    sync.stats.transferred_bytes += blob.len() as u64;
                    observability::record_evidence_transferred(blob.len());
                }
                None => {
                    warn!(instance = %self.instance, id, "evidence not accepted, retrying next pass");
                    interrupted = true;
                    break;
                }
            }
        }

        sync.stats.ended_at = Some(Utc::now().timestamp());
        if interrupted {
            sync.stats.timed_out = true;
            self.db.sync_timeout(&sync).await;
            self.mark(SyncStatus::Timeout).await;
        } else {
            self.db.sync_end(&sync).await;
            self.mark(SyncStatus::Ended).await;
        }
        info!(
            instance = %self.instance,
            items = sync.stats.transferred_items,
            bytes = sync.stats.transferred_bytes,
            interrupted,
            "transfer pass done"
        );
        Ok(())
    }

    async fn mark(&self, status: SyncStatus) {
        let now = Utc::now().timestamp();
        if let Err(e) = self.evidence.set_sync_status(&self.instance, status, now).await {
            warn!(instance = %self.instance, ?status, "cannot record sync status: {}", e);
        }
    }
}

fn sync_info(info: &InstanceInfo, agent_id: Option<String>) -> SyncInfo {
    let identification = info.user_id.as_ref().map(|user_id| Identification {
        version: 0,
        user_id: user_id.clone(),
        device_id: info.device_id.clone().unwrap_or_default(),
        source_id: info.source_id.clone().unwrap_or_default(),
    });
    let now = Utc::now().timestamp();
    SyncInfo {
        ident: info.identity.ident.clone(),
        instance: info.identity.instance.clone(),
        platform: info.identity.platform,
        demo: info.identity.demo,
        level: info.identity.level,
        agent_id,
        peer: info.peer.clone(),
        sync_time: info.sync_time.unwrap_or(now),
        identification,
        stats: SyncStats {
            started_at: Some(now),
            ..SyncStats::default()
        },
    }
}
