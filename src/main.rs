use std::path::PathBuf;
use std::sync::Arc;

use agent_relay::core::observability::{self, HealthState};
use agent_relay::logging;
use agent_relay::types::SignatureKind;
use agent_relay::{Relay, RelayConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.json"));
    let config = RelayConfig::from_file(&path)?;
    logging::init(config.log_level);
    info!(config = %path.display(), "agent relay starting");

    let relay = Arc::new(Relay::open(config)?);
    if !relay.connect().await {
        warn!("central database unreachable, serving from cache");
    }
    if relay.database().signature(SignatureKind::Agent).await.is_err() {
        error!("no agent signature cached yet, handshakes will be dropped until the database answers");
        observability::set_health(HealthState::FAULTED);
    }
    match relay.evidence().pending_instances().await {
        Ok(pending) if !pending.is_empty() => info!(instances = pending.len(), "evidence waiting for transfer"),
        Ok(_) => {}
        Err(e) => warn!("cannot read evidence store: {}", e),
    }

    let (shutdown, rx) = watch::channel(false);
    let tasks = relay.spawn_background(rx);
    info!("relay running");

    tokio::signal::ctrl_c().await?;
    info!(sessions = relay.sessions().length(), "shutting down");
    for session in relay.sessions().all() {
        info!(instance = %session.identity.instance, peer = %session.peer, "session dropped at shutdown");
    }
    let _ = shutdown.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task ended badly: {}", e);
        }
    }

    let stats = observability::snapshot();
    info!(
        auth_attempts = stats.auth_attempts,
        auth_accepted = stats.auth_accepted,
        evidence_stored = stats.evidence_stored,
        evidence_transferred = stats.evidence_transferred,
        "relay stopped"
    );
    if observability::OBS_DEV {
        info!(
            stored = ?stats.evidence_stored_coarse,
            transferred = ?stats.evidence_transferred_coarse,
            "evidence size buckets (log2)"
        );
    }
    Ok(())
}
