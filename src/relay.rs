//! The relay as a whole: services wired together, a bounded request pool and
//! the periodic tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthReply, AuthRequest, Authenticator};
use crate::cache::CacheGateway;
use crate::commands::CommandDispatcher;
use crate::config::RelayConfig;
use crate::database::{CentralDatabase, DatabaseGateway};
use crate::error::RelayResult;
use crate::evidence::EvidenceStore;
use crate::remote::HttpCentralDatabase;
use crate::session::SessionManager;
use crate::transfer::TransferSupervisor;

pub struct Relay {
    config: RelayConfig,
    db: Arc<DatabaseGateway>,
    evidence: Arc<EvidenceStore>,
    sessions: Arc<SessionManager>,
    auth: Authenticator,
    dispatcher: CommandDispatcher,
    transfer: Arc<TransferSupervisor>,
    workers: Semaphore,
}

impl Relay {
    /// Opens the local stores and the HTTP central database from `config`.
    pub fn open(config: RelayConfig) -> RelayResult<Self> {
        let remote = HttpCentralDatabase::new(&config.database.base_url, config.call_timeout())?;
        let cache = CacheGateway::open(&config.cache_path)?;
        let evidence = EvidenceStore::open(&config.evidence_path)?;
        Self::with_parts(config, Arc::new(remote), cache, evidence)
    }

    pub fn with_parts(
        config: RelayConfig,
        remote: Arc<dyn CentralDatabase>,
        cache: CacheGateway,
        evidence: EvidenceStore,
    ) -> RelayResult<Self> {
        let settings = config.auth_settings()?;
        let db = Arc::new(DatabaseGateway::new(remote, Arc::new(cache), config.call_timeout()));
        let evidence = Arc::new(evidence);
        let sessions = Arc::new(SessionManager::new(db.clone(), evidence.clone()));
        let auth = Authenticator::new(db.clone(), sessions.clone(), evidence.clone(), settings);
        let dispatcher = CommandDispatcher::new(db.clone(), sessions.clone(), evidence.clone());
        let transfer = Arc::new(TransferSupervisor::new(db.clone(), evidence.clone()));
        let workers = Semaphore::new(config.request_workers);

        Ok(Self {
            config,
            db,
            evidence,
            sessions,
            auth,
            dispatcher,
            transfer,
            workers,
        })
    }

    pub fn database(&self) -> &Arc<DatabaseGateway> {
        &self.db
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn evidence(&self) -> &Arc<EvidenceStore> {
        &self.evidence
    }

    /// Loads cached factory keys, then tries the central database.
    pub async fn connect(&self) -> bool {
        self.db.load_factory_keys().await;
        self.db.reconnect().await
    }

    pub async fn authenticate(&self, request: AuthRequest<'_>) -> Option<AuthReply> {
        let _permit = self.workers.acquire().await.ok()?;
        self.auth.authenticate(request).await
    }

    pub fn valid_authentication(&self, peer: &str, cookie: &str) -> bool {
        self.auth.valid_authentication(peer, cookie)
    }

    pub async fn dispatch(&self, cookie: &str, peer: &str, content: &[u8]) -> Option<Vec<u8>> {
        let _permit = self.workers.acquire().await.ok()?;
        self.dispatcher.dispatch(cookie, peer, content).await
    }

    /// Session sweep, database reconnect and evidence transfer, until
    /// `shutdown` flips.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let sweep = {
            let relay = self.clone();
            let window = self.config.session_timeout();
            periodic("session sweep", self.config.sweep_interval(), shutdown.clone(), move || {
                let relay = relay.clone();
                async move {
                    let expired = relay.sessions.timeout(window).await;
                    if expired > 0 {
                        info!(expired, active = relay.sessions.length(), "session sweep");
                    }
                }
            })
        };

        let reconnect = {
            let relay = self.clone();
            periodic("reconnect", self.config.reconnect_interval(), shutdown.clone(), move || {
                let relay = relay.clone();
                async move {
                    if !relay.db.is_available() && !relay.db.reconnect().await {
                        debug!("central database still unavailable");
                    }
                }
            })
        };

        let transfer = tokio::spawn(self.transfer.clone().run(self.config.transfer_poll(), shutdown));

        vec![sweep, reconnect, transfer]
    }
}

fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(task = name, "shutdown sender dropped");
                    }
                    debug!(task = name, "stopping");
                    return;
                }
            }
        }
    })
}
