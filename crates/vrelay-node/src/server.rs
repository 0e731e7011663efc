use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};
use vrelay_crypto::Keypair;

use crate::api::{create_router, AppState};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::gossip::{GossipBroadcaster, GossipTransport};
use crate::maintenance::PeriodicTask;
use crate::membership::{MembershipSnapshot, RosterMembership};
use crate::metrics::RelayMetrics;
use crate::rate_limit::{IpThrottle, StakeRateLimiter};
use crate::seen::SeenCache;
use crate::sink::SubmissionSink;
use crate::submission::SchemaRegistry;

/// Collaborators supplied by the embedding process.
pub struct RelayDeps {
    pub keypair: Arc<Keypair>,
    pub membership: Arc<dyn MembershipSnapshot>,
    pub sink: Arc<dyn SubmissionSink>,
    pub transport: Arc<dyn GossipTransport>,
    pub clock: Arc<dyn Clock>,
    /// Set when `membership` should be reloaded from `roster_path`.
    pub roster: Option<Arc<RosterMembership>>,
}

impl RelayDeps {
    pub fn new(
        keypair: Arc<Keypair>,
        membership: Arc<dyn MembershipSnapshot>,
        sink: Arc<dyn SubmissionSink>,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        Self {
            keypair,
            membership,
            sink,
            transport,
            clock: Arc::new(SystemClock),
            roster: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_roster(mut self, roster: Arc<RosterMembership>) -> Self {
        self.roster = Some(roster);
        self
    }
}

pub struct RelayServer {
    config: ServerConfig,
    state: AppState,
    roster: Option<Arc<RosterMembership>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, deps: RelayDeps) -> anyhow::Result<Self> {
        config.validate()?;

        if deps.keypair.identity() != &deps.membership.self_identity() {
            anyhow::bail!(
                "signing key {} does not match membership self identity {}",
                deps.keypair.identity(),
                deps.membership.self_identity()
            );
        }

        let metrics = Arc::new(RelayMetrics::new()?);
        let seen = Arc::new(SeenCache::from_config(&config.dedup));
        let rate_limiter = Arc::new(StakeRateLimiter::new(config.rate_limit.clone()));
        let forward_throttle = Arc::new(IpThrottle::new(config.forward.per_ip_interval()));
        let broadcaster = Arc::new(
            GossipBroadcaster::new(
                Arc::clone(&deps.keypair),
                Arc::clone(&deps.membership),
                deps.transport,
                Arc::clone(&seen),
                Arc::clone(&deps.clock),
                config.gossip.clone(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let state = AppState {
            membership: deps.membership,
            clock: deps.clock,
            auth: config.auth.clone(),
            seen,
            rate_limiter,
            forward_throttle,
            sink: deps.sink,
            broadcaster,
            schemas: Arc::new(SchemaRegistry::default()),
            metrics,
            started_at: Instant::now(),
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state,
            roster: deps.roster,
            shutdown_tx,
        })
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), &self.config)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Spawn the cache sweeps and, when configured, the roster refresh.
    pub fn start_maintenance(&self) -> Vec<PeriodicTask> {
        let clock = Arc::clone(&self.state.clock);
        let mut tasks = vec![
            self.state.seen.start(Arc::clone(&clock)),
            self.state.rate_limiter.start(Arc::clone(&clock)),
        ];
        if self.config.forward.enabled {
            tasks.push(self.state.forward_throttle.start(clock));
        }
        if let (Some(roster), Some(path)) = (&self.roster, &self.config.roster_path) {
            tasks.push(roster.spawn_refresh(path.clone(), self.config.roster_refresh()));
        }
        tasks
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let tasks = self.start_maintenance();
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(
            "vrelay-node {} listening on {}",
            self.state.membership.self_identity(),
            self.config.bind_addr
        );

        let shutdown_rx = self.shutdown_tx.subscribe();
        // peer address feeds the per-IP forward throttle
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(shutdown_rx))
            .await?;

        for task in tasks {
            let name = task.name();
            if tokio::time::timeout(self.config.shutdown_timeout(), task.stop())
                .await
                .is_err()
            {
                warn!("{} task did not stop in time", name);
            }
        }
        info!("vrelay-node stopped");
        Ok(())
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            return;
        }

        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown requested");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
