//! Region server agent: keeps a region server registered with the master.
//!
//! The agent registers its server, then heartbeats on the interval the
//! master hands back, reporting the regions the server has online. When the
//! master answers `Fenced` the agent aborts the server so it cannot keep
//! serving regions that are being reassigned. On a clean shutdown it closes
//! every region and tells the master it is exiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use rangegrid_core::{Clock, ServerAddress, ServerIdentity};

use crate::monitor::{HeartbeatOutcome, HeartbeatReport};
use crate::server::RegionServer;

/// Answer to a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub identity: ServerIdentity,
    pub heartbeat_interval: Duration,
}

/// The agent's channel to the master.
#[async_trait]
pub trait MasterLink: Send + Sync {
    async fn register(&self, address: &ServerAddress) -> anyhow::Result<Registration>;

    async fn heartbeat(&self, report: HeartbeatReport) -> anyhow::Result<HeartbeatOutcome>;

    async fn report_exiting(&self, identity: &ServerIdentity) -> anyhow::Result<()>;
}

/// Why the heartbeat loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Clean shutdown; the master was told.
    Shutdown,
    /// The master declared this instance dead. The server was aborted.
    Fenced,
    /// The server stopped underneath the agent.
    ServerStopped,
}

/// Agent driving one [`RegionServer`].
pub struct RegionServerAgent {
    server: Arc<RegionServer>,
    master: Arc<dyn MasterLink>,
    clock: Arc<dyn Clock>,
    identity: Option<ServerIdentity>,
    heartbeat_interval: Duration,
}

impl RegionServerAgent {
    pub fn new(server: Arc<RegionServer>, master: Arc<dyn MasterLink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            server,
            master,
            clock,
            identity: None,
            heartbeat_interval: Duration::from_secs(1),
        }
    }

    /// Register with the master.
    pub async fn join(&mut self) -> anyhow::Result<ServerIdentity> {
        let registration = self.master.register(self.server.address()).await?;
        info!(
            server = %registration.identity,
            interval = ?registration.heartbeat_interval,
            "registered with master"
        );
        self.heartbeat_interval = registration.heartbeat_interval;
        self.identity = Some(registration.identity.clone());
        Ok(registration.identity)
    }

    /// Identity assigned at registration (None before `join`).
    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.identity.as_ref()
    }

    pub fn server(&self) -> &Arc<RegionServer> {
        &self.server
    }

    /// Send one heartbeat. Aborts the server if the master fences it.
    pub async fn heartbeat_once(&self) -> anyhow::Result<HeartbeatOutcome> {
        let identity = self.joined()?;
        let report = HeartbeatReport {
            identity: identity.clone(),
            regions_held: self.server.online_regions(),
            timestamp: self.clock.now_millis(),
        };
        let outcome = self.master.heartbeat(report).await?;
        match outcome {
            HeartbeatOutcome::Accepted | HeartbeatOutcome::Duplicate => {
                debug!(server = %identity, ?outcome, "heartbeat sent");
            }
            HeartbeatOutcome::Fenced | HeartbeatOutcome::Unknown => {
                self.server
                    .abort(&format!("master rejected heartbeat: {outcome:?}"));
            }
        }
        Ok(outcome)
    }

    /// Heartbeat until shutdown is signalled or the master fences us.
    pub async fn run_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<AgentExit> {
        let identity = self.joined()?.clone();
        info!(server = %identity, interval = ?self.heartbeat_interval, "heartbeat loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    if !self.server.is_running() {
                        warn!(server = %identity, "region server stopped, heartbeat loop exiting");
                        return Ok(AgentExit::ServerStopped);
                    }
                    match self.heartbeat_once().await {
                        Ok(HeartbeatOutcome::Fenced | HeartbeatOutcome::Unknown) => {
                            return Ok(AgentExit::Fenced);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(server = %identity, error = %e, "heartbeat failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(server = %identity, "heartbeat loop shutting down");
                    break;
                }
            }
        }

        self.server.stop();
        self.master.report_exiting(&identity).await?;
        Ok(AgentExit::Shutdown)
    }

    fn joined(&self) -> anyhow::Result<&ServerIdentity> {
        self.identity
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("not registered, call join() first"))
    }
}
