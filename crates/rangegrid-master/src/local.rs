//! In-process mini cluster: one master and any number of region servers.
//!
//! Everything shares one [`StateStore`] (the region storage every server
//! can reach) and one [`LocalTransport`]. Region servers can be stopped
//! cleanly, which reports the exit to the master, or killed, which just
//! makes them go silent and refuse connections until their lease runs out.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rangegrid_cluster::{AgentExit, LocalTransport, RegionServer, RegionServerAgent, Transport};
use rangegrid_core::{Clock, ClusterConfig, ServerAddress, ServerIdentity, TokioClock};
use rangegrid_state::{BootstrapSource, StateStore};

use crate::master::Master;

/// First port handed to local region servers.
const BASE_PORT: u16 = 60020;

struct LocalServer {
    server: Arc<RegionServer>,
    identity: ServerIdentity,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<anyhow::Result<AgentExit>>>,
}

pub struct LocalCluster {
    store: StateStore,
    transport: LocalTransport,
    clock: Arc<dyn Clock>,
    master: Arc<Master>,
    master_shutdown: watch::Sender<bool>,
    master_task: JoinHandle<anyhow::Result<()>>,
    servers: Vec<LocalServer>,
}

impl LocalCluster {
    /// Start a master and `region_servers` servers, then bootstrap ROOT
    /// and META.
    pub async fn start(
        config: ClusterConfig,
        store: StateStore,
        region_servers: usize,
    ) -> anyhow::Result<Self> {
        if region_servers == 0 {
            anyhow::bail!("a local cluster needs at least one region server");
        }
        let transport = LocalTransport::new();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let master = Arc::new(Master::new(
            config,
            store.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        ));

        let (master_shutdown, shutdown_rx) = watch::channel(false);
        let master_task = {
            let master = master.clone();
            tokio::spawn(async move { master.run(shutdown_rx).await })
        };

        let mut cluster = Self {
            store,
            transport,
            clock,
            master,
            master_shutdown,
            master_task,
            servers: Vec::new(),
        };
        for _ in 0..region_servers {
            cluster.start_region_server().await?;
        }
        cluster.master.bootstrap().await?;
        info!(region_servers, "local cluster started");
        Ok(cluster)
    }

    /// Start another region server. Returns its index.
    pub async fn start_region_server(&mut self) -> anyhow::Result<usize> {
        let index = self.servers.len();
        let port = BASE_PORT + index as u16;
        let address = ServerAddress::new(format!("localhost:{port}"));
        self.start_region_server_at(address).await
    }

    /// Start a region server at a specific address, such as the address of
    /// a server that was just killed.
    pub async fn start_region_server_at(&mut self, address: ServerAddress) -> anyhow::Result<usize> {
        let server = Arc::new(RegionServer::new(address, self.store.clone()));
        self.transport.register(server.clone());

        let mut agent = RegionServerAgent::new(server.clone(), self.master.clone(), self.clock.clone());
        let identity = agent.join().await?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { agent.run_heartbeat(shutdown_rx).await });

        self.servers.push(LocalServer {
            server,
            identity,
            shutdown,
            task: Some(task),
        });
        Ok(self.servers.len() - 1)
    }

    /// Clean exit: close every region and tell the master.
    pub fn stop_region_server(&mut self, index: usize) -> anyhow::Result<()> {
        let slot = self.slot(index)?;
        info!(server = %slot.identity, "stopping region server");
        if slot.shutdown.send(true).is_err() {
            debug!(server = %slot.identity, "agent already exited");
        }
        Ok(())
    }

    /// Crash: heartbeats stop and connections are refused. The master only
    /// finds out when the lease expires.
    pub fn kill_region_server(&mut self, index: usize) -> anyhow::Result<()> {
        let slot = self.slot_mut(index)?;
        info!(server = %slot.identity, "killing region server");
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.server.stop();
        Ok(())
    }

    /// Wait for a stopped server's agent to finish.
    pub async fn wait_on_region_server(&mut self, index: usize) -> anyhow::Result<AgentExit> {
        let slot = self.slot_mut(index)?;
        let Some(task) = slot.task.take() else {
            return Err(anyhow::anyhow!("region server {index} was killed or already waited on"));
        };
        task.await?
    }

    pub fn region_server(&self, index: usize) -> anyhow::Result<&Arc<RegionServer>> {
        Ok(&self.slot(index)?.server)
    }

    pub fn region_server_identity(&self, index: usize) -> anyhow::Result<&ServerIdentity> {
        Ok(&self.slot(index)?.identity)
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Transport for clients of this cluster.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.transport.clone())
    }

    /// Bootstrap record for clients of this cluster.
    pub fn bootstrap_source(&self) -> Arc<dyn BootstrapSource> {
        Arc::new(self.store.clone())
    }

    /// Stop the master, then every region server. The master goes first so
    /// the servers' exits do not shuffle regions between servers that are
    /// all about to stop.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.master_shutdown.send(true)?;
        (&mut self.master_task).await??;
        for index in 0..self.servers.len() {
            let running = self.servers[index].task.is_some();
            if running {
                self.stop_region_server(index)?;
                self.wait_on_region_server(index).await?;
            }
        }
        info!("local cluster stopped");
        Ok(())
    }

    fn slot(&self, index: usize) -> anyhow::Result<&LocalServer> {
        self.servers
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no region server {index}"))
    }

    fn slot_mut(&mut self, index: usize) -> anyhow::Result<&mut LocalServer> {
        self.servers
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("no region server {index}"))
    }
}
