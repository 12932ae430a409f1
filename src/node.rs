use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::persistence::StateStore;
use crate::protocol::ProtocolServer;
use crate::scheduler::{Scheduler, SchedulerEvent};
use crate::worker::{ExecutionAdapter, RemoteShellExecutor};

/// A running render controller: scheduler, protocol server and the periodic
/// autostart and snapshot loop.
pub struct ControllerNode {
    config: ControllerConfig,
    scheduler: Arc<Scheduler>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    store: StateStore,
}

impl ControllerNode {
    /// Controller that reaches its nodes through the configured remote shell.
    pub fn new(config: ControllerConfig) -> Self {
        let adapter = Arc::new(RemoteShellExecutor::new(&config));
        Self::with_adapter(config, adapter)
    }

    pub fn with_adapter(config: ControllerConfig, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let store = StateStore::new(&config.state_file);
        let (scheduler, events) = Scheduler::new(config.clone(), adapter);
        Self {
            config,
            scheduler: Arc::new(scheduler),
            events,
            store,
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Restore saved state, bind the protocol server and run everything in the
    /// background. Returns the bound address and the handle of the controller task.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        tokio::fs::create_dir_all(&self.config.log_dir).await?;
        if let Some(snapshot) = self.store.load().await {
            self.scheduler.restore(snapshot).await;
        }

        let server = ProtocolServer::bind(self.config.listen_addr, self.scheduler.clone()).await?;
        let addr = server.local_addr()?;
        tracing::info!(
            addr = %addr,
            nodes = self.config.nodes.len(),
            state_file = %self.store.path().display(),
            "Render controller started"
        );

        let handle = tokio::spawn(async move {
            let server_task = tokio::spawn(server.run(shutdown.clone()));
            let ControllerNode {
                config,
                scheduler,
                events,
                store,
            } = self;
            update_loop(&scheduler, &store, events, config.update_interval(), &shutdown).await;
            if let Err(e) = server_task.await {
                tracing::warn!(error = %e, "Protocol server task failed");
            }

            scheduler.note_shutdown().await;
            save_state(&scheduler, &store).await;
            tracing::info!("Render controller stopped");
        });
        Ok((addr, handle))
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (_, handle) = self.spawn(shutdown).await?;
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Controller task failed");
        }
        Ok(())
    }
}

/// Autostart on every tick and scheduler event; snapshot on every tick.
async fn update_loop(
    scheduler: &Scheduler,
    store: &StateStore,
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    period: Duration,
    shutdown: &CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                scheduler.check_autostart().await;
                save_state(scheduler, store).await;
            }
            Some(event) = events.recv() => {
                if let SchedulerEvent::JobFinished(id) = &event {
                    tracing::info!(job_id = %id, "Render complete, checking for next job");
                }
                scheduler.check_autostart().await;
            }
        }
    }
}

async fn save_state(scheduler: &Scheduler, store: &StateStore) {
    let snapshot = scheduler.snapshot().await;
    if let Err(e) = store.save(&snapshot).await {
        tracing::warn!(error = %e, "Failed to save controller state");
    }
}
