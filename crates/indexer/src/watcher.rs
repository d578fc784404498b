use crate::controller::{PublishUpdate, TierCounts, WorkspaceController};
use crate::decorations::EditorHost;
use crate::fs_watch::FsWatchBackend;
use crate::{IndexerError, Result, StackUsageConfig};
use log::{error, info};
use notify::Event;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc, watch};

/// Snapshot of a running workspace service
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceHealth {
    pub manifest_target: Option<PathBuf>,
    pub tiers: TierCounts,
    pub records: usize,
    pub sources: usize,
    pub last_pass: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl WorkspaceHealth {
    fn initial() -> Self {
        Self {
            manifest_target: None,
            tiers: TierCounts::default(),
            records: 0,
            sources: 0,
            last_pass: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

enum ServiceCommand {
    DocumentsShown(Vec<PathBuf>),
    Refresh,
    Shutdown,
}

/// Watches one workspace root in a background task.
///
/// Clones share the task; it stops when the last clone is dropped.
#[derive(Clone)]
pub struct WorkspaceService {
    inner: Arc<WorkspaceServiceInner>,
}

struct WorkspaceServiceInner {
    root: PathBuf,
    command_tx: mpsc::Sender<ServiceCommand>,
    update_tx: broadcast::Sender<PublishUpdate>,
    health_tx: watch::Sender<WorkspaceHealth>,
}

impl WorkspaceService {
    /// Attaches the watch tiers for `root` and starts serving `host`.
    pub fn start<H>(root: impl Into<PathBuf>, config: StackUsageConfig, host: H) -> Result<Self>
    where
        H: EditorHost + 'static,
    {
        let root = root.into();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (command_tx, command_rx) = mpsc::channel(16);
        let (update_tx, _) = broadcast::channel(64);
        let (health_tx, _) = watch::channel(WorkspaceHealth::initial());

        let backend = FsWatchBackend::new(event_tx, config.notify_poll_interval)?;
        let controller =
            WorkspaceController::new(&root, Arc::new(config), Arc::new(backend), host)
                .with_updates(update_tx.clone());

        spawn_service_loop(controller, event_rx, command_rx, health_tx.clone());

        Ok(Self {
            inner: Arc::new(WorkspaceServiceInner {
                root,
                command_tx,
                update_tx,
                health_tx,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Renders documents the host just opened or revealed.
    pub async fn documents_shown(&self, paths: Vec<PathBuf>) -> Result<()> {
        self.send(ServiceCommand::DocumentsShown(paths)).await
    }

    /// Re-renders every visible document.
    pub async fn refresh(&self) -> Result<()> {
        self.send(ServiceCommand::Refresh).await
    }

    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<PublishUpdate> {
        self.inner.update_tx.subscribe()
    }

    #[must_use]
    pub fn health_snapshot(&self) -> WorkspaceHealth {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<WorkspaceHealth> {
        self.inner.health_tx.subscribe()
    }

    async fn send(&self, command: ServiceCommand) -> Result<()> {
        self.inner
            .command_tx
            .send(command)
            .await
            .map_err(|e| IndexerError::Other(format!("workspace service stopped: {e}")))
    }
}

impl Drop for WorkspaceService {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(ServiceCommand::Shutdown);
        }
    }
}

fn record_outcome<H: EditorHost>(
    controller: &WorkspaceController<H>,
    health: &mut WorkspaceHealth,
    outcome: Result<()>,
) {
    match outcome {
        Ok(()) => {
            health.last_error = None;
            health.consecutive_failures = 0;
        }
        Err(err) => {
            error!("{}: {err}", controller.root().display());
            health.last_error = Some(err.to_string());
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        }
    }
    health.manifest_target = controller.manifest_target().map(Path::to_path_buf);
    health.tiers = controller.tier_counts();
    health.records = controller.index().len();
    health.sources = controller.index().source_count();
    health.last_pass = Some(SystemTime::now());
}

fn spawn_service_loop<H>(
    mut controller: WorkspaceController<H>,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<ServiceCommand>,
    health_tx: watch::Sender<WorkspaceHealth>,
) where
    H: EditorHost + 'static,
{
    tokio::spawn(async move {
        let mut health = WorkspaceHealth::initial();

        let outcome = controller.start().await;
        record_outcome(&controller, &mut health, outcome);
        health_tx.send_replace(health.clone());

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    let outcome = controller.handle_event(event).await;
                    record_outcome(&controller, &mut health, outcome);
                    health_tx.send_replace(health.clone());
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ServiceCommand::DocumentsShown(paths)) => {
                            controller.documents_shown(&paths).await;
                        }
                        Some(ServiceCommand::Refresh) => {
                            controller.refresh().await;
                        }
                        Some(ServiceCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        controller.dispose();
        info!("Stopped watching {}", controller.root().display());
    });
}
