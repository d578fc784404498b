use crate::decorations::{publish, publish_documents, Affected, EditorHost};
use crate::disposables::{DisposableContainer, DisposableSlot};
use crate::fs_watch::{WatchBackend, WatchHandle, WatchRoute};
use crate::index::UsageIndex;
use crate::manifest::{read_manifest, report_units, ReportUnit};
use crate::report::read_unit;
use crate::resolver::resolve;
use crate::{Result, StackUsageConfig};
use log::{debug, info, warn};
use notify::Event;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Emitted after every publish pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishUpdate {
    /// Paths that were re-rendered; `None` means every visible document
    pub affected: Option<Vec<String>>,
    /// Documents whose decorations were replaced
    pub documents: usize,
    pub records: usize,
    pub sources: usize,
}

/// Live watch registrations per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub manifest_location: bool,
    pub manifest_target: bool,
    pub reports: usize,
}

/// Drives the three watch tiers of one workspace root.
///
/// Tier A watches `<root>/<manifest>` and resolves symlinks. Tier B watches
/// the resolved manifest and rebuilds tier C, one watch per report file.
/// Every attach is followed by one synchronous invocation of its handler,
/// queued in `pending` so nested attaches never recurse.
pub struct WorkspaceController<H: EditorHost> {
    root: PathBuf,
    manifest_path: PathBuf,
    config: Arc<StackUsageConfig>,
    backend: Arc<dyn WatchBackend>,
    host: H,
    index: UsageIndex,
    manifest_watch: DisposableSlot<WatchHandle>,
    target_watch: DisposableSlot<WatchHandle>,
    report_watches: DisposableContainer<WatchHandle>,
    manifest_target: Option<PathBuf>,
    target_generation: u64,
    report_generation: u64,
    pending: VecDeque<WatchRoute>,
    /// Set while a tier C rebuild is in flight; partial publishes are folded
    /// into one full publish at the end of the drain.
    full_render_pending: bool,
    updates: Option<broadcast::Sender<PublishUpdate>>,
}

impl<H: EditorHost> WorkspaceController<H> {
    pub fn new(
        root: impl Into<PathBuf>,
        config: Arc<StackUsageConfig>,
        backend: Arc<dyn WatchBackend>,
        host: H,
    ) -> Self {
        let root = root.into();
        let manifest_path = root.join(&config.manifest_file_name);
        Self {
            root,
            manifest_path,
            config,
            backend,
            host,
            index: UsageIndex::new(),
            manifest_watch: DisposableSlot::new(),
            target_watch: DisposableSlot::new(),
            report_watches: DisposableContainer::new(),
            manifest_target: None,
            target_generation: 0,
            report_generation: 0,
            pending: VecDeque::new(),
            full_render_pending: false,
            updates: None,
        }
    }

    #[must_use]
    pub fn with_updates(mut self, updates: broadcast::Sender<PublishUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Attaches tier A and runs the initial chain down to the reports.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Watching {} for stack usage reports",
            self.manifest_path.display()
        );
        let handle = self.attach(&self.manifest_path.clone(), WatchRoute::ManifestLocation)?;
        self.manifest_watch.set(handle);
        self.drain().await
    }

    /// Runs the handler for one route plus everything it attaches.
    pub async fn handle(&mut self, route: WatchRoute) -> Result<()> {
        self.pending.push_back(route);
        self.drain().await
    }

    /// Routes a raw filesystem event through the backend.
    pub async fn handle_event(&mut self, event: notify::Result<Event>) -> Result<()> {
        match event {
            Ok(event) => {
                let routes = self.backend.route(&event);
                if !routes.is_empty() {
                    debug!("{:?} on {:?} -> {} route(s)", event.kind, event.paths, routes.len());
                }
                self.pending.extend(routes);
            }
            Err(err) => warn!("watch error: {err}"),
        }
        if self.backend.take_overflow() {
            warn!("Dropped filesystem events; resynchronizing from the manifest location");
            self.pending.push_back(WatchRoute::ManifestLocation);
        }
        self.drain().await
    }

    /// Renders documents the host just made visible.
    pub async fn documents_shown(&mut self, paths: &[PathBuf]) -> usize {
        let documents = self
            .host
            .visible_documents()
            .into_iter()
            .filter(|doc| paths.iter().any(|p| *p == doc.path))
            .collect();
        let updated = publish_documents(
            &self.index,
            &mut self.host,
            &self.config,
            &Affected::All,
            documents,
        )
        .await;
        self.notify(None, updated);
        updated
    }

    /// Re-renders every visible document from the current index.
    pub async fn refresh(&mut self) -> usize {
        self.publish(Affected::All).await
    }

    /// Tears down every tier. The index is kept for inspection.
    pub fn dispose(&mut self) {
        self.report_watches.dispose();
        self.target_watch.dispose();
        self.manifest_watch.dispose();
        self.pending.clear();
        debug!("Disposed watches for {}", self.root.display());
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &UsageIndex {
        &self.index
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Real manifest path currently watched by tier B
    pub fn manifest_target(&self) -> Option<&Path> {
        self.manifest_target.as_deref()
    }

    pub fn tier_counts(&self) -> TierCounts {
        TierCounts {
            manifest_location: self.manifest_watch.is_set(),
            manifest_target: self.target_watch.is_set(),
            reports: self.report_watches.len(),
        }
    }

    fn attach(&mut self, target: &Path, route: WatchRoute) -> Result<WatchHandle> {
        let handle = self.backend.watch(target, route.clone())?;
        self.pending.push_back(route);
        Ok(handle)
    }

    async fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(route) = self.pending.pop_front() {
            if let Err(err) = self.dispatch(route).await {
                warn!("Watch handler for {} failed: {err}", self.root.display());
                first_error.get_or_insert(err);
            }
        }
        if self.full_render_pending {
            self.full_render_pending = false;
            self.publish(Affected::All).await;
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn dispatch(&mut self, route: WatchRoute) -> Result<()> {
        match route {
            WatchRoute::ManifestLocation => self.update_manifest_target().await,
            WatchRoute::ManifestTarget { generation } => {
                if generation != self.target_generation {
                    debug!("Ignoring manifest event from generation {generation}");
                    return Ok(());
                }
                self.rebuild_report_watches().await
            }
            WatchRoute::Report { generation, unit } => {
                if generation != self.report_generation {
                    debug!(
                        "Ignoring stale report event for {}",
                        unit.report_path.display()
                    );
                    return Ok(());
                }
                self.process_report(&unit).await;
                Ok(())
            }
        }
    }

    /// Tier A: follow the manifest location to its real file.
    async fn update_manifest_target(&mut self) -> Result<()> {
        let manifest_path = self.manifest_path.clone();
        let resolved = resolve(&manifest_path).await?;
        let Some(target) = resolved.path().map(Path::to_path_buf) else {
            info!("{} does not exist", manifest_path.display());
            self.reset_tiers();
            return Ok(());
        };

        self.target_watch.dispose();
        self.target_generation += 1;
        debug!("Manifest {} -> {}", manifest_path.display(), target.display());
        let route = WatchRoute::ManifestTarget {
            generation: self.target_generation,
        };
        match self.attach(&target, route) {
            Ok(handle) => {
                self.target_watch.set(handle);
                self.manifest_target = Some(target);
                Ok(())
            }
            Err(err) => {
                self.reset_tiers();
                Err(err)
            }
        }
    }

    /// Drops tiers B and C and everything they indexed.
    fn reset_tiers(&mut self) {
        self.target_watch.dispose();
        self.report_watches.dispose();
        self.target_generation += 1;
        self.report_generation += 1;
        self.manifest_target = None;
        self.index.clear();
        self.full_render_pending = true;
    }

    /// Tier B: re-read the manifest and rebuild one watch per report.
    async fn rebuild_report_watches(&mut self) -> Result<()> {
        self.report_generation += 1;
        self.report_watches.dispose();
        self.index.clear();
        self.full_render_pending = true;

        let resolved = resolve(&self.manifest_path.clone()).await?;
        let Some(target) = resolved.path().map(Path::to_path_buf) else {
            info!("Manifest target vanished: {}", self.manifest_path.display());
            return Ok(());
        };
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            info!("Not existing: {}", target.display());
            return Ok(());
        }

        let records = match read_manifest(&target).await {
            Ok(records) => records,
            Err(err) => {
                warn!("{err}");
                return Ok(());
            }
        };
        info!(
            "Reading {} manifest entries from {}",
            records.len(),
            target.display()
        );
        let manifest_dir = target.parent().unwrap_or(Path::new(""));
        let units = report_units(&records, manifest_dir, &self.config.report_extension);

        let generation = self.report_generation;
        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let report_path = unit.report_path.clone();
            let route = WatchRoute::Report {
                generation,
                unit: Arc::new(unit),
            };
            match self.attach(&report_path, route) {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!("Cannot watch {}: {err}", report_path.display()),
            }
        }
        self.report_watches.set(handles);
        Ok(())
    }

    /// Tier C: replace one source's records and re-render what changed.
    async fn process_report(&mut self, unit: &ReportUnit) {
        let records = read_unit(unit, &self.config).await;
        let affected = self.index.apply(&unit.source_key, records);
        if self.full_render_pending {
            return;
        }
        self.publish(Affected::Paths(affected)).await;
    }

    async fn publish(&mut self, affected: Affected) -> usize {
        let updated = publish(&self.index, &mut self.host, &self.config, &affected).await;
        let paths = match affected {
            Affected::All => None,
            Affected::Paths(paths) => Some(paths.into_iter().collect()),
        };
        self.notify(paths, updated);
        updated
    }

    fn notify(&self, affected: Option<Vec<String>>, documents: usize) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(PublishUpdate {
                affected,
                documents,
                records: self.index.len(),
                sources: self.index.source_count(),
            });
        }
    }
}

impl<H: EditorHost> Drop for WorkspaceController<H> {
    fn drop(&mut self) {
        self.dispose();
    }
}
