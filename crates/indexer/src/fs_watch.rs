use crate::disposables::Disposable;
use crate::manifest::ReportUnit;
use crate::{IndexerError, Result};
use log::{debug, warn};
use notify::event::{EventKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What a fired watch means to the controller. Generations let the
/// controller drop events that belong to a torn-down tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRoute {
    ManifestLocation,
    ManifestTarget { generation: u64 },
    Report { generation: u64, unit: Arc<ReportUnit> },
}

/// Live registration with a watch backend; released on dispose or drop.
pub struct WatchHandle {
    id: u64,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(id: u64, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Disposable for WatchHandle {
    fn dispose(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// Filesystem watch primitive used by the controller
pub trait WatchBackend: Send + Sync {
    /// Watches `target` (a file path) for create/change/delete.
    ///
    /// The initial invocation that follows every attach is the caller's job;
    /// the backend only reports later changes.
    fn watch(&self, target: &Path, route: WatchRoute) -> Result<WatchHandle>;

    /// Routes a raw event to the registrations it concerns.
    fn route(&self, event: &Event) -> Vec<WatchRoute>;

    /// Number of live registrations
    fn live_watches(&self) -> usize;

    /// True once if raw events were dropped since the last call.
    fn take_overflow(&self) -> bool {
        false
    }
}

struct Registration {
    dir: PathBuf,
    file_name: OsString,
    route: WatchRoute,
    /// Directory currently holding the OS watch: `dir` itself, or its
    /// nearest existing ancestor while `dir` does not exist yet
    armed_at: Option<Armed>,
}

/// `spelled` is the path as registered; `key` is its canonical form, which
/// both keys the shared OS watch and prefixes the paths notify reports.
#[derive(Clone, PartialEq, Eq)]
struct Armed {
    spelled: PathBuf,
    key: PathBuf,
}

impl Registration {
    fn is_final(&self) -> bool {
        self.armed_at
            .as_ref()
            .is_some_and(|armed| armed.spelled == self.dir)
    }

    fn matches(&self, dir: &Path, name: &OsStr) -> bool {
        self.file_name == name
            && self
                .armed_at
                .as_ref()
                .is_some_and(|armed| armed.spelled == self.dir && armed.key == dir)
    }
}

struct RegistryState {
    watcher: RecommendedWatcher,
    next_id: u64,
    registrations: HashMap<u64, Registration>,
    dir_refs: HashMap<PathBuf, usize>,
}

impl RegistryState {
    fn acquire_dir(&mut self, key: &Path) -> bool {
        if let Some(count) = self.dir_refs.get_mut(key) {
            *count += 1;
            return true;
        }
        if let Err(err) = self.watcher.watch(key, RecursiveMode::NonRecursive) {
            warn!("failed to watch {}: {err}", key.display());
            return false;
        }
        debug!("Watching directory {}", key.display());
        self.dir_refs.insert(key.to_path_buf(), 1);
        true
    }

    fn release_dir(&mut self, key: &Path) {
        let Some(count) = self.dir_refs.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.dir_refs.remove(key);
            if let Err(err) = self.watcher.unwatch(key) {
                debug!("unwatch {} failed: {err}", key.display());
            }
        }
    }

    /// Arms on the deepest existing ancestor-or-self of the registration's dir.
    fn arm(&mut self, id: u64) {
        let Some(dir) = self.registrations.get(&id).map(|r| r.dir.clone()) else {
            return;
        };
        let target = nearest_existing_dir(&dir).map(|spelled| Armed {
            key: canonical_dir(&spelled),
            spelled,
        });
        let current = self.registrations.get(&id).and_then(|r| r.armed_at.clone());
        if current == target {
            return;
        }
        if let Some(previous) = current {
            self.release_dir(&previous.key);
        }
        let armed_at = match target {
            Some(target) if self.acquire_dir(&target.key) => Some(target),
            _ => None,
        };
        if let Some(reg) = self.registrations.get_mut(&id) {
            reg.armed_at = armed_at;
        }
    }

    fn needs_rearm(&self, event: &Event) -> bool {
        if self.registrations.values().any(|reg| !reg.is_final()) {
            return true;
        }
        matches!(event.kind, EventKind::Remove(_))
            && event.paths.iter().any(|p| self.dir_refs.contains_key(p))
    }

    /// Moves watches as directories appear or vanish. Returns the routes of
    /// registrations that just reached their own directory.
    fn rearm(&mut self) -> Vec<WatchRoute> {
        let ids: Vec<u64> = self.registrations.keys().copied().collect();
        let mut fired = Vec::new();
        for id in ids {
            let was_final = self
                .registrations
                .get(&id)
                .is_some_and(|reg| reg.is_final());
            self.arm(id);
            if let Some(reg) = self.registrations.get(&id) {
                if !was_final && reg.is_final() {
                    fired.push(reg.route.clone());
                }
            }
        }
        fired
    }
}

fn nearest_existing_dir(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .filter(|candidate| !candidate.as_os_str().is_empty())
        .find(|candidate| candidate.is_dir())
        .map(Path::to_path_buf)
}

/// `build/../obj`, `obj` and a symlink to `obj` all share one inotify watch,
/// so they must share one key.
fn canonical_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

fn is_relevant_kind(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(_) => false,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        _ => true,
    }
}

/// notify-backed implementation. The notify callback only forwards raw
/// events into the channel; routing happens on the consumer side.
pub struct FsWatchBackend {
    state: Arc<Mutex<RegistryState>>,
    overflow: Arc<AtomicBool>,
}

impl FsWatchBackend {
    pub fn new(
        sender: mpsc::Sender<notify::Result<Event>>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let overflow = Arc::new(AtomicBool::new(false));
        let overflow_flag = overflow.clone();
        let watcher = RecommendedWatcher::new(
            move |res| match sender.try_send(res) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => overflow_flag.store(true, Ordering::SeqCst),
            },
            NotifyConfig::default().with_poll_interval(poll_interval),
        )
        .map_err(|e| IndexerError::Watch(format!("watcher init failed: {e}")))?;

        Ok(Self {
            state: Arc::new(Mutex::new(RegistryState {
                watcher,
                next_id: 1,
                registrations: HashMap::new(),
                dir_refs: HashMap::new(),
            })),
            overflow,
        })
    }

    /// Number of directories holding an OS watch
    pub fn watched_dirs(&self) -> usize {
        self.state.lock().map(|s| s.dir_refs.len()).unwrap_or(0)
    }

    fn release(state: &Weak<Mutex<RegistryState>>, id: u64) {
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut guard = match state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("watch registry lock poisoned");
                return;
            }
        };
        if let Some(reg) = guard.registrations.remove(&id) {
            if let Some(armed) = reg.armed_at {
                guard.release_dir(&armed.key);
            }
        }
    }
}

impl WatchBackend for FsWatchBackend {
    fn watch(&self, target: &Path, route: WatchRoute) -> Result<WatchHandle> {
        let (Some(dir), Some(file_name)) = (target.parent(), target.file_name()) else {
            return Err(IndexerError::Watch(format!(
                "cannot watch {}: no parent directory or file name",
                target.display()
            )));
        };

        let id = {
            let mut guard = self
                .state
                .lock()
                .map_err(|_| IndexerError::Watch("watch registry lock poisoned".to_string()))?;
            let id = guard.next_id;
            guard.next_id += 1;
            guard.registrations.insert(
                id,
                Registration {
                    dir: dir.to_path_buf(),
                    file_name: file_name.to_os_string(),
                    route,
                    armed_at: None,
                },
            );
            guard.arm(id);
            if let Some(reg) = guard.registrations.get(&id) {
                match &reg.armed_at {
                    Some(armed) if armed.spelled == dir => {}
                    Some(armed) => debug!(
                        "{} does not exist yet; watching {}",
                        dir.display(),
                        armed.spelled.display()
                    ),
                    None => warn!("no watchable ancestor for {}", target.display()),
                }
            }
            id
        };

        let state = Arc::downgrade(&self.state);
        Ok(WatchHandle::new(id, move || Self::release(&state, id)))
    }

    fn route(&self, event: &Event) -> Vec<WatchRoute> {
        if !is_relevant_kind(&event.kind) {
            return Vec::new();
        }
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("watch registry lock poisoned");
                return Vec::new();
            }
        };

        let mut routes = Vec::new();
        for path in &event.paths {
            let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };
            for reg in guard.registrations.values() {
                if reg.matches(dir, name) {
                    routes.push(reg.route.clone());
                }
            }
        }

        if guard.needs_rearm(event) {
            routes.extend(guard.rearm());
        }
        routes
    }

    fn live_watches(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.registrations.len())
            .unwrap_or(0)
    }

    fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange};
    use tempfile::TempDir;

    fn backend() -> (FsWatchBackend, mpsc::Receiver<notify::Result<Event>>) {
        let (tx, rx) = mpsc::channel(64);
        let backend = FsWatchBackend::new(tx, Duration::from_millis(100)).expect("backend");
        (backend, rx)
    }

    fn modify(path: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.into())
    }

    #[test]
    fn routes_only_matching_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let (backend, _rx) = backend();
        let target = root.join("main.su");
        let _handle = backend.watch(&target, WatchRoute::ManifestLocation).unwrap();

        assert_eq!(backend.route(&modify(&target)), vec![WatchRoute::ManifestLocation]);
        assert!(backend.route(&modify(&root.join("main.o"))).is_empty());

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(target.clone());
        assert!(backend.route(&access).is_empty());
    }

    #[test]
    fn shared_directory_is_watched_once() {
        let temp = TempDir::new().unwrap();
        let (backend, _rx) = backend();
        let first = backend
            .watch(&temp.path().join("a.su"), WatchRoute::ManifestLocation)
            .unwrap();
        let second = backend
            .watch(
                &temp.path().join("b.su"),
                WatchRoute::ManifestTarget { generation: 1 },
            )
            .unwrap();
        assert_eq!(backend.live_watches(), 2);
        assert_eq!(backend.watched_dirs(), 1);

        drop(first);
        assert_eq!(backend.live_watches(), 1);
        assert_eq!(backend.watched_dirs(), 1);

        drop(second);
        assert_eq!(backend.live_watches(), 0);
        assert_eq!(backend.watched_dirs(), 0);
    }

    #[test]
    fn disposed_handle_stops_routing() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let (backend, _rx) = backend();
        let target = root.join("main.su");
        let mut handle = backend.watch(&target, WatchRoute::ManifestLocation).unwrap();
        handle.dispose();
        handle.dispose();

        assert!(backend.route(&modify(&target)).is_empty());
        assert_eq!(backend.live_watches(), 0);
    }

    #[test]
    fn missing_directory_arms_on_ancestor_and_fires_when_created() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let (backend, _rx) = backend();
        let build = root.join("build/obj");
        let route = WatchRoute::ManifestTarget { generation: 7 };
        let _handle = backend.watch(&build.join("main.su"), route.clone()).unwrap();
        assert_eq!(backend.watched_dirs(), 1);

        std::fs::create_dir_all(&build).unwrap();
        let created = Event::new(EventKind::Create(CreateKind::Folder))
            .add_path(root.join("build"));
        assert_eq!(backend.route(&created), vec![route.clone()]);

        // Now armed on its own directory; a second structural event is quiet.
        assert!(backend.route(&created).is_empty());
        assert_eq!(backend.route(&modify(&build.join("main.su"))), vec![route]);
    }

    #[test]
    fn two_spellings_of_one_directory_share_a_watch() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("build")).unwrap();
        std::fs::create_dir_all(root.join("obj")).unwrap();
        let (backend, _rx) = backend();

        let via_build = WatchRoute::ManifestTarget { generation: 1 };
        let direct = WatchRoute::ManifestTarget { generation: 2 };
        let _a = backend
            .watch(&root.join("build/../obj/a.su"), via_build.clone())
            .unwrap();
        let b = backend.watch(&root.join("obj/b.su"), direct.clone()).unwrap();
        assert_eq!(backend.watched_dirs(), 1);

        assert_eq!(
            backend.route(&modify(&root.join("obj/a.su"))),
            vec![via_build.clone()]
        );
        assert_eq!(backend.route(&modify(&root.join("obj/b.su"))), vec![direct]);

        drop(b);
        assert_eq!(backend.watched_dirs(), 1);
        assert_eq!(backend.route(&modify(&root.join("obj/a.su"))), vec![via_build]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_routes_events_under_its_real_path() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();
        let (backend, _rx) = backend();

        let route = WatchRoute::ManifestLocation;
        let _handle = backend
            .watch(&root.join("link/compile_commands.json"), route.clone())
            .unwrap();
        assert_eq!(
            backend.route(&modify(&root.join("real/compile_commands.json"))),
            vec![route]
        );
    }

    #[cfg_attr(
        not(target_os = "linux"),
        ignore = "relies on inotify delivering events promptly"
    )]
    #[tokio::test]
    async fn write_under_second_spelling_is_delivered_and_routed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("build")).unwrap();
        std::fs::create_dir_all(root.join("obj")).unwrap();
        let (backend, mut rx) = backend();

        let via_build = WatchRoute::ManifestTarget { generation: 1 };
        let _a = backend
            .watch(&root.join("build/../obj/a.su"), via_build.clone())
            .unwrap();
        let b = backend
            .watch(
                &root.join("obj/b.su"),
                WatchRoute::ManifestTarget { generation: 2 },
            )
            .unwrap();
        drop(b);

        std::fs::write(root.join("obj/a.su"), "a.c:1:5:int a(void)\t16\tstatic\n").unwrap();
        let routed = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(event) = rx.recv().await {
                if let Ok(event) = event {
                    if backend.route(&event).contains(&via_build) {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(routed, "write to obj/a.su was not routed");
    }
}
