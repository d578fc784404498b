use stackscope_indexer::{
    Decoration, EditorHost, PublishUpdate, StackUsageConfig, VisibleDocument, WorkspaceService,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

type Applied = Arc<Mutex<HashMap<PathBuf, Vec<Decoration>>>>;

/// Shows a fixed set of files, re-read on every publish.
struct SharedHost {
    files: Vec<PathBuf>,
    applied: Applied,
}

impl EditorHost for SharedHost {
    fn visible_documents(&self) -> Vec<VisibleDocument> {
        self.files
            .iter()
            .filter_map(|path| {
                let text = std::fs::read_to_string(path).ok()?;
                Some(VisibleDocument::from_text(path.clone(), &text))
            })
            .collect()
    }

    fn set_decorations(&mut self, document: &Path, decorations: Vec<Decoration>) {
        self.applied
            .lock()
            .unwrap()
            .insert(document.to_path_buf(), decorations);
    }
}

fn write_project(root: &Path, bytes: u64) {
    std::fs::write(root.join("main.c"), "int main(void)\n{\n}\n").unwrap();
    std::fs::write(
        root.join("main.su"),
        format!("main.c:1:5:int main(void)\t{bytes}\tstatic\n"),
    )
    .unwrap();
    let entries = serde_json::json!([{
        "directory": root,
        "command": "gcc -fstack-usage -o main.o -c main.c",
        "file": "main.c",
    }]);
    std::fs::write(root.join("compile_commands.json"), entries.to_string()).unwrap();
}

fn test_config() -> StackUsageConfig {
    StackUsageConfig {
        notify_poll_interval: Duration::from_millis(100),
        ..StackUsageConfig::default()
    }
}

fn start_service(root: &Path, applied: &Applied) -> Option<WorkspaceService> {
    let host = SharedHost {
        files: vec![root.join("main.c")],
        applied: applied.clone(),
    };
    match WorkspaceService::start(root, test_config(), host) {
        Ok(service) => Some(service),
        Err(e) if e.to_string().contains("Too many open files") => {
            warn_skip_watcher(&e.to_string());
            None
        }
        Err(e) => panic!("start service: {e}"),
    }
}

async fn wait_until_ready(service: &WorkspaceService) {
    let mut health = service.health_stream();
    tokio::time::timeout(
        Duration::from_secs(4),
        health.wait_for(|h| h.last_pass.is_some()),
    )
    .await
    .expect("initial pass in time")
    .expect("service alive");
}

async fn wait_for_update(
    updates: &mut Receiver<PublishUpdate>,
    timeout: Duration,
    accept: impl Fn(&PublishUpdate) -> bool,
) -> Option<PublishUpdate> {
    tokio::time::timeout(timeout, async {
        loop {
            if let Ok(update) = updates.recv().await {
                if accept(&update) {
                    break Some(update);
                }
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn labels(applied: &Applied, path: &Path) -> Vec<String> {
    applied
        .lock()
        .unwrap()
        .get(path)
        .map(|decorations| decorations.iter().map(|d| d.label.clone()).collect())
        .unwrap_or_default()
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_rewrite_republishes_within_two_seconds() {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return;
    }
    if low_fd_limit() {
        warn_skip_fd();
        return;
    }
    ensure_ulimit();

    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");
    write_project(&root, 32);

    let applied = Applied::default();
    let Some(service) = start_service(&root, &applied) else {
        return;
    };
    wait_until_ready(&service).await;
    if service.health_snapshot().tiers.reports == 0 {
        warn_skip_watcher("no report watches were attached");
        return;
    }
    assert_eq!(labels(&applied, &root.join("main.c")), vec!["32 bytes"]);

    let mut updates = service.subscribe_updates();
    tokio::time::sleep(Duration::from_millis(250)).await;
    while matches!(updates.try_recv(), Ok(_) | Err(TryRecvError::Lagged(_))) {}

    let start = Instant::now();
    tokio::fs::write(
        root.join("main.su"),
        "main.c:1:5:int main(void)\t128\tdynamic,bounded\n",
    )
    .await
    .expect("rewrite report");

    let main_path = root.join("main.c");
    let main = main_path.to_string_lossy().into_owned();
    // A rewrite can surface as truncate + write; wait for the final content.
    let update = wait_for_update(&mut updates, Duration::from_secs(4), |u| {
        u.affected.as_ref().is_some_and(|paths| paths.contains(&main))
            && labels(&applied, &main_path) == vec!["128 bytes (dynamic,bounded)"]
    })
    .await
    .unwrap_or_else(|| {
        panic!(
            "timeout waiting for update (health={:?})",
            service.health_snapshot()
        )
    });

    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "republish latency too high: {elapsed:?} (update: {update:?})"
    );
    assert!(update.records >= 1);
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_manifest_clears_decorations() {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return;
    }
    if low_fd_limit() {
        warn_skip_fd();
        return;
    }
    ensure_ulimit();

    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");
    write_project(&root, 48);

    let applied = Applied::default();
    let Some(service) = start_service(&root, &applied) else {
        return;
    };
    wait_until_ready(&service).await;
    let mut updates = service.subscribe_updates();

    tokio::fs::remove_file(root.join("compile_commands.json"))
        .await
        .expect("remove manifest");

    wait_for_update(&mut updates, Duration::from_secs(4), |u| {
        u.affected.is_none() && u.records == 0
    })
    .await
    .unwrap_or_else(|| panic!("no empty render (health={:?})", service.health_snapshot()));

    assert!(labels(&applied, &root.join("main.c")).is_empty());
    let mut health = service.health_stream();
    let health = tokio::time::timeout(
        Duration::from_secs(4),
        health.wait_for(|h| h.manifest_target.is_none()),
    )
    .await
    .expect("health in time")
    .expect("service alive")
    .clone();
    assert_eq!(health.tiers.reports, 0);
    assert!(!health.tiers.manifest_target);
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shown_documents_are_rendered_alone() {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return;
    }
    if low_fd_limit() {
        warn_skip_fd();
        return;
    }
    ensure_ulimit();

    let temp = TempDir::new().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");
    write_project(&root, 64);
    std::fs::write(root.join("util.c"), "static int util(void)\n{\n}\n").unwrap();

    let applied = Applied::default();
    let host = SharedHost {
        files: vec![root.join("main.c"), root.join("util.c")],
        applied: applied.clone(),
    };
    let service = match WorkspaceService::start(&root, test_config(), host) {
        Ok(service) => service,
        Err(e) if e.to_string().contains("Too many open files") => {
            warn_skip_watcher(&e.to_string());
            return;
        }
        Err(e) => panic!("start service: {e}"),
    };
    wait_until_ready(&service).await;
    let mut updates = service.subscribe_updates();
    applied.lock().unwrap().clear();

    let main = root.join("main.c");
    service
        .documents_shown(vec![main.clone()])
        .await
        .expect("service alive");
    let update = wait_for_update(&mut updates, Duration::from_secs(4), |u| {
        u.affected.is_none() && u.documents == 1
    })
    .await
    .unwrap_or_else(|| panic!("no render (health={:?})", service.health_snapshot()));

    assert_eq!(update.sources, 1);
    assert_eq!(labels(&applied, &main), vec!["64 bytes"]);
    assert!(!applied.lock().unwrap().contains_key(&root.join("util.c")));
}

fn low_fd_limit() -> bool {
    rlimit::Resource::NOFILE
        .get()
        .map(|(soft, _)| soft < 1024)
        .unwrap_or(false)
}

fn ensure_ulimit() {
    if let Ok((_soft, hard)) = rlimit::Resource::NOFILE.get() {
        let target = 2048.min(hard);
        let _ = rlimit::Resource::NOFILE.set(target, hard);
    }
}

fn warn_skip_fd() {
    eprintln!("skipping watcher tests: NOFILE soft limit < 1024");
}

fn warn_skip_watcher(reason: &str) {
    eprintln!("skipping watcher tests: {reason}");
}
