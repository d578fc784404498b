use crate::index::UsageIndex;
use crate::manifest::{read_manifest, report_units, ReportUnit};
use crate::report::read_unit;
use crate::resolver::{resolve, Resolved};
use crate::{Result, StackUsageConfig};
use log::info;
use std::path::{Path, PathBuf};

/// One-shot view of a workspace: the same chain the watchers run, without
/// any watches.
#[derive(Debug)]
pub struct Snapshot {
    pub root: PathBuf,
    pub manifest: Resolved,
    pub units: Vec<ReportUnit>,
    pub index: UsageIndex,
}

impl Snapshot {
    /// Real manifest path, when one exists
    pub fn manifest_path(&self) -> Option<&Path> {
        self.manifest.path()
    }
}

/// Resolves the manifest of `root`, reads it and every report it names.
///
/// A missing manifest, or a symlink to one not generated yet, yields an
/// empty snapshot; an unreadable or unparsable one is an error.
pub async fn load_snapshot(root: &Path, config: &StackUsageConfig) -> Result<Snapshot> {
    let manifest = resolve(&root.join(&config.manifest_file_name)).await?;
    let mut snapshot = Snapshot {
        root: root.to_path_buf(),
        manifest,
        units: Vec::new(),
        index: UsageIndex::new(),
    };

    let Some(target) = snapshot.manifest.path().map(Path::to_path_buf) else {
        info!("No {} under {}", config.manifest_file_name, root.display());
        return Ok(snapshot);
    };
    if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
        info!("Manifest target {} does not exist yet", target.display());
        return Ok(snapshot);
    }

    let records = read_manifest(&target).await?;
    let manifest_dir = target.parent().unwrap_or(Path::new(""));
    snapshot.units = report_units(&records, manifest_dir, &config.report_extension);
    for unit in &snapshot.units {
        let records = read_unit(unit, config).await;
        snapshot.index.apply(&unit.source_key, records);
    }
    info!(
        "Loaded {} records from {} reports",
        snapshot.index.len(),
        snapshot.units.len()
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndexerError;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_manifest_is_an_empty_snapshot() {
        let temp = TempDir::new().unwrap();
        let snapshot = load_snapshot(temp.path(), &StackUsageConfig::default())
            .await
            .unwrap();
        assert_eq!(snapshot.manifest, Resolved::Missing);
        assert!(snapshot.index.is_empty());
        assert!(snapshot.units.is_empty());
    }

    #[tokio::test]
    async fn reads_every_listed_report() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::write(root.join("a.c"), "int a(void)\n").unwrap();
        std::fs::write(root.join("b.c"), "int b(void)\n").unwrap();
        std::fs::write(root.join("a.su"), "a.c:1:5:int a(void)\t16\tstatic\n").unwrap();
        std::fs::write(
            root.join("b.su"),
            "b.c:1:5:int b(void)\t48\tdynamic,bounded\n",
        )
        .unwrap();
        std::fs::write(
            root.join("compile_commands.json"),
            format!(
                r#"[
                {{"directory": "{dir}", "command": "gcc -o a.o -c a.c", "file": "a.c"}},
                {{"directory": "{dir}", "arguments": ["gcc", "-o", "b.o", "-c", "b.c"], "file": "b.c"}}
            ]"#,
                dir = root.display()
            ),
        )
        .unwrap();

        let snapshot = load_snapshot(&root, &StackUsageConfig::default())
            .await
            .unwrap();
        assert_eq!(snapshot.units.len(), 2);
        assert_eq!(snapshot.index.source_count(), 2);
        let b = root.join("b.c");
        let hits = snapshot.index.query(&b.to_string_lossy());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bytes, 48);
    }

    #[tokio::test]
    async fn unreadable_manifest_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("compile_commands.json"), "{").unwrap();
        let err = load_snapshot(temp.path(), &StackUsageConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ManifestUnreadable { .. }));

        // Exists but cannot be read as a file.
        let other = TempDir::new().unwrap();
        std::fs::create_dir(other.path().join("compile_commands.json")).unwrap();
        let err = load_snapshot(other.path(), &StackUsageConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ManifestUnreadable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_manifest_symlink_is_an_empty_snapshot() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(
            "build/compile_commands.json",
            root.join("compile_commands.json"),
        )
        .unwrap();

        let snapshot = load_snapshot(&root, &StackUsageConfig::default())
            .await
            .unwrap();
        assert_eq!(
            snapshot.manifest_path(),
            Some(root.join("build/compile_commands.json").as_path())
        );
        assert!(snapshot.units.is_empty());
        assert!(snapshot.index.is_empty());
    }
}
