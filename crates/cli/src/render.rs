use serde::Serialize;
use stackscope_indexer::{Resolved, Snapshot, StackUsageConfig, UsageRecord};
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct ManifestView {
    pub root: PathBuf,
    pub location: PathBuf,
    /// `symlink`, `file` or `missing`
    pub resolution: &'static str,
    pub target: Option<PathBuf>,
    pub units: Vec<UnitView>,
    pub records: usize,
}

#[derive(Debug, Serialize)]
pub struct UnitView {
    pub source_key: String,
    pub report_path: PathBuf,
    pub report_exists: bool,
    pub records: usize,
}

pub fn manifest_view(snapshot: &Snapshot, config: &StackUsageConfig) -> ManifestView {
    let resolution = match &snapshot.manifest {
        Resolved::Real(_) => "symlink",
        Resolved::NotASymlink(_) => "file",
        Resolved::Missing => "missing",
    };
    let units = snapshot
        .units
        .iter()
        .map(|unit| UnitView {
            source_key: unit.source_key.clone(),
            report_path: unit.report_path.clone(),
            report_exists: unit.report_path.is_file(),
            records: snapshot
                .index
                .entry(&unit.source_key)
                .map_or(0, |entry| entry.records.len()),
        })
        .collect();
    ManifestView {
        root: snapshot.root.clone(),
        location: snapshot.root.join(&config.manifest_file_name),
        resolution,
        target: snapshot.manifest_path().map(PathBuf::from),
        units,
        records: snapshot.index.len(),
    }
}

pub fn render_manifest(view: &ManifestView) -> String {
    let mut out = String::new();
    out.push_str(&format!("Manifest: {} ({})\n", view.location.display(), view.resolution));
    if let Some(target) = &view.target {
        out.push_str(&format!("Target:   {}\n", target.display()));
    }
    if view.units.is_empty() {
        out.push_str("No reports.\n");
        return out;
    }
    out.push_str(&format!(
        "Reports:  {} ({} records)\n",
        view.units.len(),
        view.records
    ));
    for unit in &view.units {
        let status = if unit.report_exists {
            format!("{} records", unit.records)
        } else {
            "missing".to_string()
        };
        out.push_str(&format!(
            "  {} -> {} [{status}]\n",
            unit.source_key,
            unit.report_path.display()
        ));
    }
    out
}

pub fn render_records(records: &[UsageRecord]) -> String {
    if records.is_empty() {
        return "No records.".to_string();
    }
    records
        .iter()
        .map(|record| {
            let qualifiers: Vec<&str> = record.qualifiers.iter().map(|q| q.as_str()).collect();
            format!(
                "{}:{}:{}\t{}\t{}\t{}",
                record.declared_path,
                record.line,
                record.column,
                record.bytes,
                qualifiers.join(","),
                record.signature
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
