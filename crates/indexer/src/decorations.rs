use crate::index::UsageIndex;
use crate::report::{Qualifier, UsageRecord};
use crate::StackUsageConfig;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A document the host currently shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleDocument {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl VisibleDocument {
    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            path: path.into(),
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn line(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(String::as_str)
    }
}

/// Trailing annotation anchored at the end of a line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decoration {
    /// 0-based line index
    pub line: usize,
    pub hover: String,
    pub label: String,
}

/// Host editor boundary: visible documents in, decorations out.
pub trait EditorHost: Send {
    fn visible_documents(&self) -> Vec<VisibleDocument>;

    /// Replaces every stack usage decoration of `document`.
    fn set_decorations(&mut self, document: &Path, decorations: Vec<Decoration>);
}

/// Which documents a publish pass has to touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affected {
    All,
    Paths(BTreeSet<String>),
}

impl Affected {
    /// Whether a document at `real_path` needs re-rendering
    pub fn includes(&self, real_path: &Path) -> bool {
        match self {
            Self::All => true,
            Self::Paths(paths) => {
                paths.contains(&*real_path.to_string_lossy())
                    || file_name_of(real_path).is_some_and(|name| paths.contains(name))
            }
        }
    }

    pub fn path_count(&self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Paths(paths) => Some(paths.len()),
        }
    }
}

fn file_name_of(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Bare function name: text before the first `(`, after the last space or
/// last colon (whichever comes later).
pub fn function_name(signature: &str) -> &str {
    let head = signature
        .find('(')
        .map_or(signature, |idx| &signature[..idx]);
    let start = match (head.rfind(' '), head.rfind(':')) {
        (Some(space), Some(colon)) => space.max(colon) + 1,
        (Some(idx), None) | (None, Some(idx)) => idx + 1,
        (None, None) => 0,
    };
    &head[start..]
}

/// Whether `record` plausibly describes a function declared in `document`.
pub fn record_fits_document(record: &UsageRecord, document: &VisibleDocument) -> bool {
    let Some(idx) = (record.line as usize).checked_sub(1) else {
        return false;
    };
    let Some(text) = document.line(idx) else {
        return false;
    };
    text.contains(function_name(&record.signature))
}

/// Records for a document: exact path matches, plus bare-file-name matches
/// that pass the line check.
pub fn records_for_document<'a>(
    index: &'a UsageIndex,
    real_path: &Path,
    document: &VisibleDocument,
) -> Vec<&'a UsageRecord> {
    let mut records = index.query(&real_path.to_string_lossy());
    if let Some(name) = file_name_of(real_path) {
        records.extend(
            index
                .query(name)
                .into_iter()
                .filter(|record| record_fits_document(record, document)),
        );
    }
    records
}

pub fn decoration_label(record: &UsageRecord) -> String {
    let extra: Vec<&str> = record
        .qualifiers
        .iter()
        .filter(|q| **q != Qualifier::Static)
        .map(|q| q.as_str())
        .collect();
    if extra.is_empty() {
        format!("{} bytes", record.bytes)
    } else {
        format!("{} bytes ({})", record.bytes, extra.join(","))
    }
}

/// Builds decorations, skipping records whose line is outside the document.
pub fn make_decorations(records: &[&UsageRecord], document: &VisibleDocument) -> Vec<Decoration> {
    records
        .iter()
        .filter_map(|record| {
            let line = (record.line as usize).checked_sub(1)?;
            document.line(line)?;
            Some(Decoration {
                line,
                hover: record.signature.clone(),
                label: decoration_label(record),
            })
        })
        .collect()
}

/// Re-derives decorations for every visible source document selected by
/// `affected`. Returns how many documents were updated.
pub async fn publish<H: EditorHost + ?Sized>(
    index: &UsageIndex,
    host: &mut H,
    config: &StackUsageConfig,
    affected: &Affected,
) -> usize {
    let documents = host.visible_documents();
    publish_documents(index, host, config, affected, documents).await
}

/// Same as [`publish`] but restricted to the given documents.
pub async fn publish_documents<H: EditorHost + ?Sized>(
    index: &UsageIndex,
    host: &mut H,
    config: &StackUsageConfig,
    affected: &Affected,
    documents: Vec<VisibleDocument>,
) -> usize {
    let mut updated = 0usize;
    for document in documents {
        if !config.is_source_file(&document.path) {
            continue;
        }
        let real_path = tokio::fs::canonicalize(&document.path)
            .await
            .unwrap_or_else(|_| document.path.clone());
        if !affected.includes(&real_path) {
            continue;
        }
        let records = records_for_document(index, &real_path, &document);
        info!(
            "Decorating {}: {} (total: {})",
            real_path.display(),
            records.len(),
            index.len()
        );
        let decorations = make_decorations(&records, &document);
        host.set_decorations(&document.path, decorations);
        updated += 1;
    }
    debug!(
        "Published {updated} document(s) for {} affected path(s)",
        affected
            .path_count()
            .map_or_else(|| "all".to_string(), |n| n.to_string())
    );
    updated
}
