//! # Stackscope Indexer
//!
//! Keeps per-function stack usage figures (GCC `-fstack-usage` reports)
//! attached to the source documents an editor shows.
//!
//! ## Pipeline
//!
//! ```text
//! <root>/compile_commands.json      tier A: manifest location
//!     │
//!     ├──> resolve symlink
//!     │      └─> real manifest      tier B: manifest target
//!     │
//!     ├──> read manifest
//!     │      └─> one .su per entry  tier C: report watches
//!     │
//!     └──> parse report ──> UsageIndex::apply ──> publish affected documents
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use stackscope_indexer::{load_snapshot, StackUsageConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> stackscope_indexer::Result<()> {
//!     let config = StackUsageConfig::from_env();
//!     let snapshot = load_snapshot(Path::new("/path/to/project"), &config).await?;
//!
//!     for record in snapshot.index.query("/path/to/project/src/main.c") {
//!         println!("{}: {} bytes", record.signature, record.bytes);
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod controller;
mod decorations;
mod disposables;
mod error;
mod fs_watch;
mod index;
mod manifest;
mod report;
mod resolver;
mod snapshot;
mod watcher;

pub use config::{
    parse_extension_list, StackUsageConfig, MANIFEST_ENV, REPORT_EXT_ENV, SOURCE_EXTENSIONS_ENV,
};
pub use controller::{PublishUpdate, TierCounts, WorkspaceController};
pub use decorations::{
    decoration_label, function_name, make_decorations, publish, publish_documents,
    record_fits_document, records_for_document, Affected, Decoration, EditorHost,
    VisibleDocument,
};
pub use disposables::{Disposable, DisposableContainer, DisposableSlot};
pub use error::{IndexerError, LineError, Result};
pub use fs_watch::{FsWatchBackend, WatchBackend, WatchHandle, WatchRoute};
pub use index::{SourceEntry, UsageIndex};
pub use manifest::{
    parse_manifest, read_manifest, report_file_name, report_units, ManifestRecord, ReportUnit,
};
pub use report::{
    fallback_real_path, normalize_records, parse_identifier, parse_line, parse_qualifiers,
    parse_report, read_report, read_unit, NormalizeContext, Qualifier, UsageRecord,
};
pub use resolver::{normalize_lexically, resolve, Resolved};
pub use snapshot::{load_snapshot, Snapshot};
pub use watcher::{WorkspaceHealth, WorkspaceService};
