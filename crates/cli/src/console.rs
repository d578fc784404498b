use crate::print_stdout;
use log::warn;
use serde::Serialize;
use stackscope_indexer::{Decoration, EditorHost, VisibleDocument};
use std::path::{Path, PathBuf};

/// Host that "shows" a fixed set of files and prints decorations to stdout.
///
/// Files are re-read on every call so edits on disk are picked up.
pub struct ConsoleHost {
    files: Vec<PathBuf>,
    json: bool,
}

#[derive(Serialize)]
struct DocumentDecorations<'a> {
    document: &'a Path,
    decorations: &'a [Decoration],
}

impl ConsoleHost {
    pub fn new(files: Vec<PathBuf>, json: bool) -> Self {
        Self { files, json }
    }

    fn render(&self, document: &Path, decorations: &[Decoration]) -> String {
        if self.json {
            return serde_json::to_string(&DocumentDecorations {
                document,
                decorations,
            })
            .unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"));
        }
        if decorations.is_empty() {
            return format!("{}: no stack usage data", document.display());
        }
        decorations
            .iter()
            .map(|d| {
                format!(
                    "{}:{}: {:<24} {}",
                    document.display(),
                    d.line + 1,
                    d.label,
                    d.hover
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl EditorHost for ConsoleHost {
    fn visible_documents(&self) -> Vec<VisibleDocument> {
        self.files
            .iter()
            .filter_map(|path| match std::fs::read_to_string(path) {
                Ok(text) => Some(VisibleDocument::from_text(path.clone(), &text)),
                Err(err) => {
                    warn!("Cannot show {}: {err}", path.display());
                    None
                }
            })
            .collect()
    }

    fn set_decorations(&mut self, document: &Path, decorations: Vec<Decoration>) {
        if let Err(err) = print_stdout(&self.render(document, &decorations)) {
            warn!("Failed to print decorations for {}: {err}", document.display());
        }
    }
}
