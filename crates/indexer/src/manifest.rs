use crate::{IndexerError, Result};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One compile command from the build manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRecord {
    pub directory: PathBuf,
    pub invocation: String,
    /// Compiled file exactly as the manifest spells it (the index's source key)
    pub source_file: String,
}

/// A report file tracked on behalf of one manifest record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportUnit {
    /// Compiled file as spelled in the manifest
    pub source_key: String,
    pub report_path: PathBuf,
    /// Compile directory of the record
    pub directory: PathBuf,
    /// `directory/source_key`, used for the bare-name fallback
    pub source_path: PathBuf,
}

#[derive(Deserialize)]
struct RawCompileCommand {
    directory: PathBuf,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    file: String,
}

impl ManifestRecord {
    /// Report file name derived from the `-o <name>.o` flag, relative to `directory`
    pub fn report_file_name(&self, report_extension: &str) -> Option<String> {
        report_file_name(&self.invocation, report_extension)
    }

    /// Absolute (or `directory`-relative) location of this record's report
    pub fn report_path(&self, report_extension: &str) -> Option<PathBuf> {
        self.report_file_name(report_extension)
            .map(|name| self.directory.join(name))
    }

    /// Compiled file joined onto the compile directory
    pub fn source_path(&self) -> PathBuf {
        self.directory.join(&self.source_file)
    }

    /// `None` when the invocation carries no `-o <name>.o` flag.
    pub fn report_unit(&self, report_extension: &str) -> Option<ReportUnit> {
        Some(ReportUnit {
            source_key: self.source_file.clone(),
            report_path: self.report_path(report_extension)?,
            directory: self.directory.clone(),
            source_path: self.source_path(),
        })
    }
}

/// Turns manifest records into report units. Relative compile directories
/// are taken relative to `manifest_dir`; records without an output flag are
/// skipped.
pub fn report_units(
    records: &[ManifestRecord],
    manifest_dir: &Path,
    report_extension: &str,
) -> Vec<ReportUnit> {
    let total = records.len();
    records
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| {
            debug!("Processing entry {}/{}", idx + 1, total);
            let unit = if record.directory.is_relative() {
                let mut anchored = record.clone();
                anchored.directory = manifest_dir.join(&record.directory);
                anchored.report_unit(report_extension)
            } else {
                record.report_unit(report_extension)
            };
            if unit.is_none() {
                debug!("No output flag for {}, skipping", record.source_file);
            }
            unit
        })
        .collect()
}

/// Reads and parses the manifest at `path`.
pub async fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| IndexerError::manifest_unreadable(path, err))?;
    parse_manifest(&raw).map_err(|reason| IndexerError::manifest_unreadable(path, reason))
}

pub fn parse_manifest(raw: &str) -> std::result::Result<Vec<ManifestRecord>, String> {
    let commands: Vec<RawCompileCommand> =
        serde_json::from_str(raw).map_err(|err| err.to_string())?;

    let mut records = Vec::with_capacity(commands.len());
    for (idx, cmd) in commands.into_iter().enumerate() {
        let invocation = match (cmd.command, cmd.arguments) {
            (Some(command), _) => command,
            (None, Some(arguments)) => arguments.join(" "),
            (None, None) => {
                return Err(format!(
                    "entry {idx} ({}) has neither `command` nor `arguments`",
                    cmd.file
                ))
            }
        };
        records.push(ManifestRecord {
            directory: cmd.directory,
            invocation,
            source_file: cmd.file,
        });
    }
    debug!("Parsed {} manifest entries", records.len());
    Ok(records)
}

fn output_flag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".+-o (.+)\.o.+").expect("output flag pattern is valid"))
}

/// Extracts the object name from `... -o <name>.o ...` and swaps in the
/// report extension. Greedy on both sides, so the rightmost flag wins.
pub fn report_file_name(invocation: &str, report_extension: &str) -> Option<String> {
    let captures = output_flag_regex().captures(invocation)?;
    let output_name = captures.get(1)?.as_str();
    Some(format!("{output_name}.{report_extension}"))
}
