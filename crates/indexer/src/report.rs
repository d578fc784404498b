use crate::error::LineError;
use crate::manifest::ReportUnit;
use crate::StackUsageConfig;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

const FIELD_DELIMITER: char = '\t';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    /// Frame size is a compile-time constant
    Static,
    /// Variable-length frame (alloca, VLA)
    Dynamic,
    /// Dynamic, but the compiler proved an upper bound
    Bounded,
}

impl Qualifier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Bounded => "bounded",
        }
    }
}

impl FromStr for Qualifier {
    type Err = LineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "bounded" => Ok(Self::Bounded),
            other => Err(LineError::UnknownQualifier(other.to_string())),
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One function entry of a stack usage report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Path as reported, canonicalized when it carries a directory
    pub declared_path: String,
    pub line: u32,
    pub column: u32,
    pub signature: String,
    pub bytes: u64,
    pub qualifiers: BTreeSet<Qualifier>,
}

impl UsageRecord {
    pub fn is_dynamic(&self) -> bool {
        self.qualifiers.contains(&Qualifier::Dynamic)
    }
}

/// Inputs for turning reported paths into real ones
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeContext<'a> {
    /// Compile directory; relative reported paths are resolved against it
    pub base_dir: Option<&'a Path>,
    /// Real path of the translation unit, substituted for bare file names
    pub fallback: Option<&'a Path>,
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<path>.+?):(?P<line>\d+):(?P<column>\d+):(?P<signature>.*)$")
            .expect("identifier pattern is valid")
    })
}

/// Splits `path:line:column:signature`; the path is the shortest prefix
/// followed by two pure digit runs.
pub fn parse_identifier(identifier: &str) -> Option<(&str, u32, u32, &str)> {
    let caps = identifier_regex().captures(identifier)?;
    let line = caps.name("line")?.as_str().parse().ok()?;
    let column = caps.name("column")?.as_str().parse().ok()?;
    Some((
        caps.name("path")?.as_str(),
        line,
        column,
        caps.name("signature")?.as_str(),
    ))
}

/// A blank field has no qualifiers; an empty token inside a list is unknown.
pub fn parse_qualifiers(field: &str) -> Result<BTreeSet<Qualifier>, LineError> {
    if field.trim().is_empty() {
        return Err(LineError::NoQualifiers);
    }
    field
        .split(',')
        .map(|token| token.trim().parse::<Qualifier>())
        .collect()
}

/// Parses one non-blank report line. The declared path is left as written.
pub fn parse_line(line: &str) -> Result<UsageRecord, LineError> {
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    let [identifier, bytes, qualifiers] = fields.as_slice() else {
        return Err(LineError::FieldCount(fields.len()));
    };

    let (path, line, column, signature) = parse_identifier(identifier)
        .ok_or_else(|| LineError::Identifier((*identifier).to_string()))?;
    let bytes = bytes
        .trim()
        .parse::<u64>()
        .map_err(|_| LineError::ByteCount((*bytes).to_string()))?;
    let qualifiers = parse_qualifiers(qualifiers)?;

    Ok(UsageRecord {
        declared_path: path.to_string(),
        line,
        column,
        signature: signature.to_string(),
        bytes,
        qualifiers,
    })
}

/// Parses report text, dropping (and logging) malformed lines.
pub fn parse_report(content: &str) -> Vec<UsageRecord> {
    let mut records = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!("Dropping report line {}: {err}", idx + 1),
        }
    }
    records
}

fn has_separator(path: &str) -> bool {
    path.chars().any(std::path::is_separator)
}

/// Resolves every record's declared path in place.
///
/// Paths with a separator become canonical real paths (symlinks followed);
/// when canonicalization fails the path is kept as written. Bare source
/// file names are replaced by `ctx.fallback` when one is given.
pub async fn normalize_records(
    records: &mut [UsageRecord],
    ctx: NormalizeContext<'_>,
    config: &StackUsageConfig,
) {
    for record in records.iter_mut() {
        if has_separator(&record.declared_path) {
            let declared = Path::new(&record.declared_path);
            let candidate = match ctx.base_dir {
                Some(base) if declared.is_relative() => base.join(declared),
                _ => declared.to_path_buf(),
            };
            match tokio::fs::canonicalize(&candidate).await {
                Ok(real) => record.declared_path = real.to_string_lossy().into_owned(),
                Err(err) => debug!(
                    "Keeping unresolved path {} ({err})",
                    candidate.display()
                ),
            }
        } else if config.is_source_name(&record.declared_path) {
            if let Some(fallback) = ctx.fallback {
                record.declared_path = fallback.to_string_lossy().into_owned();
            }
        }
    }
}

/// Reads and parses one report file. A report that cannot be opened yields
/// no records.
pub async fn read_report(
    path: &Path,
    ctx: NormalizeContext<'_>,
    config: &StackUsageConfig,
) -> Vec<UsageRecord> {
    info!("Reading {}", path.display());
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            warn!("Reading {} failed: {err}", path.display());
            return Vec::new();
        }
    };
    let mut records = parse_report(&content);
    normalize_records(&mut records, ctx, config).await;
    records
}

/// Canonical path of the record's translation unit, if it exists
pub async fn fallback_real_path(source: &Path) -> Option<PathBuf> {
    tokio::fs::canonicalize(source).await.ok()
}

/// Reads the report of one manifest unit with its compile directory as the
/// base and the unit's real source path as the bare-name fallback.
pub async fn read_unit(unit: &ReportUnit, config: &StackUsageConfig) -> Vec<UsageRecord> {
    let fallback = fallback_real_path(&unit.source_path).await;
    read_report(
        &unit.report_path,
        NormalizeContext {
            base_dir: Some(&unit.directory),
            fallback: fallback.as_deref(),
        },
        config,
    )
    .await
}
