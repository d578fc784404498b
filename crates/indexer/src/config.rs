use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MANIFEST_ENV: &str = "STACKSCOPE_MANIFEST";
pub const REPORT_EXT_ENV: &str = "STACKSCOPE_REPORT_EXT";
pub const SOURCE_EXTENSIONS_ENV: &str = "STACKSCOPE_SOURCE_EXTENSIONS";

const DEFAULT_SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "c++", "h", "hh", "hpp", "hxx"];

/// Settings shared by every workspace controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackUsageConfig {
    /// Manifest file name looked up in each workspace root
    pub manifest_file_name: String,

    /// Extension of the compiler-emitted stack usage reports (without the dot)
    pub report_extension: String,

    /// Extensions of documents that receive annotations, also used to
    /// recognise bare translation-unit names inside reports
    pub source_extensions: Vec<String>,

    /// Capacity of the raw filesystem event channel
    pub event_buffer: usize,

    /// Poll interval handed to the notify backend (used by the polling fallback)
    #[serde(with = "duration_ms")]
    pub notify_poll_interval: Duration,
}

impl Default for StackUsageConfig {
    fn default() -> Self {
        Self {
            manifest_file_name: "compile_commands.json".to_string(),
            report_extension: "su".to_string(),
            source_extensions: DEFAULT_SOURCE_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
            event_buffer: 1024,
            notify_poll_interval: Duration::from_secs(2),
        }
    }
}

impl StackUsageConfig {
    /// Defaults with `STACKSCOPE_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(name) = env_non_empty(MANIFEST_ENV) {
            config.manifest_file_name = name;
        }
        if let Some(ext) = env_non_empty(REPORT_EXT_ENV) {
            config.report_extension = ext.trim_start_matches('.').to_string();
        }
        if let Some(list) = env_non_empty(SOURCE_EXTENSIONS_ENV) {
            let exts = parse_extension_list(&list);
            if !exts.is_empty() {
                config.source_extensions = exts;
            }
        }
        config
    }

    pub fn is_source_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.source_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    pub fn is_source_name(&self, name: &str) -> bool {
        self.is_source_file(Path::new(name))
    }
}

pub fn parse_extension_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.'))
        .filter(|ext| !ext.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
