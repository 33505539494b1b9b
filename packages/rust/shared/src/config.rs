//! Application configuration for recsync.
//!
//! User config lives at `~/.recsync/recsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecsyncError, Result};
use crate::types::DEFAULT_DETAIL_SUFFIX;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "recsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".recsync";

// ---------------------------------------------------------------------------
// Config structs (matching recsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Record set and retry policy.
    #[serde(default)]
    pub run: RunSection,

    /// Where artifacts are written.
    #[serde(default)]
    pub output: OutputConfig,

    /// Record source endpoints.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Flat-file settings store location.
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Primary recipient whose records are enumerated first.
    #[serde(default)]
    pub recipient: String,

    /// Additional recipients, processed in order after the primary one.
    #[serde(default)]
    pub extra_recipients: Vec<String>,

    /// Explicit record-ids; when non-empty they replace each recipient's basic list.
    #[serde(default)]
    pub record_ids: Vec<String>,

    /// Retries after the first pass.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry pass, doubled on each later pass.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for the delay between passes.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Artifact column holding the recipient half of the identity.
    #[serde(default = "default_recipient_column")]
    pub recipient_column: String,

    /// Artifact column holding the record-id half of the identity.
    #[serde(default = "default_record_id_column")]
    pub record_id_column: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            extra_recipients: Vec::new(),
            record_ids: Vec::new(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            recipient_column: default_recipient_column(),
            record_id_column: default_record_id_column(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_recipient_column() -> String {
    "Email".into()
}
fn default_record_id_column() -> String {
    "Application Number".into()
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output folder for the artifact and the results directory.
    #[serde(default = "default_output_dir")]
    pub dir: String,

    /// Artifact file name, reused across runs.
    #[serde(default = "default_artifact_file")]
    pub artifact_file: String,

    /// Filtered exports directory, relative to `dir`.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            artifact_file: default_artifact_file(),
            results_dir: default_results_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "~/Documents".into()
}
fn default_artifact_file() -> String {
    "record_list.csv".into()
}
fn default_results_dir() -> String {
    "Results".into()
}

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Portal root URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Basic list path template; `{recipient}` is substituted.
    #[serde(default = "default_list_path")]
    pub list_path: String,

    /// Detail page path template; `{record_id}` is substituted.
    #[serde(default = "default_detail_path")]
    pub detail_path: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Suffix appended to detail field labels.
    #[serde(default = "default_detail_suffix")]
    pub detail_suffix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            list_path: default_list_path(),
            detail_path: default_detail_path(),
            timeout_secs: default_timeout_secs(),
            detail_suffix: default_detail_suffix(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}
fn default_list_path() -> String {
    "/records?recipient={recipient}".into()
}
fn default_detail_path() -> String {
    "/records/{record_id}".into()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_detail_suffix() -> String {
    DEFAULT_DETAIL_SUFFIX.into()
}

/// `[settings]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Directory for column visibility, filters, and default headers.
    /// Empty means `~/.recsync/settings`.
    #[serde(default)]
    pub dir: String,
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime run configuration, merged from config file + CLI flags.
///
/// Passed by value into the run controller; nothing reads ambient state.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Recipients in processing order, deduplicated.
    pub recipients: Vec<String>,
    /// Explicit record-ids (empty = use each recipient's basic list).
    pub record_ids: Vec<String>,
    /// Retries after the first pass (`max_retries + 1` passes in total).
    pub max_retries: u32,
    /// Delay before the first retry pass.
    pub backoff_base: Duration,
    /// Upper bound for the delay between passes.
    pub backoff_max: Duration,
    /// Identity column for the recipient.
    pub recipient_column: String,
    /// Identity column for the record-id.
    pub record_id_column: String,
    /// Reserved suffix of detail columns.
    pub detail_suffix: String,
    /// Artifact path (read-modify-write target).
    pub artifact_path: PathBuf,
    /// Directory for filtered exports.
    pub results_dir: PathBuf,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        let output_dir = expand_home(&config.output.dir);
        let mut recipients = Vec::new();
        push_recipients(
            &mut recipients,
            std::iter::once(&config.run.recipient).chain(config.run.extra_recipients.iter()),
        );

        Self {
            recipients,
            record_ids: config
                .run
                .record_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            max_retries: config.run.max_retries,
            backoff_base: Duration::from_millis(config.run.backoff_base_ms),
            backoff_max: Duration::from_millis(config.run.backoff_max_ms),
            recipient_column: config.run.recipient_column.clone(),
            record_id_column: config.run.record_id_column.clone(),
            detail_suffix: config.agent.detail_suffix.clone(),
            artifact_path: output_dir.join(&config.output.artifact_file),
            results_dir: output_dir.join(&config.output.results_dir),
        }
    }
}

impl RunConfig {
    /// Replace the recipient list (trimmed, blank and duplicate entries dropped).
    pub fn set_recipients<'a>(&mut self, recipients: impl IntoIterator<Item = &'a String>) {
        self.recipients.clear();
        push_recipients(&mut self.recipients, recipients);
    }

    /// Check the config is usable before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(RecsyncError::config(
                "no recipient configured; set [run].recipient or pass --recipient",
            ));
        }
        if self.recipient_column.trim().is_empty() || self.record_id_column.trim().is_empty() {
            return Err(RecsyncError::config("identity column names must not be empty"));
        }
        if self.recipient_column == self.record_id_column {
            return Err(RecsyncError::config(format!(
                "recipient and record-id columns must differ (both are '{}')",
                self.recipient_column
            )));
        }
        if self.backoff_base > self.backoff_max {
            return Err(RecsyncError::config(
                "backoff_base_ms must not exceed backoff_max_ms",
            ));
        }
        Ok(())
    }
}

fn push_recipients<'a>(out: &mut Vec<String>, recipients: impl IntoIterator<Item = &'a String>) {
    for recipient in recipients {
        let recipient = recipient.trim();
        if !recipient.is_empty() && !out.iter().any(|r| r == recipient) {
            out.push(recipient.to_string());
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.recsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RecsyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.recsync/recsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Resolve the settings store directory.
    pub fn settings_dir(&self) -> Result<PathBuf> {
        if self.settings.dir.trim().is_empty() {
            Ok(config_dir()?.join("settings"))
        } else {
            Ok(expand_home(&self.settings.dir))
        }
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RecsyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RecsyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RecsyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RecsyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RecsyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
