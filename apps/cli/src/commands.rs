//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use recsync_core::{
    ExportReport, ProgressObserver, RunController, RunReport, RunStatus, export_filtered,
};
use recsync_extraction::{ExtractionAgent, HttpTableAgent};
use recsync_shared::{
    AppConfig, FilterOperator, FilterSetting, ProgressEvent, ProgressLevel, RunConfig,
    expand_home, init_config, is_detail_column, load_config, load_config_from,
};
use recsync_storage::{
    ColumnVisibility, FileSettingsStore, IdentityColumns, RowStore, SettingsStore,
    default_filter_settings, is_visible,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// recsync: reconcile records from an unreliable source into one table.
#[derive(Parser)]
#[command(
    name = "recsync",
    version,
    about = "Fetch records with retries, merge them into a growing CSV table, and export filtered views.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.recsync/recsync.toml.
    #[arg(long, env = "RECSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch every record for the configured recipients and update the artifact.
    Run {
        /// Recipient to process (repeatable). Replaces the configured recipients.
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,

        /// Record-id to fetch (repeatable). Skips the recipient's record list.
        #[arg(long = "record-id")]
        record_ids: Vec<String>,

        /// Output directory (defaults to [output].dir).
        #[arg(short, long)]
        out: Option<String>,

        /// Retries after the first pass.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Write a filtered export when the run completes.
        #[arg(long)]
        export: bool,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export the rows matching the saved filters to a new file.
    Export {
        /// Output directory (defaults to [output].dir).
        #[arg(short, long)]
        out: Option<String>,

        /// Print the export summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage saved filters.
    Filters {
        #[command(subcommand)]
        action: FilterAction,
    },

    /// Manage which columns appear in exports.
    Columns {
        #[command(subcommand)]
        action: ColumnAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Filter subcommands.
#[derive(Subcommand)]
pub(crate) enum FilterAction {
    /// Show every saved filter.
    List,
    /// Set the filter for one column.
    Set {
        /// Column name, as in the artifact header.
        column: String,
        /// NONE, IS, BLANK, CONTAINS, STARTS_WITH, or ENDS_WITH.
        operator: String,
        /// Comparison value (ignored by BLANK).
        #[arg(default_value = "")]
        value: String,
    },
    /// Disable the filter for one column.
    Clear {
        column: String,
    },
    /// Restore the built-in filters (all disabled).
    Reset,
}

/// Column visibility subcommands.
#[derive(Subcommand)]
pub(crate) enum ColumnAction {
    /// List known columns and their visibility.
    List,
    /// Make columns visible.
    Show {
        #[arg(required = true)]
        columns: Vec<String>,
    },
    /// Hide columns.
    Hide {
        #[arg(required = true)]
        columns: Vec<String>,
    },
    /// Make every known column visible.
    ShowAll {
        #[command(flatten)]
        scope: ColumnScope,
    },
    /// Hide every known column.
    HideAll {
        #[command(flatten)]
        scope: ColumnScope,
    },
}

/// Restrict a bulk column change to one namespace.
#[derive(clap::Args)]
#[group(multiple = false)]
pub(crate) struct ColumnScope {
    /// Only base columns (no detail suffix).
    #[arg(long)]
    base: bool,
    /// Only detail columns.
    #[arg(long)]
    detail: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "recsync=info",
        1 => "recsync=debug",
        _ => "recsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        };
    }

    let app = match cli.config.as_deref() {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Run {
            recipients,
            record_ids,
            out,
            max_retries,
            export,
            json,
        } => {
            let mut config = run_config(&app, out.as_deref());
            if !recipients.is_empty() {
                config.set_recipients(&recipients);
            }
            if !record_ids.is_empty() {
                config.record_ids = record_ids
                    .iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect();
            }
            if let Some(n) = max_retries {
                config.max_retries = n;
            }
            cmd_run(&app, config, export, json).await
        }
        Command::Export { out, json } => cmd_export(&app, run_config(&app, out.as_deref()), json),
        Command::Filters { action } => cmd_filters(&app, action),
        Command::Columns { action } => cmd_columns(&app, action),
        Command::Config { .. } => Ok(()),
    }
}

/// Resolve the run config, with `--out` replacing the output directory.
fn run_config(app: &AppConfig, out: Option<&str>) -> RunConfig {
    let mut config = RunConfig::from(app);
    if let Some(out) = out {
        let dir = expand_home(out);
        config.artifact_path = dir.join(&app.output.artifact_file);
        config.results_dir = dir.join(&app.output.results_dir);
    }
    config
}

fn settings_store(app: &AppConfig) -> Result<FileSettingsStore> {
    Ok(FileSettingsStore::new(app.settings_dir()?))
}

// ---------------------------------------------------------------------------
// run / export
// ---------------------------------------------------------------------------

async fn cmd_run(app: &AppConfig, config: RunConfig, export: bool, json: bool) -> Result<()> {
    config.validate()?;

    let settings = Arc::new(settings_store(app)?);
    let agent = HttpTableAgent::new(&app.agent)?;
    let progress = Arc::new(CliProgress::new());

    info!(
        recipients = ?config.recipients,
        artifact = %config.artifact_path.display(),
        "starting sync"
    );

    let mut controller = RunController::new(config, agent, settings, progress.clone());
    let cancel = controller.cancel_token();

    // The run owns a background task; the foreground only waits for Ctrl-C.
    let mut task = tokio::spawn(async move {
        let result = controller.run().await;
        (controller, result)
    });

    let (controller, result) = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            progress.notice("Cancelling after the current record...");
            cancel.cancel();
            task.await?
        }
    };
    let (report, export_report) = finish_run(&controller, &progress, result, export)?;

    if json {
        let value = serde_json::json!({
            "run": report,
            "export": export_report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_run_summary(&report);
        if let Some(export) = export_report {
            println!("  Export:    {} ({} rows)", export.path.display(), export.rows);
            println!();
        }
    }

    Ok(())
}

/// Export (when asked and the run was not aborted) while the spinner is still
/// live, then clear it.
fn finish_run<A: ExtractionAgent>(
    controller: &RunController<A>,
    progress: &CliProgress,
    result: recsync_shared::Result<RunReport>,
    export: bool,
) -> Result<(RunReport, Option<ExportReport>)> {
    let exported = match &result {
        Ok(report) if export && report.status != RunStatus::Aborted => {
            Some(controller.export_filtered())
        }
        _ => None,
    };
    progress.finish();
    let report = result?;
    Ok((report, exported.transpose()?))
}

fn print_run_summary(report: &RunReport) {
    println!();
    println!("  Run {}", report.status);
    println!("  ID:        {}", report.run_id);
    println!("  Artifact:  {}", report.artifact_path.display());
    println!(
        "  Rows:      {} ({} columns, {} new)",
        report.rows,
        report.columns,
        report.new_columns.len()
    );
    println!("  Saved:     {}", report.succeeded());
    println!("  Failed:    {}", report.permanently_failed());
    for recipient in &report.recipients {
        if let Some(err) = &recipient.list_error {
            println!("    - {}: record list unavailable: {err}", recipient.recipient);
        }
        for failure in &recipient.outcome.permanently_failed {
            println!(
                "    - {} / {} ({} attempts): {}",
                recipient.recipient, failure.record_id, failure.attempts, failure.last_error
            );
        }
    }
    if report.status == RunStatus::Aborted {
        println!("  Aborted:   {}", report.aborted());
        for recipient in &report.recipients {
            if !recipient.outcome.aborted.is_empty() {
                println!(
                    "    - {}: {}",
                    recipient.recipient,
                    recipient.outcome.aborted.join(", ")
                );
            }
        }
        if !report.not_started.is_empty() {
            println!("  Not started: {}", report.not_started.join(", "));
        }
    }
    println!("  Time:      {:.1}s", report.elapsed().as_secs_f64());
    println!();
}

fn cmd_export(app: &AppConfig, config: RunConfig, json: bool) -> Result<()> {
    let settings = settings_store(app)?;
    let progress = CliProgress::new();
    let result = export_filtered(&config, &settings, &progress);
    progress.finish();
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("  Export written!");
        println!("  Path:    {}", report.path.display());
        println!("  Rows:    {}", report.rows);
        println!("  Columns: {}", report.columns);
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// filters
// ---------------------------------------------------------------------------

fn cmd_filters(app: &AppConfig, action: FilterAction) -> Result<()> {
    let store = settings_store(app)?;
    let mut filters = store.load_filter_settings();

    match action {
        FilterAction::List => {
            let width = filters.keys().map(String::len).max().unwrap_or(0);
            for (column, setting) in &filters {
                let state = if setting.operator.is_active() { "*" } else { " " };
                println!(
                    "{state} {column:<width$}  {:<12} {}",
                    setting.operator.as_str(),
                    setting.value
                );
            }
            return Ok(());
        }
        FilterAction::Set {
            column,
            operator,
            value,
        } => {
            let parsed: FilterOperator = operator.parse().unwrap_or_default();
            if let FilterOperator::Unknown(name) = &parsed {
                return Err(eyre!(
                    "unknown operator '{name}': expected one of {}",
                    FilterOperator::NAMES.join(", ")
                ));
            }
            info!(column = %column, operator = %parsed, "setting filter");
            filters.insert(column, FilterSetting::new(parsed, value));
        }
        FilterAction::Clear { column } => match filters.get_mut(&column) {
            Some(setting) => *setting = FilterSetting::default(),
            None => return Err(eyre!("no filter configured for column '{column}'")),
        },
        FilterAction::Reset => filters = default_filter_settings(),
    }

    store.save_filter_settings(&filters)?;
    println!("Filters saved to {}", store.dir().display());
    Ok(())
}

// ---------------------------------------------------------------------------
// columns
// ---------------------------------------------------------------------------

fn cmd_columns(app: &AppConfig, action: ColumnAction) -> Result<()> {
    let store = settings_store(app)?;
    let mut visibility = store.load_column_visibility();
    let config = RunConfig::from(app);
    let known = known_columns(&config, &store, &visibility)?;
    let suffix = config.detail_suffix.as_str();

    match action {
        ColumnAction::List => {
            for column in &known {
                let mark = if is_visible(&visibility, column) { "x" } else { " " };
                println!("[{mark}] {column}");
            }
            return Ok(());
        }
        ColumnAction::Show { columns } => set_visible(&mut visibility, columns, true),
        ColumnAction::Hide { columns } => set_visible(&mut visibility, columns, false),
        ColumnAction::ShowAll { scope } => {
            set_visible(&mut visibility, scope.select(known, suffix), true)
        }
        ColumnAction::HideAll { scope } => {
            set_visible(&mut visibility, scope.select(known, suffix), false)
        }
    }

    store.save_column_visibility(&visibility)?;
    println!("Column visibility saved to {}", store.dir().display());
    Ok(())
}

impl ColumnScope {
    fn select(&self, columns: Vec<String>, suffix: &str) -> Vec<String> {
        columns
            .into_iter()
            .filter(|c| {
                let detail = is_detail_column(c, suffix);
                (!self.base || !detail) && (!self.detail || detail)
            })
            .collect()
    }
}

fn set_visible(visibility: &mut ColumnVisibility, columns: Vec<String>, visible: bool) {
    for column in columns {
        visibility.insert(column, visible);
    }
}

/// Artifact header first, then default headers and configured columns not yet in it.
fn known_columns(
    config: &RunConfig,
    store: &FileSettingsStore,
    visibility: &ColumnVisibility,
) -> Result<Vec<String>> {
    let mut columns: Vec<String> = Vec::new();

    if config.artifact_path.exists() {
        let identity = IdentityColumns::new(
            config.recipient_column.clone(),
            config.record_id_column.clone(),
        );
        let artifact = RowStore::load(&config.artifact_path, identity)?;
        columns.extend(artifact.schema().columns().iter().cloned());
    }
    for column in store
        .load_default_headers()
        .into_iter()
        .chain(visibility.keys().cloned())
    {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    Ok(columns)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&std::path::Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Renders progress events with an indicatif spinner.
///
/// Status and success events update the spinner line; warnings and errors are
/// printed above it so they stay visible.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn notice(&self, message: &str) {
        self.spinner.println(format!("  {message}"));
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressObserver for CliProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event.level {
            ProgressLevel::Status | ProgressLevel::Success => {
                self.spinner.set_message(event.message.clone());
            }
            ProgressLevel::Warning | ProgressLevel::Error => {
                self.spinner.println(format!(
                    "[{}] {} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.level,
                    event.message
                ));
            }
        }
    }
}
