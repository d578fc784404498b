use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use console::ConsoleHost;
use log::{info, warn};
use stackscope_indexer::{
    load_snapshot, parse_extension_list, publish, read_report, Affected, NormalizeContext,
    StackUsageConfig, WorkspaceService,
};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod console;
mod render;

pub(crate) fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "stackscope")]
#[command(about = "Per-function stack usage annotations from GCC -fstack-usage reports", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Manifest file name looked up in each root (env: STACKSCOPE_MANIFEST)
    #[arg(long, global = true)]
    manifest_name: Option<String>,

    /// Report file extension (env: STACKSCOPE_REPORT_EXT)
    #[arg(long, global = true)]
    report_ext: Option<String>,

    /// Comma separated source extensions (env: STACKSCOPE_SOURCE_EXTENSIONS)
    #[arg(long, global = true)]
    source_ext: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch workspace roots and print decorations as reports change
    Watch(WatchArgs),

    /// Print the decorations of one source file
    Annotate(AnnotateArgs),

    /// Parse a single stack usage report
    Report(ReportArgs),

    /// Show manifest resolution and the reports it names
    Manifest(ManifestArgs),

    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct WatchArgs {
    /// Workspace roots
    #[arg(default_value = ".", num_args = 1..)]
    roots: Vec<PathBuf>,

    /// Files to treat as visible documents (repeatable)
    #[arg(long = "show", short = 's')]
    show: Vec<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Output JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AnnotateArgs {
    /// Workspace root holding the manifest
    root: PathBuf,

    /// Source file to annotate
    file: PathBuf,

    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReportArgs {
    /// Report file (.su)
    file: PathBuf,

    /// Compile directory for relative paths (default: the report's directory)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ManifestArgs {
    /// Workspace root holding the manifest
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn json_output(&self) -> bool {
        match &self.command {
            Commands::Watch(args) => args.json,
            Commands::Annotate(args) => args.json,
            Commands::Report(args) => args.json,
            Commands::Manifest(args) => args.json,
            Commands::Config(args) => args.json,
        }
    }

    /// Environment first, then flags on top
    fn config(&self) -> StackUsageConfig {
        let mut config = StackUsageConfig::from_env();
        if let Some(name) = &self.manifest_name {
            config.manifest_file_name = name.clone();
        }
        if let Some(ext) = &self.report_ext {
            config.report_extension = ext.trim_start_matches('.').to_string();
        }
        if let Some(list) = &self.source_ext {
            let exts = parse_extension_list(list);
            if !exts.is_empty() {
                config.source_extensions = exts;
            }
        }
        config
    }
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // Keep stdout clean for JSON consumers
    if cli.json_output() {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config = cli.config();
    match cli.command {
        Commands::Watch(args) => run_watch(args, config).await?,
        Commands::Annotate(args) => run_annotate(args, config).await?,
        Commands::Report(args) => run_report(args, config).await?,
        Commands::Manifest(args) => run_manifest(args, config).await?,
        Commands::Config(args) => run_config(&args, &config)?,
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

/// Assigns each shown file to the first root containing it; files outside
/// every root go to the first root.
fn files_per_root(roots: &[PathBuf], files: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let mut assigned = vec![Vec::new(); roots.len()];
    for file in files {
        let slot = roots
            .iter()
            .position(|root| file.starts_with(root))
            .unwrap_or(0);
        if let Some(bucket) = assigned.get_mut(slot) {
            bucket.push(file.clone());
        }
    }
    assigned
}

async fn run_watch(args: WatchArgs, config: StackUsageConfig) -> Result<()> {
    let roots = args
        .roots
        .iter()
        .map(|root| absolute(root))
        .collect::<Result<Vec<_>>>()?;
    for root in &roots {
        if !root.is_dir() {
            bail!("Not a directory: {}", root.display());
        }
    }
    let files = args
        .show
        .iter()
        .map(|file| absolute(file))
        .collect::<Result<Vec<_>>>()?;

    let mut services = Vec::with_capacity(roots.len());
    for (root, files) in roots.iter().zip(files_per_root(&roots, &files)) {
        let host = ConsoleHost::new(files, args.json);
        let service = WorkspaceService::start(root.clone(), config.clone(), host)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        info!("Watching {}", root.display());
        services.push(service);
    }

    match args.timeout_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl-C")?,
    }

    for service in &services {
        let health = service.health_snapshot();
        info!(
            "{}: {} records from {} sources",
            service.root().display(),
            health.records,
            health.sources
        );
        if let Some(err) = health.last_error {
            warn!("{}: last error: {err}", service.root().display());
        }
    }
    Ok(())
}

async fn run_annotate(args: AnnotateArgs, config: StackUsageConfig) -> Result<()> {
    let root = absolute(&args.root)?;
    let file = absolute(&args.file)?;
    if !file.is_file() {
        bail!("Not a file: {}", file.display());
    }
    let snapshot = load_snapshot(&root, &config)
        .await
        .with_context(|| format!("Failed to load stack usage for {}", root.display()))?;

    let mut host = ConsoleHost::new(vec![file.clone()], args.json);
    let updated = publish(&snapshot.index, &mut host, &config, &Affected::All).await;
    if updated == 0 {
        warn!(
            "{} is not a source file (extensions: {})",
            file.display(),
            config.source_extensions.join(",")
        );
    }
    Ok(())
}

async fn run_report(args: ReportArgs, config: StackUsageConfig) -> Result<()> {
    let file = absolute(&args.file)?;
    if !file.is_file() {
        bail!("Report not found: {}", file.display());
    }
    let base_dir = match &args.base_dir {
        Some(dir) => Some(absolute(dir)?),
        None => file.parent().map(Path::to_path_buf),
    };
    let records = read_report(
        &file,
        NormalizeContext {
            base_dir: base_dir.as_deref(),
            fallback: None,
        },
        &config,
    )
    .await;

    if args.json {
        print_stdout(&serde_json::to_string_pretty(&records)?)?;
    } else {
        print_stdout(&render::render_records(&records))?;
    }
    Ok(())
}

async fn run_manifest(args: ManifestArgs, config: StackUsageConfig) -> Result<()> {
    let root = absolute(&args.root)?;
    let snapshot = load_snapshot(&root, &config)
        .await
        .with_context(|| format!("Failed to read manifest under {}", root.display()))?;
    let view = render::manifest_view(&snapshot, &config);

    if args.json {
        print_stdout(&serde_json::to_string_pretty(&view)?)?;
    } else {
        print_stdout(render::render_manifest(&view).trim_end())?;
    }
    Ok(())
}

fn run_config(args: &ConfigArgs, config: &StackUsageConfig) -> Result<()> {
    if args.json {
        print_stdout(&serde_json::to_string_pretty(config)?)?;
        return Ok(());
    }
    print_stdout(&format!(
        "manifest_file_name: {}\nreport_extension: {}\nsource_extensions: {}\nevent_buffer: {}\nnotify_poll_interval_ms: {}",
        config.manifest_file_name,
        config.report_extension,
        config.source_extensions.join(","),
        config.event_buffer,
        config.notify_poll_interval.as_millis()
    ))
}
