use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imagescan::{
    cache::Cache,
    config::Config,
    isolation::CacheIsolationManager,
    model::{BatchResult, Progress, ToolRecord, ToolState},
    output::{print_batch_result, print_cache_report, print_dry_run, CacheReport, OutputFormat},
    resolver::ImageResolver,
    scan_cache::{FailedScanCache, UnscannableRegistry},
    Interrupt, JsonCatalogStore, ScanOrchestrator, ScannerInvoker, TrivyScanner,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Exit codes for CI integration
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const SCAN_FAILURES: u8 = 2;
    pub const INTERRUPTED: u8 = 130;
}

#[derive(Parser)]
#[command(name = "imagescan")]
#[command(
    author,
    version,
    about = "Scan the container images of a tool catalog for vulnerabilities"
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SelectionArgs {
    /// Catalog file (defaults to the configured catalog)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Only consider these tool ids
    #[arg(long = "tool")]
    tools: Vec<String>,

    /// Scan at most this many tools that are due
    #[arg(short, long)]
    limit: Option<usize>,

    /// Rescan tools with fresh results and ignore recently failed scans
    #[arg(long)]
    force: bool,

    /// Tag used for tools without tag data
    #[arg(long)]
    tag: Option<String>,

    /// Output format (table, json)
    #[arg(short, long)]
    format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan catalog images that are due
    Scan {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Maximum number of scans in flight
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Per-scan timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Reuse this scanner cache directory instead of a fresh one per batch
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Show what would be scanned without scanning
        #[arg(long)]
        dry_run: bool,

        /// Exit with an error if any scan failed
        #[arg(long)]
        fail_on_error: bool,
    },

    /// Show what a scan would do
    DryRun {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Inspect or clear remembered scan failures
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List failed and unscannable images
    List {
        /// Output format (table, json)
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Forget remembered failures
    Clear {
        /// Only clear entries for this tool id
        #[arg(long)]
        tool: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "imagescan=debug"
    } else {
        "imagescan=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // stdout carries results; keep it clean for --format json.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = Config::load()?;

    match cli.command {
        Commands::Scan {
            selection,
            concurrency,
            timeout,
            cache_dir,
            dry_run,
            fail_on_error,
        } => {
            if dry_run {
                return run_dry_run(&config, selection);
            }
            let mut config = config;
            if let Some(secs) = timeout {
                config.scan.timeout_secs = secs;
            }
            let concurrency = concurrency.unwrap_or(config.scan.concurrency);
            run_scan(&config, selection, concurrency, cache_dir, fail_on_error).await
        }
        Commands::DryRun { selection } => run_dry_run(&config, selection),
        Commands::Cache { action } => {
            handle_cache(&config, action)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

async fn run_scan(
    config: &Config,
    selection: SelectionArgs,
    concurrency: usize,
    cache_dir: Option<PathBuf>,
    fail_on_error: bool,
) -> Result<u8> {
    let format = output_format(selection.format.as_deref(), config)?;
    let is_interactive = format == OutputFormat::Table;

    let scanner = TrivyScanner::new(
        config.scan.scanner_path.clone(),
        config.scan.docker_path.clone(),
    );
    if !scanner.is_installed() {
        anyhow::bail!(
            "scanner '{}' not found in PATH. Install Trivy: https://aquasecurity.github.io/trivy/",
            config.scan.scanner_path.display()
        );
    }

    let (store, tools) = load_catalog(config, selection.catalog.as_ref())?;
    let orchestrator = build_orchestrator(config, scanner, store, cache_dir, &selection);
    let tools = select(&orchestrator, tools, &selection);

    if tools.is_empty() {
        match format {
            OutputFormat::Json => print_batch_result(&BatchResult::default(), format)?,
            OutputFormat::Table => println!("No tools to scan."),
        }
        return Ok(exit_codes::SUCCESS);
    }

    // First Ctrl-C drains the batch; a second one aborts scans in flight.
    let interrupt = orchestrator.interrupt();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if should_abort(&interrupt) {
                warn!("second interrupt, aborting");
                std::process::exit(exit_codes::INTERRUPTED.into());
            }
            warn!("interrupt received, finishing scans in flight (Ctrl-C again to abort)");
        }
    });

    let progress = if is_interactive {
        let pb = ProgressBar::new(tools.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let on_progress = |p: &Progress| {
        if let Some(pb) = &progress {
            pb.set_position(p.completed as u64);
            match p.state {
                ToolState::Retry => pb.set_message(format!("{} (retrying)", p.tool_id)),
                _ => pb.set_message(p.tool_id.clone()),
            }
        }
    };
    let result = orchestrator
        .scan_batch(&tools, concurrency, selection.force, on_progress)
        .await?;

    if let Some(pb) = progress {
        pb.finish_with_message(format!(
            "{} scanned, {} failed",
            result.succeeded, result.failed
        ));
    }

    print_batch_result(&result, format)?;
    Ok(determine_exit_code(&result, fail_on_error))
}

/// Handles one Ctrl-C: the first stops dispatching, a repeat asks for an abort.
fn should_abort(interrupt: &Interrupt) -> bool {
    if interrupt.is_triggered() {
        return true;
    }
    interrupt.trigger();
    false
}

fn run_dry_run(config: &Config, selection: SelectionArgs) -> Result<u8> {
    let format = output_format(selection.format.as_deref(), config)?;
    let (store, tools) = load_catalog(config, selection.catalog.as_ref())?;
    let orchestrator =
        build_orchestrator(config, TrivyScanner::default(), store, None, &selection);
    let tools = select(&orchestrator, tools, &selection);

    let plan = orchestrator.dry_run(&tools, selection.force);
    print_dry_run(&plan, format)?;
    Ok(exit_codes::SUCCESS)
}

fn load_catalog(
    config: &Config,
    catalog: Option<&PathBuf>,
) -> Result<(Arc<JsonCatalogStore>, Vec<ToolRecord>)> {
    let path = catalog.cloned().unwrap_or_else(|| config.catalog_path());
    let store = Arc::new(JsonCatalogStore::new(path));
    let tools = store
        .load()
        .with_context(|| format!("failed to load catalog {}", store.path().display()))?;
    Ok((store, tools))
}

fn scan_caches(config: &Config) -> (FailedScanCache, UnscannableRegistry) {
    let cache = Cache::at(config.scan_state_dir());
    let failed = FailedScanCache::new(cache.clone(), config.scan.failed_scan_ttl());
    let registry = UnscannableRegistry::new(cache, config.scan.unscannable_ttl())
        .with_static_ids(config.scan.unscannable_images.iter().cloned());
    (failed, registry)
}

fn build_orchestrator(
    config: &Config,
    scanner: TrivyScanner,
    store: Arc<JsonCatalogStore>,
    cache_dir: Option<PathBuf>,
    selection: &SelectionArgs,
) -> ScanOrchestrator {
    let settings = &config.scan;
    let invoker = ScannerInvoker::new(Arc::new(scanner))
        .with_timeout(settings.timeout())
        .with_remote_first(settings.try_remote_first);
    let isolation = match cache_dir {
        Some(dir) => CacheIsolationManager::reusing(dir),
        None => CacheIsolationManager::new(config.scan_cache_root()),
    }
    .with_stale_lock_age(settings.stale_lock_age());
    let default_tag = selection.tag.as_deref().unwrap_or(&settings.default_tag);
    let (failed, registry) = scan_caches(config);

    ScanOrchestrator::new(invoker, store, isolation, failed, registry)
        .with_resolver(ImageResolver::new(default_tag))
        .with_retry_policy(settings.retry_policy())
        .with_staleness(settings.staleness())
        .with_escalation_threshold(settings.infrastructure_escalation_threshold)
}

/// Applies `--tool` and `--limit`. The limit counts only tools that are due,
/// so already scanned tools do not use it up.
fn select(
    orchestrator: &ScanOrchestrator,
    tools: Vec<ToolRecord>,
    selection: &SelectionArgs,
) -> Vec<ToolRecord> {
    let tools: Vec<ToolRecord> = if selection.tools.is_empty() {
        tools
    } else {
        tools
            .into_iter()
            .filter(|t| selection.tools.contains(&t.id))
            .collect()
    };

    match selection.limit {
        Some(limit) => orchestrator
            .select_for_scan(&tools, selection.force)
            .into_iter()
            .take(limit)
            .cloned()
            .collect(),
        None => tools,
    }
}

fn output_format(flag: Option<&str>, config: &Config) -> Result<OutputFormat> {
    OutputFormat::from_str(flag.unwrap_or(&config.default_format)).map_err(|e| anyhow::anyhow!(e))
}

fn determine_exit_code(result: &BatchResult, fail_on_error: bool) -> u8 {
    if result.interrupted {
        exit_codes::INTERRUPTED
    } else if fail_on_error && (result.failed > 0 || result.persist_errors > 0) {
        exit_codes::SCAN_FAILURES
    } else {
        exit_codes::SUCCESS
    }
}

fn handle_cache(config: &Config, action: CacheAction) -> Result<()> {
    let (failed, registry) = scan_caches(config);

    match action {
        CacheAction::List { format } => {
            let format = output_format(format.as_deref(), config)?;
            let report = CacheReport {
                failed_scans: failed.entries()?,
                unscannable: registry.entries()?,
                static_unscannable: config.scan.unscannable_images.clone(),
            };
            print_cache_report(&report, format)?;
        }
        CacheAction::Clear { tool: Some(id) } => {
            let cleared_failure = failed.clear_failure(&id)?;
            let cleared_registry = registry.clear_unscannable(&id)?;
            if cleared_failure || cleared_registry {
                println!("Cleared cached scan state for {}.", id);
            } else {
                println!("No cached scan state for {}.", id);
            }
            if config.scan.unscannable_images.contains(&id) {
                println!("Note: {} is excluded by configuration (scan.unscannable_images).", id);
            }
        }
        CacheAction::Clear { tool: None } => {
            failed.clear_all()?;
            registry.clear_all()?;
            println!("Scan caches cleared.");
        }
    }
    Ok(())
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'imagescan config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}
