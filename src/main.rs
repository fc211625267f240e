//! Quota-Harvest main entry point
//!
//! This is the command-line interface for the Quota-Harvest crawl engine.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use quota_harvest::config::{load_config_with_hash, Config, ModeEntry, ModeKind};
use quota_harvest::crawler::{load_seeds, Coordinator, TimeWindowScheduler};
use quota_harvest::output::{print_report, JsonlSink};
use quota_harvest::session::redact_proxy;
use tracing_subscriber::EnvFilter;

/// Quota-Harvest: a credential-rotating API harvester
///
/// Quota-Harvest crawls paginated JSON APIs with a pool of credentials,
/// cooling down and retiring credentials that keep failing, binding each to
/// a rotating proxy session, and walking time windows and threads until they
/// are exhausted.
#[derive(Parser, Debug)]
#[command(name = "quota-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A credential-rotating API harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Name of the [[mode]] entry to run
    #[arg(value_name = "MODE")]
    mode: String,

    /// File with one seed per line (bare id or JSON object)
    #[arg(long, value_name = "PATH")]
    ids_file: Option<PathBuf>,

    /// JSON pointer to the seed id inside JSON seed lines
    #[arg(long, value_name = "POINTER", requires = "ids_file")]
    seed_field: Option<String>,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long)]
    dry_run: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    let Some(entry) = config.mode(&cli.mode) else {
        let known: Vec<&str> = config.modes.iter().map(|m| m.name.as_str()).collect();
        bail!("Unknown crawl mode '{}' (configured: {})", cli.mode, known.join(", "));
    };

    let seeds = match &cli.ids_file {
        Some(path) => load_seeds(path, cli.seed_field.as_deref())
            .with_context(|| format!("Failed to read seeds from {}", path.display()))?,
        None => entry.seeds.clone(),
    };

    if cli.dry_run {
        handle_dry_run(&config, entry, &seeds);
        return Ok(());
    }

    if seeds.is_empty() {
        bail!("No seeds for mode '{}': pass --ids-file or set seeds in the config", cli.mode);
    }

    handle_crawl(&config, &cli.mode, &seeds).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("quota_harvest=info,warn"),
            1 => EnvFilter::new("quota_harvest=debug,info"),
            2 => EnvFilter::new("quota_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows configuration and the planned crawl
fn handle_dry_run(config: &Config, entry: &ModeEntry, seeds: &[String]) {
    println!("=== Quota-Harvest Dry Run ===\n");

    println!("Engine:");
    println!("  Max in flight: {}", config.engine.max_in_flight);
    println!(
        "  Per lane: {} concurrent, {}ms spacing",
        config.engine.lane_max_concurrent, config.engine.lane_min_spacing_ms
    );
    println!("  Without credentials: {:?}", config.engine.on_no_credential);
    println!("  Request timeout: {}s", config.engine.request_timeout_secs);

    println!("\nCredential Health:");
    println!(
        "  Cooldown after {} consecutive failures, for {}s",
        config.health.failure_threshold + 1,
        config.health.cooldown_secs
    );
    println!(
        "  Retired after {} cooldowns",
        config.health.max_cooldown_cycles
    );

    println!("\nRetry Budgets:");
    println!(
        "  search={} api={} long-text={} empty-page={}",
        config.retry.search, config.retry.api, config.retry.long_text, config.retry.empty_page
    );

    println!("\nCredentials ({}):", config.credentials.len());
    for credential in &config.credentials {
        println!("  - {}", credential.label);
    }

    match &config.proxy {
        Some(proxy) => {
            let endpoint = format!("{}://{}:{}", proxy.scheme, proxy.host, proxy.port);
            println!("\nProxy:");
            println!("  Endpoint: {}", redact_proxy(&endpoint));
            println!("  Rotation: every {}s", proxy.rotation_interval_secs);
        }
        None => println!("\nProxy: none"),
    }

    println!("\nOutput:");
    println!("  Items: {}", config.output.directory.display());
    match &config.telemetry.directory {
        Some(directory) => println!("  Telemetry: {}", directory.display()),
        None => println!("  Telemetry: log only"),
    }

    println!("\nMode '{}' ({:?}):", entry.name, entry.kind);
    for (name, template) in [
        ("listing", &entry.listing_url),
        ("detail", &entry.detail_url),
        ("long text", &entry.long_text_url),
        ("replies", &entry.replies_url),
    ] {
        if let Some(template) = template {
            println!("  {}: {}", name, template);
        }
    }

    if let (ModeKind::WindowedSearch, Some(window)) = (entry.kind, &entry.window) {
        let scheduler = TimeWindowScheduler::new(
            window.start,
            window.end,
            chrono::Duration::minutes(window.step_minutes as i64),
        );
        println!("\nPlanned Windows ({} per key):", scheduler.windows().len());
        for planned in scheduler.windows() {
            let (start, end) = planned.labels(&window.label_format);
            println!("  {} -> {}", start, end);
        }
    }

    println!("\nSeeds ({}):", seeds.len());
    for seed in seeds.iter().take(20) {
        println!("  * {}", seed);
    }
    if seeds.len() > 20 {
        println!("  ... and {} more", seeds.len() - 20);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, mode: &str, seeds: &[String]) -> anyhow::Result<()> {
    tracing::info!(
        "Mode: {}, seeds: {}, credentials: {}",
        mode,
        seeds.len(),
        config.credentials.len()
    );

    let sink = JsonlSink::create(&config.output.directory, mode, seeds)
        .context("Failed to open output file")?;
    let output_path = sink.path().to_path_buf();

    let mut coordinator = Coordinator::from_config(config, mode, Box::new(sink))?;
    coordinator.seed(seeds);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = match coordinator.run(shutdown).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            return Err(e.into());
        }
    };

    print_report(&report);
    println!("\nItems written to: {}", output_path.display());
    Ok(())
}
