//! fwwatch - interception rule watchdog
//!
//! Installs the nftables rules that send DNS responses and new connections to
//! a netfilter queue, then keeps them in place.
//!
//! # Usage
//!
//! ```bash
//! fwwatch run --queue 0          # Install rules and watch them until SIGINT/SIGTERM
//! fwwatch check                  # Exit 0 if the rules are loaded, 1 otherwise
//! fwwatch install --queue 0      # Install rules once
//! fwwatch remove                 # Remove the interception table
//! fwwatch show --format nft      # Print the rules without applying them
//! fwwatch audit -n 20            # Show recent audit events
//! fwwatch init-config            # Write a default config file
//! ```
//!
//! While `run` is active, SIGHUP reinstalls the rules and restarts the
//! watchdog.

use clap::{Parser, Subcommand, ValueEnum};
use fwwatch::audit::{self, AuditLog};
use fwwatch::config::{self, Config};
use fwwatch::core::nft::RuleKind;
use fwwatch::{Error, InterceptionRules, Result, RuleWatchdog, StatusStore};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use strum::IntoEnumIterator;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long shutdown waits for an in-flight check or reload to finish
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "fwwatch", version)]
#[command(about = "Keeps nftables traffic interception rules in place", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/fwwatch/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the interception rules and keep them loaded
    Run {
        /// Netfilter queue number (overrides the config file)
        #[arg(short, long)]
        queue: Option<i64>,
    },
    /// Report whether the interception rules are loaded
    Check,
    /// Install the interception rules once
    Install {
        /// Netfilter queue number (overrides the config file)
        #[arg(short, long)]
        queue: Option<i64>,
    },
    /// Remove the interception rules
    Remove,
    /// Print the interception rules without applying them
    Show {
        #[arg(short, long, value_enum, default_value_t = ShowFormat::Nft)]
        format: ShowFormat,
    },
    /// Show recent audit log events
    Audit {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowFormat {
    Nft,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let config = config::load_config(cli.config.as_deref()).await;
        init_logging(
            cli.log_file.as_deref().or(config.log_file.as_deref()),
            cli.verbose,
        );

        match handle_cli(cli.command, &config, cli.config.as_deref()).await {
            Ok(code) => code,
            Err(e) => {
                report_error(&e);
                ExitCode::FAILURE
            }
        }
    })
}

fn init_logging(log_file: Option<&Path>, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let builder = tracing_subscriber::fmt().with_max_level(level);

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }

    builder.with_writer(std::io::stderr).init();
}

fn report_error(e: &Error) {
    let translation = e.translate();
    eprintln!("Error: {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
}

/// Resolves the rules for this invocation, applying the queue override with
/// the status store's truncation policy
fn rules_for(config: &Config, queue: Option<i64>, status: &StatusStore) -> InterceptionRules {
    status.set_queue_number(config.queue_number);
    status.set_queue_number(queue);
    InterceptionRules::new(config.table.clone(), status.queue_number())
}

async fn handle_cli(
    command: Commands,
    config: &Config,
    config_path: Option<&Path>,
) -> Result<ExitCode> {
    let status = StatusStore::new();

    match command {
        Commands::Run { queue } => {
            let rules = rules_for(config, queue, &status);
            run_daemon(config, rules, &status).await?;
        }
        Commands::Check => {
            let rules = rules_for(config, None, &status);
            let found = match rules.list().await {
                Ok(listing) => rules.loaded_rules(&listing),
                Err(_) => Vec::new(),
            };
            println!("Interception rules in table inet {}:", rules.table());
            for kind in RuleKind::iter() {
                let mark = if found.contains(&kind) { "✓" } else { "✗" };
                println!("  {mark} {kind} (chain {})", kind.chain());
            }
            if found.len() < RuleKind::iter().count() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Install { queue } => {
            let rules = rules_for(config, queue, &status);
            install_rules(&rules, config.audit, false).await?;
            println!("✓ Interception rules installed (queue {}).", rules.queue());
        }
        Commands::Remove => {
            let rules = rules_for(config, None, &status);
            remove_rules(&rules, config.audit).await?;
            println!("✓ Interception rules removed.");
        }
        Commands::Show { format } => {
            let rules = rules_for(config, None, &status);
            match format {
                ShowFormat::Nft => print!("{}", rules.to_nft_text()),
                ShowFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&rules.to_nftables_json())?
                ),
            }
        }
        Commands::Audit { count } => {
            let log = AuditLog::new()?;
            let events = match log.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("No audit events recorded yet.");
                    return Ok(ExitCode::SUCCESS);
                }
                Err(e) => return Err(e.into()),
            };
            for event in events {
                let outcome = if event.success { "ok" } else { "failed" };
                print!(
                    "{} {:?} {outcome} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.details
                );
                match event.error {
                    Some(err) => println!(" ({err})"),
                    None => println!(),
                }
            }
        }
        Commands::InitConfig { force } => {
            let path = config_path
                .map(Path::to_path_buf)
                .or_else(config::default_config_path)
                .ok_or_else(|| Error::Config("Cannot determine config directory".to_string()))?;
            if path.exists() && !force {
                return Err(Error::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_config(&Config::default(), &path)?;
            println!("✓ Wrote {}", path.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn install_rules(rules: &InterceptionRules, audit_enabled: bool, reload: bool) -> Result<()> {
    let result = rules.install().await;
    if audit_enabled {
        audit::log_rules_applied(
            reload,
            rules.table(),
            rules.queue(),
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
    }
    result
}

async fn remove_rules(rules: &InterceptionRules, audit_enabled: bool) -> Result<()> {
    let result = rules.remove().await;
    if audit_enabled {
        audit::log_rules_removed(
            rules.table(),
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
    }
    result
}

/// Starts (or restarts) the watchdog with nftables-backed callbacks.
///
/// The callbacks run on the blocking pool, where they drive the async nft
/// calls to completion on the current runtime.
async fn start_watchdog(watchdog: &RuleWatchdog, rules: &InterceptionRules, audit_enabled: bool) {
    let runtime = tokio::runtime::Handle::current();

    let check_runtime = runtime.clone();
    let check_rules = rules.clone();
    let reload_rules = rules.clone();

    watchdog
        .start(
            move || check_runtime.block_on(check_rules.are_loaded()),
            move || {
                match runtime.block_on(install_rules(&reload_rules, audit_enabled, true)) {
                    Ok(()) => info!(table = %reload_rules.table(), "Interception rules reloaded"),
                    Err(e) => error!("Failed to reload interception rules: {e}"),
                }
            },
        )
        .await;

    if audit_enabled {
        audit::log_watchdog(true, watchdog.config().check_interval.as_secs()).await;
    }
}

async fn run_daemon(config: &Config, rules: InterceptionRules, status: &StatusStore) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root; nftables will likely refuse changes");
    }
    if let Err(e) = fwwatch::utils::ensure_dirs() {
        warn!("Failed to create state directories: {e}");
    }

    install_rules(&rules, config.audit, false).await?;
    status.set_firewall_enabled(true);
    status.set_intercepting(true);
    status.set_running(true);

    let watchdog = RuleWatchdog::new(config.watchdog());
    start_watchdog(&watchdog, &rules, config.audit).await;
    info!(
        table = %rules.table(),
        queue = status.queue_number(),
        "Interception active"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                info!("SIGHUP received, reinstalling rules and restarting watchdog");
                if let Err(e) = install_rules(&rules, config.audit, true).await {
                    error!("Failed to reinstall interception rules: {e}");
                }
                start_watchdog(&watchdog, &rules, config.audit).await;
            }
        }
    }

    info!("Shutting down");
    watchdog.stop().await;
    // An in-flight reload would reinstall the table after removal
    if !watchdog.wait_idle(SHUTDOWN_DRAIN_TIMEOUT).await {
        warn!(
            tasks = watchdog.running_tasks(),
            "Watchdog still busy after {:?}, removing rules anyway", SHUTDOWN_DRAIN_TIMEOUT
        );
    }
    if config.audit {
        audit::log_watchdog(false, watchdog.config().check_interval.as_secs()).await;
    }
    status.set_intercepting(false);
    status.set_running(false);

    let removed = remove_rules(&rules, config.audit).await;
    if removed.is_ok() {
        status.set_firewall_enabled(false);
    }

    let state = watchdog.state().await;
    info!(
        running = status.is_running(),
        intercepting = status.is_intercepting(),
        firewall_enabled = status.is_firewall_enabled(),
        watchdog = %state,
        "fwwatch stopped"
    );
    removed
}
