mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::OnceLock;

use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hc_core::{CheckDeps, Cycle, Registry};

use crate::config::AppConfig;

fn version_string() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        match env!("GIT_HASH") {
            "" => version.to_string(),
            hash => format!("{version} ({hash})"),
        }
    })
}

/// Periodic reachability checks for mail, Matrix and Ceph.
#[derive(Parser)]
#[command(name = "healthcheck", version = version_string(), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured check until interrupted.
    Run {
        /// Path to TOML config file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run one cycle of a single check and exit.
    Check {
        /// Path to TOML config file.
        #[arg(short, long)]
        config: PathBuf,

        /// Name of the check to run.
        name: String,
    },
    /// Load the config file and report problems without polling.
    Validate {
        /// Path to TOML config file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config, name } => check_once(&config, &name).await,
        Commands::Validate { config } => validate(&config),
    }
}

fn load(path: &Path) -> Option<AppConfig> {
    match AppConfig::load(path) {
        Ok(c) => {
            init_tracing(&c.logging.format);
            info!(path = %path.display(), checks = c.check.len(), "Loaded config file");
            Some(c)
        }
        Err(e) => {
            init_tracing("pretty");
            error!("{}", e);
            None
        }
    }
}

async fn run(config_path: &Path) -> ExitCode {
    let Some(config) = load(config_path) else {
        return ExitCode::FAILURE;
    };

    let deps = match CheckDeps::new(&config.dns, config.matrix.as_ref()) {
        Ok(deps) => deps,
        Err(e) => {
            error!(error = %e, "Failed to prepare checks");
            return ExitCode::FAILURE;
        }
    };

    let (registry, faults) = Registry::setup(&config.check, &deps).await;
    if registry.is_empty() {
        error!(faults = faults.len(), "No check survived setup");
        return ExitCode::FAILURE;
    }
    if !faults.is_empty() {
        warn!(skipped = faults.len(), running = registry.len(), "Some checks were skipped");
    }

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let report = registry.run(&token, notify_ready).await;
    for (name, fault) in &report.faulted {
        error!(check = %name, error = %fault, "Check stopped on fault");
    }

    if token.is_cancelled() {
        info!("Shutdown complete");
        ExitCode::SUCCESS
    } else {
        error!("Every check stopped on a fault");
        ExitCode::FAILURE
    }
}

async fn check_once(config_path: &Path, name: &str) -> ExitCode {
    let Some(config) = load(config_path) else {
        return ExitCode::FAILURE;
    };
    let Some(def) = config.find(name) else {
        error!(check = name, "No such check in config");
        return ExitCode::FAILURE;
    };

    let deps = match CheckDeps::new(&config.dns, config.matrix.as_ref()) {
        Ok(deps) => deps,
        Err(e) => {
            error!(error = %e, "Failed to prepare check");
            return ExitCode::FAILURE;
        }
    };

    let (registry, faults) = Registry::setup(std::slice::from_ref(def), &deps).await;
    let Some(poller) = registry.get(name) else {
        for fault in &faults {
            println!("{} {}", style("FAULT").red().bold(), fault);
        }
        return ExitCode::FAILURE;
    };

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    match poller.run_once(&token).await {
        Cycle::Passed => {
            println!("{} {}", style("OK").green().bold(), style(name).bold());
            ExitCode::SUCCESS
        }
        Cycle::Failed(err) => {
            println!(
                "{} {} {}  {}",
                style("FAIL").red().bold(),
                style(name).bold(),
                style(err.kind()).red(),
                err
            );
            ExitCode::FAILURE
        }
        Cycle::Cancelled => {
            println!("{} {}", style("CANCELLED").yellow().bold(), style(name).bold());
            ExitCode::FAILURE
        }
    }
}

fn validate(config_path: &Path) -> ExitCode {
    let Some(config) = load(config_path) else {
        return ExitCode::FAILURE;
    };

    let faults = config.check_faults();
    for check in &config.check {
        let kind = check.probe_variant().map(|p| p.kind()).unwrap_or("?");
        println!(
            "  {:<20} {:<7} every {}s, {} sink(s)",
            style(&check.name).bold(),
            style(kind).dim(),
            check.interval_secs,
            check.sinks.len()
        );
    }
    for fault in &faults {
        println!("{} {}", style("FAULT").red().bold(), fault);
    }

    if faults.is_empty() {
        println!("{}", style("Config is valid").green());
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    shutdown_signal().await;
    info!("Shutdown signal received, stopping checks...");
    token.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Called once every poller runs: log it and tell the service manager.
fn notify_ready() {
    info!("All checks running");
    #[cfg(unix)]
    if let Some(socket) = std::env::var_os("NOTIFY_SOCKET") {
        match sd_notify(&socket, "READY=1") {
            Ok(()) => info!("Readiness reported to service manager"),
            Err(e) => warn!(error = %e, "Failed to report readiness"),
        }
    }
}

#[cfg(unix)]
fn sd_notify(socket: &std::ffi::OsStr, state: &str) -> std::io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let sock = UnixDatagram::unbound()?;

    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::ffi::OsStrExt;

        if let Some(name) = socket.as_bytes().strip_prefix(b"@") {
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            sock.send_to_addr(state.as_bytes(), &addr)?;
            return Ok(());
        }
    }

    sock.send_to(state.as_bytes(), Path::new(socket))?;
    Ok(())
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_format {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }
}
