//! Chorus: aggregator entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Build and initialise the aggregator (discover → connect → capabilities)
//!   6. Start the control task and its Unix socket
//!   7. Wait for Ctrl-C or a control `Shutdown`
//!   8. Shut the aggregator down and join the control tasks

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chorus::aggregator::Aggregator;
use chorus::bootstrap::logger;
use chorus::{config, control, error};

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), error::AppError> {
    // Optional file; a missing .env is not an error.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some(), config.log_file.as_deref())?;

    info!(
        service = %config.service_name,
        work_dir = %config.work_dir.display(),
        backends = config.aggregator.backends.len(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let aggregator = Aggregator::new(config.aggregator.clone());
    aggregator
        .initialize()
        .await
        .map_err(|e| error::AppError::Backend(e.to_string()))?;

    let (control_handle, control_task) = control::spawn(aggregator.clone(), shutdown.clone(), 32);
    let socket_task = if config.control.enabled {
        match control::uds::start(control_handle, config.control.socket_path.clone(), shutdown.clone()) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(error = %e, "control socket unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    print_startup_summary(&config, &aggregator).await;

    shutdown.cancelled().await;

    aggregator.shutdown().await;
    control_task.await.ok();
    if let Some(task) = socket_task {
        task.await.ok();
    }
    info!("bye");
    Ok(())
}

async fn print_startup_summary(config: &config::Config, aggregator: &Aggregator) {
    let status = aggregator.connection_status().await;
    let pid = std::process::id();

    println!("chorus  pid={pid}  service={}", config.service_name);
    for backend in &config.aggregator.backends {
        let up = status.get(&backend.name).copied().unwrap_or(false);
        let domain = backend.domain.map(|d| d.as_str()).unwrap_or("-");
        println!(
            "  {:<12} {:<24} domain={:<9} {}",
            backend.name,
            backend.endpoint,
            domain,
            if up { "connected" } else { "retrying" }
        );
    }
    if config.control.enabled {
        println!("  control socket: {}", config.control.socket_path.display());
    }
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: chorus [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    //   -v     → warn
    //   -vv    → info
    //   -vvv   → debug (routing, correlation)
    //   -vvvv+ → trace (every inbound frame)
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path }
}
