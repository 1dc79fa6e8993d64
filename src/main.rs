//! dirshare 命令行入口
//!
//! 共享指定目录，直到收到 Ctrl-C 后按配置的等待时间停止。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use dirshare_lib::{ControlOutcome, LogBroker, ServerManager, ShareConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dirshare", version, about = "Share a local directory over HTTP on the LAN")]
struct Args {
    /// Directory to share
    directory: PathBuf,
    #[arg(short, long, env = "DIRSHARE_PORT", help = "Port to listen on (0 = any free port)")]
    port: Option<u16>,
    #[arg(long, env = "DIRSHARE_BIND", help = "Address to bind, defaults to all interfaces")]
    bind: Option<IpAddr>,
    #[arg(
        long,
        env = "DIRSHARE_CONFIG_DIR",
        help = "Directory holding settings.yaml"
    )]
    config_dir: Option<PathBuf>,
    #[arg(long, help = "Persist the effective settings to the config directory")]
    save_config: bool,
    #[arg(long, help = "Append every log entry to this file while running")]
    log_file: Option<PathBuf>,
    #[arg(long, help = "Write the retained log to this file on exit")]
    export_log: Option<PathBuf>,
    #[arg(long, help = "Print the server status as JSON after start")]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = Args::parse();
    let config_dir = args
        .config_dir
        .clone()
        .or_else(|| dirs::config_dir().map(|dir| dir.join("dirshare")));

    let mut config = config_dir
        .as_deref()
        .map(ShareConfig::load)
        .unwrap_or_default();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Err(e) = ShareConfig::validate_port(config.port) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    if args.save_config {
        match &config_dir {
            Some(dir) => match config.save(dir) {
                Ok(()) => tracing::info!(
                    "Settings saved to {}",
                    ShareConfig::get_config_path(dir).display()
                ),
                Err(e) => tracing::warn!("{}", e),
            },
            None => tracing::warn!("No config directory available, settings not saved"),
        }
    }

    let log = Arc::new(LogBroker::with_capacity(config.log_capacity));
    if let Some(path) = &args.log_file {
        match open_log_file(path) {
            Ok(file) => {
                let file = Mutex::new(file);
                log.subscribe(move |entry| {
                    if let Ok(mut file) = file.lock() {
                        let _ = writeln!(file, "{}", entry);
                    }
                });
            }
            Err(e) => tracing::warn!("Cannot open log file {}: {}", path.display(), e),
        }
    }

    let port = config.port;
    let manager = ServerManager::new(config, log.clone());

    let outcome = ControlOutcome::from(manager.start(&args.directory, port).await);
    if !outcome.ok {
        eprintln!("{}", outcome.message);
        return ExitCode::FAILURE;
    }

    if let Some(url) = manager.share_url() {
        println!("Sharing {} at {}", args.directory.display(), url);
    }
    if args.json {
        match serde_json::to_string_pretty(&manager.status()) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::warn!("Failed to serialize status: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    let outcome = ControlOutcome::from(manager.stop().await);
    println!("{}", outcome.message);

    if let Some(path) = &args.export_log {
        if let Err(e) = log.export(path) {
            eprintln!("Failed to export log to {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    }

    if outcome.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
