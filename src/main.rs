//! paqet - TCP/UDP tunnel over raw-capture reliable-UDP

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use paqet::config::{Config, Role};
use paqet::error::Result;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let Some(role) = args.role else {
        print_help();
        std::process::exit(2);
    };

    let Some(config_path) = args.config else {
        eprintln!("a config file is required (-c <FILE>)");
        std::process::exit(2);
    };

    let config = Config::load(&config_path, role)?;

    // RUST_LOG wins over the config level.
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    info!("paqet v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        paqet::license::enforce(&config.license).await?;

        let cancel = CancellationToken::new();
        tokio::spawn(signal_watcher(cancel.clone()));

        match role {
            Role::Server => paqet::server::run(config, cancel).await,
            Role::Client => paqet::client::run(config, cancel).await,
        }
    })?;

    info!("goodbye");
    Ok(())
}

/// Cancel the root scope on SIGINT or SIGTERM.
async fn signal_watcher(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received, initiating graceful shutdown...");
    cancel.cancel();
}

/// Command line arguments
struct Args {
    role: Option<Role>,
    config: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut role = None;
        let mut config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "server" => role = Some(Role::Server),
                "client" => role = Some(Role::Client),
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self { role, config, version }
    }
}

fn print_help() {
    println!(
        r#"paqet - TCP/UDP tunnel over raw-capture reliable-UDP

USAGE:
    paqet <ROLE> -c <FILE>

ROLES:
    server                  Accept carrier sessions and dial targets
    client                  Run local forwarders over the carrier pool

OPTIONS:
    -c, --config <FILE>     Path to YAML configuration file
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    paqet server -c server.yaml
    paqet client -c client.yaml
"#
    );
}

fn print_version() {
    println!("paqet v{}", env!("CARGO_PKG_VERSION"));
}
