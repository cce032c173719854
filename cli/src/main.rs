//! LocalMesh CLI - host-name routing onto Kubernetes services
//!
//! Runs a local Envoy proxy in front of auto-reconnecting port-forward
//! tunnels, so cluster services are reachable at local host names without
//! installing anything cluster-side.

mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "localmesh")]
#[command(author, version, about = "Local host-based routing mesh over Kubernetes port-forward")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level: debug|info|warn
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local service mesh
    Up {
        /// Config yaml path (e.g. services.yaml)
        #[arg(short = 'f', long = "config")]
        config: Option<PathBuf>,

        /// Config yaml path (positional alternative to -f)
        config_file: Option<PathBuf>,

        /// Dump the generated Envoy config to stdout and exit
        #[arg(long)]
        dump_envoy_config: bool,

        /// Mock config for offline mode (works with --dump-envoy-config)
        #[arg(long)]
        mock_config: Option<PathBuf>,

        /// Update /etc/hosts (requires sudo)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        update_hosts: bool,
    },

    /// Dump the generated Envoy config to stdout
    #[command(name = "dump-config")]
    DumpConfig {
        /// Config yaml path
        #[arg(short = 'f', long = "config")]
        config: Option<PathBuf>,

        /// Config yaml path (positional alternative to -f)
        config_file: Option<PathBuf>,

        /// Mock config for offline validation (no cluster needed)
        #[arg(long)]
        mock_config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Up {
            config,
            config_file,
            dump_envoy_config,
            mock_config,
            update_hosts,
        } => {
            let path = require_config(config, config_file, "up");
            if dump_envoy_config {
                commands::dump::run(path, mock_config).await
            } else {
                commands::up::run(path, &cli.log_level, update_hosts).await
            }
        }
        Commands::DumpConfig {
            config,
            config_file,
            mock_config,
        } => {
            let path = require_config(config, config_file, "dump-config");
            commands::dump::run(path, mock_config).await
        }
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

/// Missing config is a usage error: exit 2, like clap's own argument errors.
fn require_config(flag: Option<PathBuf>, positional: Option<PathBuf>, command: &str) -> PathBuf {
    flag.or(positional).unwrap_or_else(|| {
        eprintln!("usage: localmesh {command} -f services.yaml");
        eprintln!("   or: localmesh {command} services.yaml");
        std::process::exit(2);
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
