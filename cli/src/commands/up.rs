//! Up command - run the mesh until the data plane exits or a signal arrives.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use localmesh_core::{config, engine, RunOptions};

pub async fn run(config_path: PathBuf, log_level: &str, update_hosts: bool) -> Result<()> {
    let cfg = config::load(&config_path).context("failed to load config")?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let options = RunOptions {
        update_hosts,
        envoy_log_level: log_level.to_string(),
    };
    engine::run(&cfg, &options, cancel).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
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
}
