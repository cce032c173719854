//! End-to-end orchestration.
//!
//! Drives a mesh run: hosts file entries, per-service port resolution and
//! tunnel supervision, Envoy config synthesis, and the external data-plane
//! process, all under one cancellation token. Dump mode synthesizes and
//! returns the config without touching the hosts file or starting tunnels.

use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{MeshConfig, MockConfig, ServiceEntry};
use crate::envoy::{self, Route};
use crate::error::{Error, Result};
use crate::hosts::HostsFile;
use crate::kubernetes::{
    free_local_port, new_client, resolve_service_port, supervise_tunnel, ClusterServicePorts,
    ForwardSpec, PodTunnelOpener, PortResolutionError, ServicePodSelector, ServicePortSource,
};

/// Base for the dummy local ports assigned in dump mode.
const DUMMY_LOCAL_PORT_BASE: u16 = 10_000;

/// Options for a live mesh run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Add/remove hosts file entries around the run (requires privileges).
    pub update_hosts: bool,
    /// Log level handed to the Envoy process (`-l`).
    pub envoy_log_level: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            update_hosts: true,
            envoy_log_level: "info".to_string(),
        }
    }
}

/// Runs the mesh until the data plane exits or `cancel` fires.
///
/// Hosts entries added at startup are removed again on every exit path.
pub async fn run(config: &MeshConfig, options: &RunOptions, cancel: CancellationToken) -> Result<()> {
    let client = new_client().await?;

    let hosts = HostsFile::system();
    let mut hosts_added = false;
    if options.update_hosts {
        if !hosts.check_writable() {
            return Err(Error::PermissionDenied(format!(
                "cannot write {}: re-run with sudo or pass --update-hosts=false",
                hosts.path().display()
            )));
        }
        let hostnames: Vec<&str> = config.services.iter().map(|s| s.host.as_str()).collect();
        hosts.add_entries(&hostnames)?;
        hosts_added = true;
        info!("{} updated", hosts.path().display());
    }

    let result = run_mesh(client, config, options, cancel).await;

    if hosts_added {
        match hosts.remove_entries() {
            Ok(()) => info!("{} cleaned up", hosts.path().display()),
            Err(e) => warn!(error = %e, "failed to clean up hosts entries"),
        }
    }

    result
}

async fn run_mesh(
    client: kube::Client,
    config: &MeshConfig,
    options: &RunOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let tmp_dir = tempfile::Builder::new().prefix("localmesh-").tempdir()?;

    let source = ClusterServicePorts::new(client.clone());
    let selector = Arc::new(ServicePodSelector::new(client.clone()));
    let opener = Arc::new(PodTunnelOpener::new(client));

    // Child token so supervisors can be released on any exit path without
    // cancelling the caller's token.
    let tunnels = cancel.child_token();

    let mut routes = Vec::with_capacity(config.services.len());
    for entry in &config.services {
        let remote_port = resolve_service_port(
            &source,
            &entry.namespace,
            &entry.service,
            entry.port_name.as_deref(),
            entry.port,
        )
        .await?;
        let local_port = free_local_port()?;

        info!(
            "pf: {} -> {}/{}:{} via 127.0.0.1:{}",
            entry.host, entry.namespace, entry.service, remote_port, local_port
        );

        let spec = ForwardSpec {
            namespace: entry.namespace.clone(),
            service: entry.service.clone(),
            local_port,
            remote_port,
        };
        tokio::spawn(supervise_tunnel(
            selector.clone(),
            opener.clone(),
            spec,
            tunnels.child_token(),
        ));

        routes.push(route_for(entry, remote_port, local_port));
    }

    let doc = envoy::build_config(config.listener_port, &routes);
    let yaml = serde_yaml::to_string(&doc)?;
    let config_path = tmp_dir.path().join("envoy.yaml");
    std::fs::write(&config_path, yaml)?;

    info!("envoy config: {}", config_path.display());
    info!("listen: 0.0.0.0:{}", config.listener_port);

    let result = wait_for_data_plane(&config_path, &options.envoy_log_level, &cancel).await;
    tunnels.cancel();
    result
}

/// Spawns Envoy and blocks until it exits or `cancel` fires.
async fn wait_for_data_plane(
    config_path: &Path,
    log_level: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut child = Command::new("envoy")
        .arg("-c")
        .arg(config_path)
        .arg("-l")
        .arg(log_level)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::DataPlane(format!("failed to start envoy: {}", e)))?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("envoy exited");
                Ok(())
            } else {
                Err(Error::DataPlane(format!("envoy exited with {}", status)))
            }
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Ok(())
        }
    }
}

/// Synthesizes the Envoy config without starting tunnels or touching the
/// hosts file. With a mock config the whole operation is offline.
pub async fn dump_config(config: &MeshConfig, mock: Option<&MockConfig>) -> Result<String> {
    let routes = match mock {
        Some(mock) => mock_routes(config, mock)?,
        None => {
            let client = new_client().await?;
            resolved_routes(config, &ClusterServicePorts::new(client)).await?
        }
    };

    let doc = envoy::build_config(config.listener_port, &routes);
    Ok(serde_yaml::to_string(&doc)?)
}

/// Builds routes from the mock resolution table, dummy local ports.
fn mock_routes(config: &MeshConfig, mock: &MockConfig) -> Result<Vec<Route>> {
    config
        .services
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let remote_port = mock
                .resolved_port(&entry.namespace, &entry.service, entry.port_name.as_deref())
                .ok_or_else(|| PortResolutionError::MockMissing {
                    namespace: entry.namespace.clone(),
                    service: entry.service.clone(),
                    port_name: entry.port_name.clone().unwrap_or_default(),
                })?;
            Ok(route_for(entry, remote_port, dummy_local_port(i)))
        })
        .collect()
}

/// Builds routes by resolving ports against the given source, dummy local
/// ports.
async fn resolved_routes<S: ServicePortSource + ?Sized>(
    config: &MeshConfig,
    source: &S,
) -> Result<Vec<Route>> {
    let mut routes = Vec::with_capacity(config.services.len());
    for (i, entry) in config.services.iter().enumerate() {
        let remote_port = resolve_service_port(
            source,
            &entry.namespace,
            &entry.service,
            entry.port_name.as_deref(),
            entry.port,
        )
        .await?;
        routes.push(route_for(entry, remote_port, dummy_local_port(i)));
    }
    Ok(routes)
}

fn dummy_local_port(index: usize) -> u16 {
    DUMMY_LOCAL_PORT_BASE + index as u16
}

fn route_for(entry: &ServiceEntry, remote_port: u16, local_port: u16) -> Route {
    Route {
        host: entry.host.clone(),
        local_port,
        cluster_name: envoy::cluster_name(&entry.namespace, &entry.service, remote_port),
    }
}
