//! Remote port resolution against a service's declared ports.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use thiserror::Error;

/// Errors from resolving a service's remote port. Fatal for the whole run:
/// the route list must be complete before the mesh can start.
#[derive(Debug, Error)]
pub enum PortResolutionError {
    /// The service could not be fetched from the cluster.
    #[error("failed to get service {namespace}/{service}: {source}")]
    Lookup {
        namespace: String,
        service: String,
        #[source]
        source: kube::Error,
    },

    /// The service declares no ports at all.
    #[error("service {namespace}/{service} has no ports defined")]
    NoPortsDefined { namespace: String, service: String },

    /// The requested named port is not declared by the service.
    #[error("service {namespace}/{service} has no port named '{port_name}'")]
    PortNameNotFound {
        namespace: String,
        service: String,
        port_name: String,
    },

    /// No mock resolution matched in offline mode.
    #[error("no mock resolution for {namespace}/{service} (port_name={port_name})")]
    MockMissing {
        namespace: String,
        service: String,
        port_name: String,
    },
}

/// A declared service port, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedServicePort {
    pub name: Option<String>,
    pub port: u16,
}

/// Read-only source of a service's declared ports.
#[async_trait]
pub trait ServicePortSource: Send + Sync {
    /// Declared ports for the service, in declaration order.
    async fn service_ports(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<NamedServicePort>, PortResolutionError>;
}

/// Live [`ServicePortSource`] backed by the cluster API.
pub struct ClusterServicePorts {
    client: Client,
}

impl ClusterServicePorts {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServicePortSource for ClusterServicePorts {
    async fn service_ports(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<NamedServicePort>, PortResolutionError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api
            .get(service)
            .await
            .map_err(|e| PortResolutionError::Lookup {
                namespace: namespace.to_string(),
                service: service.to_string(),
                source: e,
            })?;

        Ok(svc
            .spec
            .and_then(|spec| spec.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|p| NamedServicePort {
                name: p.name,
                port: p.port as u16,
            })
            .collect())
    }
}

/// Resolves the remote port for a service.
///
/// Priority:
/// 1. an explicit `port` is returned as-is, with no cluster call;
/// 2. a `port_name` must match a declared port by name;
/// 3. otherwise the first declared port is used, matching what
///    `kubectl port-forward svc/...` does.
pub async fn resolve_service_port<S: ServicePortSource + ?Sized>(
    source: &S,
    namespace: &str,
    service: &str,
    port_name: Option<&str>,
    port: Option<u16>,
) -> Result<u16, PortResolutionError> {
    if let Some(port) = port {
        return Ok(port);
    }

    let ports = source.service_ports(namespace, service).await?;
    if ports.is_empty() {
        return Err(PortResolutionError::NoPortsDefined {
            namespace: namespace.to_string(),
            service: service.to_string(),
        });
    }

    if let Some(name) = port_name.map(str::trim).filter(|n| !n.is_empty()) {
        return ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.port)
            .ok_or_else(|| PortResolutionError::PortNameNotFound {
                namespace: namespace.to_string(),
                service: service.to_string(),
                port_name: name.to_string(),
            });
    }

    Ok(ports[0].port)
}
