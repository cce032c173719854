//! Mesh configuration models and YAML loading.
//!
//! The mesh config declares which cluster services are exposed locally and
//! under which host names. The optional mock config provides offline port
//! resolutions for dump mode, keyed by (namespace, service, port_name).

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default listener port for the data-plane proxy.
const DEFAULT_LISTENER_PORT: u16 = 80;

/// Top-level mesh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    /// Port the data-plane proxy listens on (default 80).
    #[serde(default)]
    pub listener_port: u16,

    /// Services exposed through the mesh, in declaration order.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// One service exposed through the mesh.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    /// Local host name routed to this service.
    #[serde(default)]
    pub host: String,

    /// Kubernetes namespace of the service.
    #[serde(default)]
    pub namespace: String,

    /// Kubernetes service name.
    #[serde(default)]
    pub service: String,

    /// Named service port to forward to. Falls back to the first declared
    /// port when neither this nor `port` is set.
    #[serde(default)]
    pub port_name: Option<String>,

    /// Explicit remote port. Wins over `port_name` when set.
    #[serde(default)]
    pub port: Option<u16>,

    /// Protocol hint (http|grpc). Metadata only.
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
}

/// Loads and validates a mesh configuration from a YAML file.
///
/// Fails when no services are configured or when an entry is missing
/// host/namespace/service after trimming whitespace.
pub fn load(path: impl AsRef<Path>) -> Result<MeshConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut cfg: MeshConfig = serde_yaml::from_str(&content)?;

    if cfg.listener_port == 0 {
        cfg.listener_port = DEFAULT_LISTENER_PORT;
    }
    if cfg.services.is_empty() {
        return Err(Error::Config(format!(
            "no services configured in {}",
            path.display()
        )));
    }

    for (i, entry) in cfg.services.iter_mut().enumerate() {
        entry.normalize();
        if entry.host.is_empty() || entry.namespace.is_empty() || entry.service.is_empty() {
            return Err(Error::Config(format!(
                "invalid service entry at index {}: host/namespace/service are required",
                i
            )));
        }
    }

    Ok(cfg)
}

impl ServiceEntry {
    /// Trims whitespace and collapses empty/zero optionals to `None`.
    fn normalize(&mut self) {
        self.host = self.host.trim().to_string();
        self.namespace = self.namespace.trim().to_string();
        self.service = self.service.trim().to_string();
        self.port_name = self
            .port_name
            .take()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.port = self.port.filter(|p| *p != 0);
        self.service_type = self
            .service_type
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }
}

/// Offline port resolutions for dump mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub mocks: Vec<MockResolution>,
}

/// A single mocked resolution, matched exactly on all three keys.
#[derive(Debug, Clone, Deserialize)]
pub struct MockResolution {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub port_name: String,

    pub resolved_port: u16,
}

impl MockConfig {
    /// Loads a mock configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let cfg: MockConfig = serde_yaml::from_str(&content)?;
        Ok(cfg)
    }

    /// Looks up a resolved port. All three keys must match exactly; an
    /// absent `port_name` matches the empty string.
    pub fn resolved_port(
        &self,
        namespace: &str,
        service: &str,
        port_name: Option<&str>,
    ) -> Option<u16> {
        let name = port_name.unwrap_or("");
        self.mocks
            .iter()
            .find(|m| m.namespace == namespace && m.service == service && m.port_name == name)
            .map(|m| m.resolved_port)
    }
}
