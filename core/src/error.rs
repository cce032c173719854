//! Error types for the localmesh-core library.

use thiserror::Error;

use crate::hosts::HostsError;
use crate::kubernetes::PortResolutionError;

/// Result type alias for localmesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can terminate a mesh run.
///
/// Transient tunnel faults are absorbed inside the per-service supervisor
/// loop and never appear here.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete mesh configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// The shared hosts file is not writable by this process.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Hosts file mutation failed (I/O or corruption).
    #[error(transparent)]
    Hosts(#[from] HostsError),

    /// A service's remote port could not be resolved.
    #[error(transparent)]
    PortResolution(#[from] PortResolutionError),

    /// The external data-plane process failed to start or exited with an error.
    #[error("data plane error: {0}")]
    DataPlane(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Kubernetes client error.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}
