//! Kubernetes integration.
//!
//! This module provides:
//! - Client construction from the ambient kubeconfig
//! - Remote port resolution against a service's declared ports
//! - Per-service tunnel supervision with automatic reconnection over the
//!   pod port-forward subresource

pub mod client;
pub mod portforward;
pub mod service;

// Re-export commonly used types
pub use client::new_client;
pub use portforward::{
    free_local_port, supervise_tunnel, ForwardSpec, PodSelector, PodTunnelOpener,
    ServicePodSelector, TunnelError, TunnelOpener, TunnelSession, TunnelTarget, RECONNECT_DELAY,
};
pub use service::{
    resolve_service_port, ClusterServicePorts, NamedServicePort, PortResolutionError,
    ServicePortSource,
};
