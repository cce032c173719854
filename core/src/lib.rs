//! LocalMesh Core Library
//!
//! Engine for a local, host-name-based routing layer onto services inside a
//! remote Kubernetes cluster, with nothing installed cluster-side.
//! Provides functionality to:
//! - Resolve the remote port of each configured service
//! - Supervise one auto-reconnecting port-forward tunnel per service
//! - Manage a marker-delimited block of entries in the system hosts file
//! - Synthesize the Envoy configuration that routes by host name to the
//!   local tunnel endpoints
//!
//! # Architecture
//! - `config`: mesh / mock configuration models and YAML loading
//! - `hosts`: hosts file block management with corruption detection
//! - `kubernetes`: cluster access, port resolution, tunnel supervision
//! - `envoy`: proxy configuration synthesis
//! - `engine`: end-to-end orchestration (run and dump modes)

pub mod config;
pub mod engine;
pub mod envoy;
pub mod error;
pub mod hosts;
pub mod kubernetes;

// Re-export commonly used types
pub use config::{MeshConfig, MockConfig, MockResolution, ServiceEntry};
pub use engine::{dump_config, run, RunOptions};
pub use envoy::Route;
pub use error::{Error, Result};
pub use hosts::{HostsFile, HostsFileStatus};
