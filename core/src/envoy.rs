//! Envoy configuration synthesis.
//!
//! Builds the static Envoy document that routes by host name to the local
//! tunnel endpoints. Pure functions, no I/O; the output follows the route
//! input order and duplicate host names are passed through untouched.

use serde_json::{json, Value};

/// A (host name -> local tunnel port) binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Host name matched by the virtual host.
    pub host: String,
    /// Local port the tunnel is bound to.
    pub local_port: u16,
    /// Stable join key between cluster and virtual host definitions.
    pub cluster_name: String,
}

/// Derives the sanitized cluster token for a resolved service.
pub fn cluster_name(namespace: &str, service: &str, remote_port: u16) -> String {
    sanitize(&format!("{}_{}_{}", namespace, service, remote_port))
}

/// Replaces everything outside `[A-Za-z0-9_]` with `_`.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Builds the full Envoy static-resources document.
///
/// One listener on `0.0.0.0:<listener_port>`, one virtual host and one
/// STATIC HTTP/2 cluster per route. Routes carry no request timeout so
/// long-lived streams are never cut.
pub fn build_config(listener_port: u16, routes: &[Route]) -> Value {
    let clusters: Vec<Value> = routes.iter().map(cluster_for).collect();
    let vhosts: Vec<Value> = routes.iter().map(virtual_host_for).collect();

    json!({
        "static_resources": {
            "listeners": [
                {
                    "name": "listener_http",
                    "address": {
                        "socket_address": {
                            "address": "0.0.0.0",
                            "port_value": listener_port,
                        }
                    },
                    "filter_chains": [
                        {
                            "filters": [
                                {
                                    "name": "envoy.filters.network.http_connection_manager",
                                    "typed_config": {
                                        "@type": "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                                        "stat_prefix": "ingress_http",
                                        "codec_type": "AUTO",
                                        "http2_protocol_options": {},
                                        "route_config": {
                                            "name": "local_route",
                                            "virtual_hosts": vhosts,
                                        },
                                        "http_filters": [
                                            {
                                                "name": "envoy.filters.http.router",
                                                "typed_config": {
                                                    "@type": "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router",
                                                }
                                            }
                                        ],
                                    }
                                }
                            ]
                        }
                    ],
                }
            ],
            "clusters": clusters,
        }
    })
}

fn cluster_for(route: &Route) -> Value {
    json!({
        "name": route.cluster_name,
        "type": "STATIC",
        "connect_timeout": "1s",
        "load_assignment": {
            "cluster_name": route.cluster_name,
            "endpoints": [
                {
                    "lb_endpoints": [
                        {
                            "endpoint": {
                                "address": {
                                    "socket_address": {
                                        "address": "127.0.0.1",
                                        "port_value": route.local_port,
                                    }
                                }
                            }
                        }
                    ]
                }
            ],
        },
        "typed_extension_protocol_options": {
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                "explicit_http_config": {
                    "http2_protocol_options": {}
                }
            }
        },
    })
}

fn virtual_host_for(route: &Route) -> Value {
    json!({
        "name": route.cluster_name,
        "domains": [route.host],
        "routes": [
            {
                "match": { "prefix": "/" },
                "route": {
                    "cluster": route.cluster_name,
                    // 0s disables the request timeout for long-lived streams
                    "timeout": "0s",
                }
            }
        ],
    })
}
