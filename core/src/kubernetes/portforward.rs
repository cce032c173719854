//! Per-service tunnel supervision with automatic reconnection.
//!
//! Each configured service gets one supervisor task that keeps a single
//! tunnel alive for its lifetime: select a pod backing the service, bind the
//! local port, forward traffic over the pod's port-forward subresource, and
//! on any fault wait a fixed delay and start over. Faults never escape the
//! loop; only cancellation ends it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed delay between reconnection attempts.
///
/// The target environment is localhost development: failures are typically
/// pod-restart-scale transients, so fast bounded retries beat exponential
/// growth here. This also bounds shutdown latency.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(300);

/// Transient tunnel faults. Absorbed by the supervisor, never surfaced.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The service has no pod selector to match against.
    #[error("service {namespace}/{service} has no selector")]
    NoSelector { namespace: String, service: String },

    /// The selector matched zero pods.
    #[error("no pods found for service {namespace}/{service}")]
    NoPods { namespace: String, service: String },

    /// The local port could not be bound.
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Kubernetes API call failed.
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// The port-forward stream broke down.
    #[error("tunnel stream error: {0}")]
    Stream(String),

    /// Local socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a supervisor forwards: one service to one local port.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// A concrete pod endpoint chosen for one connection attempt.
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub namespace: String,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Picks the pod to tunnel to for a service.
#[async_trait]
pub trait PodSelector: Send + Sync {
    async fn select_pod(&self, namespace: &str, service: &str) -> Result<String, TunnelError>;
}

/// Opens a tunnel session to a selected pod.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, target: &TunnelTarget) -> Result<Box<dyn TunnelSession>, TunnelError>;
}

/// An established tunnel. `forward` drives it until it ends; dropping the
/// session releases the local port.
#[async_trait]
pub trait TunnelSession: Send {
    async fn forward(self: Box<Self>) -> Result<(), TunnelError>;
}

/// Allocates a free local ephemeral port by binding and releasing it.
pub fn free_local_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

enum SupervisorState {
    SelectTarget,
    Connect { pod: String },
    Forward { session: Box<dyn TunnelSession> },
    Backoff,
    Cancelled,
}

/// Keeps one tunnel alive for the given service until `cancel` fires.
///
/// Every fault goes through a fixed [`RECONNECT_DELAY`] backoff and back to
/// pod selection; both the forwarding wait and the backoff sleep observe the
/// cancellation token, so shutdown latency stays within one delay period.
pub async fn supervise_tunnel(
    selector: Arc<dyn PodSelector>,
    opener: Arc<dyn TunnelOpener>,
    spec: ForwardSpec,
    cancel: CancellationToken,
) {
    let mut state = SupervisorState::SelectTarget;
    loop {
        state = match state {
            SupervisorState::SelectTarget => {
                if cancel.is_cancelled() {
                    SupervisorState::Cancelled
                } else {
                    match selector.select_pod(&spec.namespace, &spec.service).await {
                        Ok(pod) => SupervisorState::Connect { pod },
                        Err(e) => {
                            debug!(
                                namespace = %spec.namespace,
                                service = %spec.service,
                                error = %e,
                                "pod selection failed"
                            );
                            SupervisorState::Backoff
                        }
                    }
                }
            }
            SupervisorState::Connect { pod } => {
                debug!(
                    namespace = %spec.namespace,
                    service = %spec.service,
                    pod = %pod,
                    local_port = spec.local_port,
                    remote_port = spec.remote_port,
                    "connecting tunnel"
                );
                let target = TunnelTarget {
                    namespace: spec.namespace.clone(),
                    pod,
                    local_port: spec.local_port,
                    remote_port: spec.remote_port,
                };
                match opener.open(&target).await {
                    Ok(session) => SupervisorState::Forward { session },
                    Err(e) => {
                        debug!(
                            namespace = %spec.namespace,
                            service = %spec.service,
                            error = %e,
                            "tunnel connect failed"
                        );
                        SupervisorState::Backoff
                    }
                }
            }
            SupervisorState::Forward { session } => {
                tokio::select! {
                    _ = cancel.cancelled() => SupervisorState::Cancelled,
                    result = session.forward() => {
                        if let Err(e) = result {
                            warn!(
                                namespace = %spec.namespace,
                                service = %spec.service,
                                error = %e,
                                "tunnel ended, reconnecting"
                            );
                        }
                        SupervisorState::Backoff
                    }
                }
            }
            SupervisorState::Backoff => {
                tokio::select! {
                    _ = cancel.cancelled() => SupervisorState::Cancelled,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => SupervisorState::SelectTarget,
                }
            }
            SupervisorState::Cancelled => {
                debug!(
                    namespace = %spec.namespace,
                    service = %spec.service,
                    "tunnel supervisor stopped"
                );
                return;
            }
        };
    }
}

// ============================================================================
// Live implementations
// ============================================================================

/// Live [`PodSelector`] implementing the same logic as
/// `kubectl port-forward svc/...`: resolve the service's selector, list the
/// matching pods and prefer one that is Running and Ready.
pub struct ServicePodSelector {
    client: Client,
}

impl ServicePodSelector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodSelector for ServicePodSelector {
    async fn select_pod(&self, namespace: &str, service: &str) -> Result<String, TunnelError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = services.get(service).await?;

        // Bail out before listing anything when there is nothing to match on
        let selector = service_selector(svc).ok_or_else(|| TunnelError::NoSelector {
            namespace: namespace.to_string(),
            service: service.to_string(),
        })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector_string(&selector)))
            .await?;

        pick_pod(&list.items)
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| TunnelError::NoPods {
                namespace: namespace.to_string(),
                service: service.to_string(),
            })
    }
}

/// Extracts a service's pod selector; `None` when absent or empty.
fn service_selector(svc: Service) -> Option<BTreeMap<String, String>> {
    svc.spec
        .and_then(|spec| spec.selector)
        .filter(|s| !s.is_empty())
}

fn label_selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Prefers a Running pod with Ready=True; falls back to the first pod
/// listed, matching kubectl's behavior.
fn pick_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|p| is_pod_ready(p)).or_else(|| pods.first())
}

fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Live [`TunnelOpener`] forwarding over the pod port-forward subresource.
pub struct PodTunnelOpener {
    client: Client,
}

impl PodTunnelOpener {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelOpener for PodTunnelOpener {
    async fn open(&self, target: &TunnelTarget) -> Result<Box<dyn TunnelSession>, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", target.local_port))
            .await
            .map_err(|e| TunnelError::Bind {
                port: target.local_port,
                source: e,
            })?;

        Ok(Box::new(PodTunnelSession {
            pods: Api::namespaced(self.client.clone(), &target.namespace),
            pod: target.pod.clone(),
            remote_port: target.remote_port,
            listener,
        }))
    }
}

struct PodTunnelSession {
    pods: Api<Pod>,
    pod: String,
    remote_port: u16,
    listener: TcpListener,
}

#[async_trait]
impl TunnelSession for PodTunnelSession {
    /// Serves local connections until one of the per-connection streams
    /// reports a transport failure; the supervisor then reselects a pod.
    async fn forward(self: Box<Self>) -> Result<(), TunnelError> {
        let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(1);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (conn, _) = accepted?;
                    let pods = self.pods.clone();
                    let pod = self.pod.clone();
                    let remote_port = self.remote_port;
                    let err_tx = err_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_connection(&pods, &pod, remote_port, conn).await {
                            let _ = err_tx.try_send(e);
                        }
                    });
                }
                Some(e) = err_rx.recv() => return Err(e),
            }
        }
    }
}

/// Pumps one accepted local connection through a fresh port-forward stream.
async fn forward_connection(
    pods: &Api<Pod>,
    pod: &str,
    remote_port: u16,
    mut conn: TcpStream,
) -> Result<(), TunnelError> {
    let mut forwarder = pods.portforward(pod, &[remote_port]).await?;
    let mut upstream = forwarder
        .take_stream(remote_port)
        .ok_or_else(|| TunnelError::Stream(format!("no stream for port {}", remote_port)))?;

    copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| TunnelError::Stream(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pod(name: &str, phase: &str, ready: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_name(p: Option<&Pod>) -> Option<&str> {
        p.and_then(|p| p.metadata.name.as_deref())
    }

    #[test]
    fn test_pick_pod_prefers_ready() {
        let pods = vec![
            pod("not-ready", "Running", Some("False")),
            pod("ready", "Running", Some("True")),
        ];
        assert_eq!(pod_name(pick_pod(&pods)), Some("ready"));
    }

    #[test]
    fn test_pick_pod_falls_back_to_first() {
        let pods = vec![
            pod("pending", "Pending", None),
            pod("also-not-ready", "Running", Some("False")),
        ];
        assert_eq!(pod_name(pick_pod(&pods)), Some("pending"));
    }

    #[test]
    fn test_pick_pod_requires_running_phase() {
        // Ready=True but phase Succeeded is not selectable as "ready"
        let pods = vec![
            pod("done", "Succeeded", Some("True")),
            pod("live", "Running", Some("True")),
        ];
        assert_eq!(pod_name(pick_pod(&pods)), Some("live"));
    }

    #[test]
    fn test_pick_pod_empty_list() {
        assert!(pick_pod(&[]).is_none());
    }

    #[test]
    fn test_service_selector_empty_is_none() {
        use k8s_openapi::api::core::v1::ServiceSpec;

        let no_spec = Service::default();
        assert!(service_selector(no_spec).is_none());

        let empty = Service {
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(service_selector(empty).is_none());

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let selecting = Service {
            spec: Some(ServiceSpec {
                selector: Some(labels.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(service_selector(selecting), Some(labels));
    }

    #[test]
    fn test_label_selector_string() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        selector.insert("tier".to_string(), "frontend".to_string());
        assert_eq!(label_selector_string(&selector), "app=web,tier=frontend");
    }

    #[test]
    fn test_free_local_port() {
        let port = free_local_port().unwrap();
        assert!(port > 0);
    }

    // ------------------------------------------------------------------
    // Supervisor loop with fake capabilities
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct FailingSelector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PodSelector for FailingSelector {
        async fn select_pod(&self, namespace: &str, service: &str) -> Result<String, TunnelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TunnelError::NoPods {
                namespace: namespace.to_string(),
                service: service.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct FixedSelector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PodSelector for FixedSelector {
        async fn select_pod(&self, _namespace: &str, _service: &str) -> Result<String, TunnelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("pod-0".to_string())
        }
    }

    /// Opener whose sessions either fail straight away or hang forever.
    #[derive(Default)]
    struct FakeOpener {
        opens: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl TunnelOpener for FakeOpener {
        async fn open(&self, _target: &TunnelTarget) -> Result<Box<dyn TunnelSession>, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession { hang: self.hang }))
        }
    }

    struct FakeSession {
        hang: bool,
    }

    #[async_trait]
    impl TunnelSession for FakeSession {
        async fn forward(self: Box<Self>) -> Result<(), TunnelError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(TunnelError::Stream("connection reset".to_string()))
        }
    }

    fn spec() -> ForwardSpec {
        ForwardSpec {
            namespace: "ns".to_string(),
            service: "svc".to_string(),
            local_port: 12345,
            remote_port: 80,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_exits_when_cancelled_before_start() {
        let selector = Arc::new(FixedSelector::default());
        let opener = Arc::new(FakeOpener::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        supervise_tunnel(selector.clone(), opener.clone(), spec(), cancel).await;

        assert_eq!(selector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_retries_selection_failures() {
        let selector = Arc::new(FailingSelector::default());
        let opener = Arc::new(FakeOpener::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise_tunnel(
            selector.clone(),
            opener.clone(),
            spec(),
            cancel.clone(),
        ));

        // Virtual time: lets several backoff periods elapse
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(selector.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_reconnects_after_tunnel_ends() {
        let selector = Arc::new(FixedSelector::default());
        let opener = Arc::new(FakeOpener::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise_tunnel(
            selector.clone(),
            opener.clone(),
            spec(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(opener.opens.load(Ordering::SeqCst) >= 2);
        // Every reconnect goes back through pod selection
        assert!(selector.calls.load(Ordering::SeqCst) >= opener.opens.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_cancelled_while_forwarding() {
        let selector = Arc::new(FixedSelector::default());
        let opener = Arc::new(FakeOpener {
            opens: AtomicUsize::new(0),
            hang: true,
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise_tunnel(
            selector.clone(),
            opener.clone(),
            spec(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        // Connected once and stayed in Forward until cancellation
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnect_delay_is_fixed_300ms() {
        assert_eq!(RECONNECT_DELAY, Duration::from_millis(300));
    }
}
