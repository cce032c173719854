//! Kubernetes client construction.

use kube::Client;

/// Creates a client from the ambient environment, following the same
/// discovery order as kubectl: in-cluster service account if present,
/// otherwise `$KUBECONFIG`, otherwise `~/.kube/config`, using the
/// kubeconfig's current context.
pub async fn new_client() -> Result<Client, kube::Error> {
    Client::try_default().await
}
