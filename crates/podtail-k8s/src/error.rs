use kube::config::KubeconfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, K8sError>;

/// Failures while connecting to the cluster or setting up the pod watch.
///
/// All of these are setup failures: once the watch is running, errors are
/// retried inside the watcher and never reach the caller.
#[derive(Debug, Error)]
pub enum K8sError {
    #[error("failed to read kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("context '{0}' not found in kubeconfig")]
    ContextNotFound(String),

    #[error("failed to create config for context '{context}': {source}")]
    Config {
        context: String,
        #[source]
        source: KubeconfigError,
    },

    #[error("failed to create client: {0}")]
    Client(#[source] kube::Error),

    #[error("failed to set up pod watch: {0}")]
    WatchSetup(#[source] kube::Error),
}
