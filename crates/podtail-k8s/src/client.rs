//! Kubernetes client for podtail

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{K8sError, Result};

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

/// A live connection to one context of the cluster
#[derive(Clone)]
pub struct Connection {
    pub client: kube::Client,
    /// Namespace configured for the context ("default" when unset)
    pub default_namespace: String,
}

impl KubeClient {
    /// Load the kubeconfig from an explicit path, or from `KUBECONFIG` and
    /// `~/.kube/config` when no path is given
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path)?,
            None => Kubeconfig::read()?,
        };

        Ok(Self::from_kubeconfig(kubeconfig))
    }

    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        let current_context = kubeconfig.current_context.clone();
        Self {
            kubeconfig,
            current_context,
        }
    }

    /// Names of all contexts in the kubeconfig
    pub fn context_names(&self) -> Vec<&str> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| ctx.name.as_str())
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Build the client configuration for a context (the current one if `None`)
    pub async fn config_for_context(&self, context: Option<&str>) -> Result<kube::Config> {
        if let Some(name) = context {
            if !self.kubeconfig.contexts.iter().any(|c| c.name == name) {
                return Err(K8sError::ContextNotFound(name.to_string()));
            }
        }

        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        kube::Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options)
            .await
            .map_err(|source| K8sError::Config {
                context: context
                    .or(self.current_context())
                    .unwrap_or("<current>")
                    .to_string(),
                source,
            })
    }

    /// Connect to a context (the current one if `None`)
    pub async fn connect(&self, context: Option<&str>) -> Result<Connection> {
        let config = self.config_for_context(context).await?;
        let default_namespace = config.default_namespace.clone();
        let client = kube::Client::try_from(config).map_err(K8sError::Client)?;

        tracing::debug!(
            context = context.or(self.current_context()).unwrap_or_default(),
            namespace = %default_namespace,
            "connected to cluster"
        );

        Ok(Connection {
            client,
            default_namespace,
        })
    }
}

/// Pick the namespace to watch. `None` means every namespace.
///
/// All-namespaces wins over an explicit namespace; an explicit namespace wins
/// over the context's default.
pub fn resolve_namespace(
    all_namespaces: bool,
    explicit: Option<&str>,
    context_default: &str,
) -> Option<String> {
    if all_namespaces {
        return None;
    }

    match explicit {
        Some(ns) if !ns.is_empty() => Some(ns.to_string()),
        _ => Some(context_default.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: http://127.0.0.1:6443
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: team-a
- name: bare
  context:
    cluster: dev-cluster
    user: dev-user
users:
- name: dev-user
  user:
    token: abc123
"#;

    fn client() -> KubeClient {
        KubeClient::from_kubeconfig(Kubeconfig::from_yaml(KUBECONFIG).unwrap())
    }

    #[test]
    fn test_context_names() {
        let client = client();
        assert_eq!(client.context_names(), vec!["dev", "bare"]);
        assert_eq!(client.current_context(), Some("dev"));
    }

    #[tokio::test]
    async fn test_context_default_namespace() {
        let client = client();

        let config = client.config_for_context(None).await.unwrap();
        assert_eq!(config.default_namespace, "team-a");

        let config = client.config_for_context(Some("bare")).await.unwrap();
        assert_eq!(config.default_namespace, "default");
    }

    #[tokio::test]
    async fn test_unknown_context_is_setup_failure() {
        let err = client().config_for_context(Some("prod")).await.unwrap_err();
        assert!(matches!(err, K8sError::ContextNotFound(name) if name == "prod"));
    }

    #[test]
    fn test_resolve_namespace() {
        assert_eq!(resolve_namespace(true, Some("kube-system"), "team-a"), None);
        assert_eq!(
            resolve_namespace(false, Some("kube-system"), "team-a").as_deref(),
            Some("kube-system")
        );
        assert_eq!(resolve_namespace(false, None, "team-a").as_deref(), Some("team-a"));
        assert_eq!(resolve_namespace(false, Some(""), "team-a").as_deref(), Some("team-a"));
    }
}
