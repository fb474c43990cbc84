//! Log transport
//!
//! [`LogSource`] is the seam between a tail worker and the cluster: it opens a
//! read of one container's log and hands back a stream of lines.
//! [`KubeLogSource`] implements it on the pod log subresource.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, pin_mut};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Lines buffered between the HTTP reader and the tail worker
const LINE_BUFFER: usize = 256;

/// A lazily read sequence of raw log lines
pub type LogLines = BoxStream<'static, Result<String, SourceError>>;

/// Failure to open or read a container log
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open log stream: {0}")]
    Open(#[source] kube::Error),

    #[error("log stream read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// The API server reports the pod or container no longer exists
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Open(kube::Error::Api(response)) if response.code == 404)
    }
}

/// Parameters for one log read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub follow: bool,
    pub previous: bool,
    pub since_seconds: Option<i64>,
    pub tail_lines: Option<i64>,
    pub timestamps: bool,
}

impl LogRequest {
    fn log_params(&self) -> LogParams {
        LogParams {
            container: Some(self.container.clone()),
            follow: self.follow,
            previous: self.previous,
            since_seconds: self.since_seconds,
            tail_lines: self.tail_lines,
            timestamps: self.timestamps,
            ..Default::default()
        }
    }
}

/// Opens container log streams
pub trait LogSource: Send + Sync + 'static {
    /// Resolves once the stream is open (or failed to open)
    fn open(&self, request: LogRequest) -> BoxFuture<'static, Result<LogLines, SourceError>>;
}

/// Log source backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLogSource {
    client: kube::Client,
}

impl KubeLogSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl LogSource for KubeLogSource {
    fn open(&self, request: LogRequest) -> BoxFuture<'static, Result<LogLines, SourceError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);

        Box::pin(async move {
            let (opened_tx, opened_rx) = oneshot::channel();
            let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);

            // The reader borrows the Api, so both live on a task of their own
            // and lines are handed over through a channel.
            tokio::spawn(async move {
                let params = request.log_params();
                let reader = match api.log_stream(&request.pod, &params).await {
                    Ok(reader) => {
                        let _ = opened_tx.send(Ok(()));
                        reader
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(SourceError::Open(e)));
                        return;
                    }
                };

                let lines = reader.lines();
                pin_mut!(lines);

                loop {
                    let next = tokio::select! {
                        // Receiver dropped: the tail was closed or cancelled
                        _ = line_tx.closed() => break,
                        next = lines.next() => next,
                    };

                    let Some(item) = next else {
                        break;
                    };

                    if line_tx.send(item.map_err(SourceError::from)).await.is_err() {
                        break;
                    }
                }
            });

            match opened_rx.await {
                Ok(Ok(())) => Ok(receiver_lines(line_rx)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(SourceError::Other(
                    "log stream task ended before opening".to_string(),
                )),
            }
        })
    }
}

fn receiver_lines(rx: mpsc::Receiver<Result<String, SourceError>>) -> LogLines {
    futures::stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_params() {
        let request = LogRequest {
            namespace: "default".to_string(),
            pod: "web-1".to_string(),
            container: "app".to_string(),
            follow: false,
            previous: true,
            since_seconds: Some(60),
            tail_lines: Some(5),
            timestamps: true,
        };

        let params = request.log_params();
        assert_eq!(params.container.as_deref(), Some("app"));
        assert!(!params.follow);
        assert!(params.previous);
        assert_eq!(params.since_seconds, Some(60));
        assert_eq!(params.tail_lines, Some(5));
        assert!(params.timestamps);
    }

    fn api_error(code: u16) -> SourceError {
        SourceError::Open(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"web-1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        }))
    }

    #[test]
    fn test_only_not_found_is_gone() {
        assert!(api_error(404).is_gone());
        assert!(!api_error(400).is_gone());
        assert!(!api_error(500).is_gone());
        assert!(!SourceError::Other("connection reset".to_string()).is_gone());
    }

    #[tokio::test]
    async fn test_receiver_lines_ends_with_channel() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("one".to_string())).await.unwrap();
        tx.send(Ok("two".to_string())).await.unwrap();
        drop(tx);

        let lines: Vec<String> = receiver_lines(rx)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two"]);
    }
}
