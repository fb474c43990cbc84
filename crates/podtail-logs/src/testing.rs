//! In-memory log source for tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use podtail_types::{PodContainer, TailEvent, TargetId};

use crate::source::{LogLines, LogRequest, LogSource, SourceError};
use crate::tail::{Tail, TailState};

/// How a scripted stream ends after its lines
#[derive(Clone, Copy, Debug)]
pub(crate) enum End {
    Eof,
    Pending,
    Error,
}

enum Script {
    Lines(Vec<String>, End),
    Fail,
    Gone,
}

/// Serves scripted responses per container, in order. Unscripted opens get
/// an empty stream that stays open when following and ends otherwise.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<HashMap<TargetId, VecDeque<Script>>>,
    requests: Mutex<Vec<LogRequest>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, target: &PodContainer, lines: &[&str], end: End) {
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.push(target, Script::Lines(lines, end));
    }

    pub(crate) fn fail(&self, target: &PodContainer) {
        self.push(target, Script::Fail);
    }

    /// The next open reports the pod as deleted
    pub(crate) fn gone(&self, target: &PodContainer) {
        self.push(target, Script::Gone);
    }

    pub(crate) fn requests(&self) -> Vec<LogRequest> {
        self.requests.lock().clone()
    }

    fn push(&self, target: &PodContainer, script: Script) {
        self.scripts
            .lock()
            .entry(target.identity())
            .or_default()
            .push_back(script);
    }
}

impl LogSource for ScriptedSource {
    fn open(&self, request: LogRequest) -> BoxFuture<'static, Result<LogLines, SourceError>> {
        self.requests.lock().push(request.clone());

        let id = TargetId {
            namespace: request.namespace.clone(),
            pod: request.pod.clone(),
            container: request.container.clone(),
        };
        let script = self
            .scripts
            .lock()
            .get_mut(&id)
            .and_then(|queue| queue.pop_front());

        let script = script.unwrap_or_else(|| {
            let end = if request.follow { End::Pending } else { End::Eof };
            Script::Lines(Vec::new(), end)
        });

        let result = match script {
            Script::Fail => Err(SourceError::Other(format!("no logs for {id}"))),
            Script::Gone => Err(SourceError::Open(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("pods \"{}\" not found", id.pod),
                    reason: "NotFound".to_string(),
                    code: 404,
                },
            ))),
            Script::Lines(lines, end) => {
                let tail: LogLines = match end {
                    End::Eof => stream::empty().boxed(),
                    End::Pending => stream::pending().boxed(),
                    End::Error => stream::once(async {
                        Err(SourceError::Other("connection reset".to_string()))
                    })
                    .boxed(),
                };
                Ok(stream::iter(lines.into_iter().map(Ok)).chain(tail).boxed())
            }
        };

        Box::pin(async move { result })
    }
}

/// Wait (bounded) until a tail reaches `state`
pub(crate) async fn wait_for_state(tail: &Tail, state: TailState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while tail.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "tail stuck in {:?}, expected {state:?}", tail.state());
}

/// Drain the line messages currently queued on a sink
pub(crate) fn collect_lines(rx: &mut mpsc::UnboundedReceiver<TailEvent>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TailEvent::Line(line) = event {
            lines.push(line.message);
        }
    }
    lines
}
