//! Tail worker
//!
//! A [`Tail`] owns the log stream of one container. Starting it spawns a task
//! that reads lines from a [`LogSource`] and forwards them to the output sink.
//!
//! ```text
//! Starting ──start──▶ Streaming ──close──▶ Stopping ──task exits──▶ Stopped
//!                         │                                            ▲
//!                         └──── stream ended / no stream / cancelled ──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use podtail_types::{PodContainer, TailEvent, TargetId};

use crate::options::TailOptions;
use crate::parser::LogParser;
use crate::source::{LogLines, LogSource, SourceError};

const BACKOFF_MIN: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Lifecycle state of a tail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailState {
    /// Created, not started yet
    Starting,
    /// Reading lines
    Streaming,
    /// Close requested, task still winding down
    Stopping,
    /// Finished; nothing left running
    Stopped,
}

/// Log stream of a single container
pub struct Tail {
    target: PodContainer,
    options: Arc<TailOptions>,
    sink: mpsc::UnboundedSender<TailEvent>,

    /// Shared with the streaming task, which marks the tail stopped on exit
    state: Arc<RwLock<TailState>>,

    /// Child of the token passed to `start`
    cancel: Option<CancellationToken>,
}

impl Tail {
    pub fn new(
        target: PodContainer,
        options: TailOptions,
        sink: mpsc::UnboundedSender<TailEvent>,
    ) -> Self {
        Self {
            target,
            options: Arc::new(options),
            sink,
            state: Arc::new(RwLock::new(TailState::Starting)),
            cancel: None,
        }
    }

    pub fn identity(&self) -> TargetId {
        self.target.identity()
    }

    pub fn target(&self) -> &PodContainer {
        &self.target
    }

    pub fn options(&self) -> &TailOptions {
        &self.options
    }

    pub fn state(&self) -> TailState {
        *self.state.read()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TailState::Stopped
    }

    /// Start streaming on a new task. Returns immediately; calling it again is
    /// a no-op.
    ///
    /// The task is bound to a child of `ctx`, so cancelling `ctx` stops it
    /// even if `close` is never called.
    pub fn start(&mut self, ctx: &CancellationToken, source: Arc<dyn LogSource>) {
        {
            let mut state = self.state.write();
            if *state != TailState::Starting {
                return;
            }
            *state = TailState::Streaming;
        }

        let cancel = ctx.child_token();
        let _ = self.sink.send(TailEvent::Opened(self.target.clone()));

        let stream = TailStream {
            target: self.target.clone(),
            options: Arc::clone(&self.options),
            sink: self.sink.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
            source,
        };

        tokio::spawn(stream.run());
        self.cancel = Some(cancel);
    }

    /// Stop streaming. Idempotent, and safe on a tail that already stopped.
    ///
    /// `Closed` is sent once for every started tail, either here or by the
    /// streaming task when it ends on its own.
    pub fn close(&mut self) {
        let announce = {
            let mut state = self.state.write();
            match *state {
                TailState::Stopping | TailState::Stopped => return,
                TailState::Starting => {
                    *state = TailState::Stopped;
                    false
                }
                TailState::Streaming => {
                    *state = TailState::Stopping;
                    true
                }
            }
        };

        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }

        if announce {
            let _ = self.sink.send(TailEvent::Closed(self.target.clone()));
        }
    }
}

impl std::fmt::Debug for Tail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tail")
            .field("target", &self.target)
            .field("state", &self.state())
            .field("follow", &self.options.follow)
            .finish()
    }
}

/// Why a streaming task ended
#[derive(Debug)]
enum TailEnd {
    /// The log ended (replay done, or the container is gone)
    Finished,
    Cancelled,
    /// Nobody is listening anymore
    SinkClosed,
    /// The container never produced a readable stream
    Unavailable(SourceError),
    /// A replay read broke off
    Failed(SourceError),
}

/// How one connection ended
enum StreamEnd {
    Eof,
    Cancelled,
    SinkClosed,
    Error(SourceError),
}

/// State owned by the spawned streaming task
struct TailStream {
    target: PodContainer,
    options: Arc<TailOptions>,
    sink: mpsc::UnboundedSender<TailEvent>,
    state: Arc<RwLock<TailState>>,
    cancel: CancellationToken,
    source: Arc<dyn LogSource>,
}

impl TailStream {
    async fn run(self) {
        let end = self.stream_logs().await;

        match &end {
            TailEnd::Unavailable(e) => tracing::debug!(
                namespace = %self.target.namespace,
                pod = %self.target.pod_name,
                container = %self.target.container_name,
                error = %e,
                "no log stream available"
            ),
            TailEnd::Failed(e) => tracing::warn!(
                namespace = %self.target.namespace,
                pod = %self.target.pod_name,
                container = %self.target.container_name,
                error = %e,
                "log stream failed"
            ),
            other => tracing::debug!(
                namespace = %self.target.namespace,
                pod = %self.target.pod_name,
                container = %self.target.container_name,
                end = ?other,
                "tail finished"
            ),
        }

        // A closed tail has already announced itself
        let mut state = self.state.write();
        if *state == TailState::Streaming {
            let _ = self.sink.send(TailEvent::Closed(self.target.clone()));
        }
        *state = TailState::Stopped;
    }

    async fn stream_logs(&self) -> TailEnd {
        let mut request = self.options.request(&self.target);
        let mut backoff = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);
        let mut connected = false;
        let mut failures = 0u32;

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return TailEnd::Cancelled,
                opened = self.source.open(request.clone()) => opened,
            };

            let (end, forwarded) = match opened {
                Ok(lines) => {
                    connected = true;
                    self.forward(lines).await
                }
                Err(e) if !connected && request.previous => {
                    // No previous instance: the terminated container is the current one
                    tracing::debug!(
                        pod = %self.target.pod_name,
                        container = %self.target.container_name,
                        error = %e,
                        "previous logs unavailable; reading current instance"
                    );
                    request.previous = false;
                    continue;
                }
                Err(e) if !self.options.follow => return TailEnd::Unavailable(e),
                // The pod is gone; its removal will be reported by the watcher
                Err(e) if e.is_gone() => return TailEnd::Finished,
                Err(e) => (StreamEnd::Error(e), 0),
            };

            if forwarded > 0 {
                failures = 0;
                backoff.reset();
            }

            match end {
                StreamEnd::Cancelled => return TailEnd::Cancelled,
                StreamEnd::SinkClosed => return TailEnd::SinkClosed,
                StreamEnd::Eof if !self.options.follow => return TailEnd::Finished,
                StreamEnd::Error(e) if !self.options.follow => return TailEnd::Failed(e),
                // The kubelet drops idle connections and ends the stream when
                // the container restarts; keep following until closed
                StreamEnd::Eof => {}
                StreamEnd::Error(e) => {
                    failures += 1;
                    if failures == 1 {
                        tracing::warn!(
                            namespace = %self.target.namespace,
                            pod = %self.target.pod_name,
                            container = %self.target.container_name,
                            error = %e,
                            "log stream interrupted; reconnecting"
                        );
                    } else {
                        tracing::debug!(
                            pod = %self.target.pod_name,
                            container = %self.target.container_name,
                            failures,
                            error = %e,
                            "reconnect failed"
                        );
                    }
                }
            }

            // Reconnects only pick up new output
            request.tail_lines = Some(0);
            request.since_seconds = None;

            if !self.sleep_or_cancel(backoff.next_delay()).await {
                return TailEnd::Cancelled;
            }
        }
    }

    /// Forward lines until the stream ends. Also returns how many lines were read.
    async fn forward(&self, mut lines: LogLines) -> (StreamEnd, u64) {
        let mut read = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return (StreamEnd::Cancelled, read),
                next = lines.next() => next,
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return (StreamEnd::Error(e), read),
                None => return (StreamEnd::Eof, read),
            };
            read += 1;

            let line = LogParser::parse(&raw, &self.target, self.options.timestamps);
            if self.options.exclude.excludes(&line.message) {
                continue;
            }

            if self.sink.send(TailEvent::Line(line)).is_err() {
                return (StreamEnd::SinkClosed, read);
            }
        }
    }

    /// Returns false if cancelled while sleeping
    async fn sleep_or_cancel(&self, d: Duration) -> bool {
        tokio::select! {
            _ = sleep(d) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

struct Backoff {
    cur: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { cur: min, min, max }
    }

    fn reset(&mut self) {
        self.cur = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let d = self.cur;
        self.cur = std::cmp::min(self.cur * 2, self.max);
        d
    }
}
