//! Watch-to-tail reconciliation
//!
//! The [`Reconciler`] consumes the watcher's three notification streams and
//! keeps exactly one tail per live container:
//!
//! - `added`: start a following tail unless the identity is already tracked
//! - `terminated`: start a replay tail unless the identity is already tracked
//! - `removed`: close and forget the tail, if any
//!
//! `added` and `terminated` share one duplicate check, so whichever arrives
//! first for an identity wins and the other is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podtail_k8s::WatchStreams;
use podtail_types::{PodContainer, TailEvent};

use crate::options::{TailConfig, TailOptions};
use crate::registry::Registry;
use crate::source::LogSource;
use crate::tail::Tail;

/// What handling one notification did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// A new tail was created and started
    Started,
    /// The identity was already tracked; nothing changed
    Duplicate,
    /// A tracked tail was closed and removed
    Closed,
    /// Removal of an identity that was never tracked
    Untracked,
}

/// Sole owner of the tail registry
pub struct Reconciler {
    registry: Registry,
    source: Arc<dyn LogSource>,
    config: TailConfig,
    sink: mpsc::UnboundedSender<TailEvent>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn LogSource>,
        config: TailConfig,
        sink: mpsc::UnboundedSender<TailEvent>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            source,
            config,
            sink,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Consume notifications until `ctx` is cancelled or any stream closes.
    ///
    /// Tails still running when this returns are left alone; they are bound
    /// to children of `ctx` and stop when it is cancelled.
    pub async fn run(&mut self, mut streams: WatchStreams, ctx: &CancellationToken) {
        loop {
            if ctx.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;

                _ = ctx.cancelled() => break,

                pc = streams.added.recv() => match pc {
                    Some(pc) => { self.added(pc, ctx); }
                    None => break,
                },

                pc = streams.terminated.recv() => match pc {
                    Some(pc) => { self.terminated(pc, ctx); }
                    None => break,
                },

                pc = streams.removed.recv() => match pc {
                    Some(pc) => { self.removed(pc); }
                    None => break,
                },
            }
        }

        tracing::debug!(active = self.registry.len(), "reconciler stopped");
    }

    /// A running container appeared: follow it
    pub fn added(&mut self, pc: PodContainer, ctx: &CancellationToken) -> Reconciled {
        let options = self.config.live();
        self.start_tail(pc, options, ctx)
    }

    /// A container terminated: replay its final output once
    pub fn terminated(&mut self, pc: PodContainer, ctx: &CancellationToken) -> Reconciled {
        let options = self.config.replay();
        self.start_tail(pc, options, ctx)
    }

    /// A container went away: stop its tail
    pub fn removed(&mut self, pc: PodContainer) -> Reconciled {
        self.registry.sweep_stopped();

        let id = pc.identity();
        match self.registry.remove(&id) {
            Some(mut tail) => {
                tail.close();
                tracing::debug!(target_id = %id, "closed tail");
                Reconciled::Closed
            }
            None => Reconciled::Untracked,
        }
    }

    fn start_tail(
        &mut self,
        pc: PodContainer,
        options: TailOptions,
        ctx: &CancellationToken,
    ) -> Reconciled {
        self.registry.sweep_stopped();

        let id = pc.identity();
        if self.registry.contains(&id) {
            tracing::trace!(target_id = %id, "already tailing; ignoring");
            return Reconciled::Duplicate;
        }

        let replay = options.is_replay();
        let tail = Tail::new(pc, options, self.sink.clone());
        let Some(tail) = self.registry.insert(tail) else {
            return Reconciled::Duplicate;
        };
        tail.start(ctx, Arc::clone(&self.source));

        tracing::debug!(target_id = %id, replay, "started tail");
        Reconciled::Started
    }
}
