//! Log tailing for podtail
//!
//! This crate provides the per-container tail workers, the registry that
//! tracks them, and the reconciler that starts and stops workers as the pod
//! watcher reports containers coming and going.

mod filter;
mod options;
mod parser;
mod reconcile;
mod registry;
mod source;
mod tail;

#[cfg(test)]
mod testing;

pub use filter::LineFilter;
pub use options::{TailConfig, TailOptions};
pub use parser::LogParser;
pub use reconcile::{Reconciled, Reconciler};
pub use registry::Registry;
pub use source::{KubeLogSource, LogLines, LogRequest, LogSource, SourceError};
pub use tail::{Tail, TailState};

// Re-export types used in our public API
pub use podtail_types::{LogLine, PodContainer, TailEvent, TargetId};
