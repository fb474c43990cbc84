//! Shared types for podtail
//!
//! This crate contains the values passed between the pod watcher, the tail
//! workers and the output renderer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Tail Targets
// ============================================================================

/// Stable key naming one (namespace, pod, container) triple.
///
/// Equality and hashing are structural, so two distinct triples never collide
/// even when their concatenations would.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// One container of one pod, as observed by the watcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodContainer {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

impl PodContainer {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
        }
    }

    /// Registry key for this container
    pub fn identity(&self) -> TargetId {
        TargetId {
            namespace: self.namespace.clone(),
            pod: self.pod_name.clone(),
            container: self.container_name.clone(),
        }
    }
}

impl fmt::Display for PodContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace, self.pod_name, self.container_name
        )
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A single line read from a container's log stream
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub namespace: String,

    #[serde(rename = "pod")]
    pub pod_name: String,

    #[serde(rename = "container")]
    pub container_name: String,

    /// Timestamp reported by the kubelet (only when timestamps were requested)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Line content without the trailing newline or timestamp prefix
    pub message: String,
}

impl LogLine {
    pub fn new(target: &PodContainer, message: String) -> Self {
        Self {
            namespace: target.namespace.clone(),
            pod_name: target.pod_name.clone(),
            container_name: target.container_name.clone(),
            timestamp: None,
            message,
        }
    }
}

/// Everything a tail worker sends to the output sink
#[derive(Clone, Debug)]
pub enum TailEvent {
    /// A worker started tailing this container
    Opened(PodContainer),
    /// A log line was read
    Line(LogLine),
    /// A worker was closed because its container went away
    Closed(PodContainer),
}
