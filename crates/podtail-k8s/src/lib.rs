//! Kubernetes client for podtail
//!
//! This crate provides kubeconfig loading, namespace resolution, and the pod
//! watcher that turns cluster events into container notifications.

mod client;
mod error;
mod watcher;

pub use client::{Connection, KubeClient, resolve_namespace};
pub use error::{K8sError, Result};
pub use watcher::{Notification, WatchQuery, WatchSenders, WatchStreams, watch};

// Re-export types that are used in our public API
pub use podtail_types::{PodContainer, TargetId};
