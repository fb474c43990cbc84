use std::time::Duration;

use podtail_types::PodContainer;

use crate::filter::LineFilter;
use crate::source::LogRequest;

/// Settings shared by every tail, supplied once at startup
#[derive(Clone, Debug, Default)]
pub struct TailConfig {
    /// Ask the kubelet for timestamps and keep them on each line
    pub timestamps: bool,
    /// Only fetch history newer than this
    pub since: Option<Duration>,
    /// Lines matching any of these patterns are dropped
    pub exclude: LineFilter,
    /// Show the namespace next to the pod name (all-namespaces mode)
    pub include_namespace: bool,
    /// Number of history lines per container; `None` fetches everything
    pub tail_lines: Option<i64>,
}

impl TailConfig {
    /// Options for following a running container
    pub fn live(&self) -> TailOptions {
        self.options(true, false)
    }

    /// Options for replaying the output of a terminated container once
    pub fn replay(&self) -> TailOptions {
        self.options(false, true)
    }

    fn options(&self, follow: bool, previous: bool) -> TailOptions {
        TailOptions {
            follow,
            previous,
            timestamps: self.timestamps,
            since: self.since,
            exclude: self.exclude.clone(),
            include_namespace: self.include_namespace,
            tail_lines: self.tail_lines,
        }
    }
}

/// Options for a single tail
#[derive(Clone, Debug)]
pub struct TailOptions {
    /// Keep reading new output as it is produced
    pub follow: bool,
    /// Read the previous (terminated) instance of the container
    pub previous: bool,
    pub timestamps: bool,
    pub since: Option<Duration>,
    pub exclude: LineFilter,
    pub include_namespace: bool,
    pub tail_lines: Option<i64>,
}

impl TailOptions {
    /// Replay tails read a bounded history and stop on their own
    pub fn is_replay(&self) -> bool {
        !self.follow
    }

    /// Initial log request for a container
    pub fn request(&self, target: &PodContainer) -> LogRequest {
        LogRequest {
            namespace: target.namespace.clone(),
            pod: target.pod_name.clone(),
            container: target.container_name.clone(),
            follow: self.follow,
            previous: self.previous,
            since_seconds: self.since.map(|d| d.as_secs().max(1) as i64),
            tail_lines: self.tail_lines.filter(|n| *n >= 0),
            timestamps: self.timestamps,
        }
    }
}
