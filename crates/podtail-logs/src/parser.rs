use chrono::{DateTime, Utc};

use podtail_types::{LogLine, PodContainer};

/// Log parser for turning raw stream lines into [`LogLine`]s
pub struct LogParser;

impl LogParser {
    /// Parse a raw log line. When `timestamps` is set the kubelet prefixes
    /// every line with an RFC 3339 timestamp, which is split off.
    pub fn parse(raw: &str, target: &PodContainer, timestamps: bool) -> LogLine {
        let raw = raw.trim_end_matches(['\n', '\r']);

        let (timestamp, content) = if timestamps {
            Self::extract_k8s_timestamp(raw)
        } else {
            (None, raw)
        };

        let mut line = LogLine::new(target, content.to_string());
        line.timestamp = timestamp;
        line
    }

    /// Extract Kubernetes timestamp from the beginning of a log line
    fn extract_k8s_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // Format: 2024-01-15T10:30:00.123456789Z <message>
        let (prefix, rest) = match raw.split_once(' ') {
            Some(parts) => parts,
            None => (raw, ""),
        };

        match DateTime::parse_from_rfc3339(prefix) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), rest),
            Err(_) => (None, raw),
        }
    }
}
