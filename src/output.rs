//! Terminal output
//!
//! Log lines go to stdout. Tail open/close markers go to stderr so they never
//! mix into piped output.

use std::io::{self, IsTerminal, Write};

use chrono::SecondsFormat;
use crossterm::style::{Color, Stylize};
use tokio::sync::mpsc;

use podtail_types::{LogLine, PodContainer, TailEvent};

use crate::config::{ColorMode, OutputMode};

const PALETTE: [Color; 10] = [
    Color::Cyan,
    Color::Green,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::DarkCyan,
    Color::DarkGreen,
    Color::DarkMagenta,
    Color::DarkYellow,
    Color::DarkBlue,
];

/// Formats tail events for the terminal
#[derive(Clone, Copy, Debug)]
pub struct Renderer {
    mode: OutputMode,
    color: bool,
    timestamps: bool,
    include_namespace: bool,
}

impl Renderer {
    pub fn new(
        mode: OutputMode,
        color: ColorMode,
        timestamps: bool,
        include_namespace: bool,
    ) -> Self {
        let color = match color {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => io::stdout().is_terminal(),
        };

        Self {
            mode,
            color,
            timestamps,
            include_namespace,
        }
    }

    /// Render one log line (without the trailing newline)
    pub fn format_line(&self, line: &LogLine) -> io::Result<String> {
        match self.mode {
            OutputMode::Raw => Ok(line.message.clone()),
            OutputMode::Json => serde_json::to_string(line).map_err(io::Error::other),
            OutputMode::Default => Ok(self.format_default(line)),
        }
    }

    fn format_default(&self, line: &LogLine) -> String {
        let mut out = String::new();

        if self.include_namespace {
            out.push_str(&format!("[{}] ", line.namespace));
        }

        let (pod_color, container_color) = colors_for(&line.pod_name);
        out.push_str(&self.paint(&line.pod_name, pod_color));
        out.push(' ');
        out.push_str(&self.paint(&line.container_name, container_color));
        out.push(' ');

        if self.timestamps {
            if let Some(ts) = &line.timestamp {
                out.push_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true));
                out.push(' ');
            }
        }

        out.push_str(&line.message);
        out
    }

    /// Render an open (`+`) or close (`-`) marker
    pub fn format_marker(&self, target: &PodContainer, opened: bool) -> String {
        let (sign, color) = if opened {
            ("+", Color::Green)
        } else {
            ("-", Color::Red)
        };

        let namespace = if self.include_namespace {
            format!("[{}] ", target.namespace)
        } else {
            String::new()
        };

        format!(
            "{} {namespace}{} › {}",
            self.paint(sign, color),
            target.pod_name,
            target.container_name
        )
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }
}

/// Colours for a pod and its containers, stable across runs
fn colors_for(pod: &str) -> (Color, Color) {
    let hash = fnv1a(pod.as_bytes());
    let pod = PALETTE[(hash % PALETTE.len() as u64) as usize];
    let container = PALETTE[((hash >> 32) % PALETTE.len() as u64) as usize];
    (pod, container)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Write events until the channel closes.
///
/// Returns `Ok` when the reader of stdout goes away.
pub async fn render<O, E>(
    mut rx: mpsc::UnboundedReceiver<TailEvent>,
    renderer: Renderer,
    mut out: O,
    mut err: E,
) -> io::Result<()>
where
    O: Write,
    E: Write,
{
    while let Some(event) = rx.recv().await {
        let written = match &event {
            TailEvent::Line(line) => renderer
                .format_line(line)
                .and_then(|text| writeln!(out, "{text}"))
                .and_then(|()| out.flush()),
            TailEvent::Opened(target) => writeln!(err, "{}", renderer.format_marker(target, true)),
            TailEvent::Closed(target) => writeln!(err, "{}", renderer.format_marker(target, false)),
        };

        match written {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
