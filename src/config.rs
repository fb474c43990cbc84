//! Settings file and option layering
//!
//! Values come from three places, highest priority first: command line flags,
//! the TOML settings file, built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::Deserialize;

pub const DEFAULT_CONTAINER_QUERY: &str = ".*";
pub const DEFAULT_SINCE: Duration = Duration::from_secs(48 * 60 * 60);
/// All available history
pub const DEFAULT_TAIL: i64 = -1;

/// When to colour output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Only when stdout is a terminal
    #[default]
    Auto,
    Always,
    Never,
}

/// How log lines are printed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Pod and container prefix, coloured
    #[default]
    Default,
    /// Message only
    Raw,
    /// One JSON object per line
    Json,
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub container: Option<String>,
    pub exclude: Vec<String>,
    /// Go-style duration such as `1h30m`
    pub since: Option<String>,
    pub tail: Option<i64>,
    pub timestamps: Option<bool>,
    pub color: Option<ColorMode>,
    pub output: Option<OutputMode>,
    pub context: Option<String>,
}

impl FileConfig {
    /// Default location: `podtail/config.toml` under the platform config
    /// directory (`$XDG_CONFIG_HOME` on Linux, `~/Library/Application Support`
    /// on macOS)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("podtail").join("config.toml"))
    }

    /// Load the settings file.
    ///
    /// A file named explicitly must exist; a missing file at the default
    /// location just means no settings.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Flags that the settings file can supply defaults for. `None` (or an empty
/// list) means the flag was not given.
#[derive(Debug, Default)]
pub struct Overrides {
    pub container: Option<String>,
    pub exclude: Vec<String>,
    pub since: Option<String>,
    pub tail: Option<i64>,
    pub timestamps: bool,
    pub color: Option<ColorMode>,
    pub output: Option<OutputMode>,
    pub context: Option<String>,
}

/// Fully resolved tailing options
#[derive(Debug, PartialEq)]
pub struct Settings {
    pub container: String,
    pub exclude: Vec<String>,
    pub since: Duration,
    pub tail: i64,
    pub timestamps: bool,
    pub color: ColorMode,
    pub output: OutputMode,
    pub context: Option<String>,
}

impl Settings {
    pub fn resolve(cli: Overrides, file: FileConfig) -> Result<Self> {
        let since = match cli.since.or(file.since) {
            Some(raw) => {
                parse_duration(&raw).with_context(|| format!("Invalid --since value '{raw}'"))?
            }
            None => DEFAULT_SINCE,
        };

        // Exclusions on the command line replace the file's list
        let exclude = if cli.exclude.is_empty() {
            file.exclude
        } else {
            cli.exclude
        };

        Ok(Self {
            container: cli
                .container
                .or(file.container)
                .unwrap_or_else(|| DEFAULT_CONTAINER_QUERY.to_string()),
            exclude,
            since,
            tail: cli.tail.or(file.tail).unwrap_or(DEFAULT_TAIL),
            timestamps: cli.timestamps || file.timestamps.unwrap_or(false),
            color: cli.color.or(file.color).unwrap_or_default(),
            output: cli.output.or(file.output).unwrap_or_default(),
            context: cli.context.or(file.context),
        })
    }
}

/// Parse a Go-style duration: a sequence of decimal numbers each followed by
/// a unit (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`), e.g. `48h`, `1h30m`,
/// `1.5s`. A bare `0` is allowed.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            bail!("expected a number in '{s}'");
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .with_context(|| format!("invalid number '{number}' in '{s}'"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => bail!("missing unit in '{s}'"),
            other => bail!("unknown unit '{other}' in '{s}'"),
        };

        total_nanos += value * nanos_per_unit;
        rest = tail;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
