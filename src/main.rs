use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podtail_k8s::{KubeClient, WatchQuery, resolve_namespace, watch};
use podtail_logs::{KubeLogSource, LineFilter, Reconciler, TailConfig, TailEvent};

mod config;
mod output;
mod shutdown;

use config::{ColorMode, FileConfig, OutputMode, Overrides, Settings};
use output::Renderer;
use shutdown::ShutdownReason;

/// How long to let buffered output drain after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Podtail - Tail the logs of every pod and container matching a query
#[derive(Parser, Debug)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pod name regular expression
    #[arg(value_name = "POD_QUERY")]
    pod_query: String,

    /// Container name regular expression [default: .*]
    #[arg(short = 'c', long)]
    container: Option<String>,

    /// Drop log lines matching this regular expression (repeatable)
    #[arg(short = 'e', long)]
    exclude: Vec<String>,

    /// Namespace to watch [default: the context's namespace]
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Watch pods in every namespace
    #[arg(long)]
    all_namespaces: bool,

    /// Label selector to filter pods on the server
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Kubeconfig context [default: current context]
    #[arg(long)]
    context: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Print the kubelet timestamp of each line
    #[arg(short = 't', long)]
    timestamps: bool,

    /// Only show logs newer than this duration, e.g. 5s, 2m, 3h [default: 48h]
    #[arg(short = 's', long)]
    since: Option<String>,

    /// Lines of history per container, -1 for all [default: -1]
    #[arg(long, allow_negative_numbers = true)]
    tail: Option<i64>,

    /// When to colour output [default: auto]
    #[arg(long, value_enum)]
    color: Option<ColorMode>,

    /// Output format [default: default]
    #[arg(short = 'o', long, value_enum)]
    output: Option<OutputMode>,

    /// Settings file [default: <config dir>/podtail/config.toml]
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log debug information to stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            container: self.container.clone(),
            exclude: self.exclude.clone(),
            since: self.since.clone(),
            tail: self.tail,
            timestamps: self.timestamps,
            color: self.color,
            output: self.output,
            context: self.context.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout carries the logs
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let file = FileConfig::load(args.config.as_deref())?;
    let settings = Settings::resolve(args.overrides(), file)?;

    // Bad patterns are reported before touching the cluster
    let pod_query = Regex::new(&args.pod_query)
        .with_context(|| format!("Invalid pod query '{}'", args.pod_query))?;
    let container_query = Regex::new(&settings.container)
        .with_context(|| format!("Invalid container query '{}'", settings.container))?;
    let exclude = LineFilter::new(&settings.exclude).context("Invalid exclude pattern")?;

    let kube_client =
        KubeClient::new(args.kubeconfig.as_deref()).context("Failed to load kubeconfig")?;
    let connection = kube_client
        .connect(settings.context.as_deref())
        .await
        .context("Failed to connect to cluster")?;

    let namespace = resolve_namespace(
        args.all_namespaces,
        args.namespace.as_deref(),
        &connection.default_namespace,
    );

    let root = CancellationToken::new();

    let query = WatchQuery::new(pod_query)
        .in_namespace(namespace)
        .with_containers(container_query)
        .with_selector(args.selector.clone());
    let streams = watch(connection.client.clone(), query, root.child_token())
        .await
        .context("Failed to watch pods")?;

    let (event_tx, event_rx) = mpsc::unbounded_channel::<TailEvent>();

    let renderer = Renderer::new(
        settings.output,
        settings.color,
        settings.timestamps,
        args.all_namespaces,
    );
    let render_token = root.clone();
    let render_task = tokio::spawn(async move {
        let result = output::render(event_rx, renderer, io::stdout(), io::stderr()).await;
        // Nothing left to write to; stop everything else
        if !render_token.is_cancelled() {
            tracing::debug!(reason = ?ShutdownReason::OutputClosed, "shutting down");
            render_token.cancel();
        }
        result
    });

    tokio::spawn({
        let token = root.clone();
        async move {
            if let Some(reason) = shutdown::cancel_on_signal(token).await {
                tracing::debug!(?reason, "shutting down");
            }
        }
    });

    let tail_config = TailConfig {
        timestamps: settings.timestamps,
        since: Some(settings.since).filter(|d| !d.is_zero()),
        exclude,
        include_namespace: args.all_namespaces,
        tail_lines: Some(settings.tail),
    };

    let source = Arc::new(KubeLogSource::new(connection.client));
    let mut reconciler = Reconciler::new(source, tail_config, event_tx);
    reconciler.run(streams, &root).await;

    if !root.is_cancelled() {
        tracing::debug!(reason = ?ShutdownReason::WatchEnded, "shutting down");
        root.cancel();
    }

    // Tails stop on the cancelled token and release their senders, which
    // closes the event channel once the reconciler's is dropped too
    drop(reconciler);

    match tokio::time::timeout(DRAIN_TIMEOUT, render_task).await {
        Ok(joined) => joined.context("Output task failed")?.context("Failed to write output")?,
        Err(_) => tracing::debug!("output did not drain in time"),
    }

    Ok(())
}
