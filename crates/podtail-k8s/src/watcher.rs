//! Pod watcher
//!
//! Observes the pods matching a [`WatchQuery`] and classifies every container
//! transition into one of three notification streams:
//!
//! - `added`: a running container that should be followed
//! - `terminated`: a stopped container whose final output can be replayed
//! - `removed`: a container whose pod was deleted
//!
//! Watch errors after setup are retried with kube's default backoff and never
//! close the streams. They close only on cancellation.

use std::collections::{HashMap, HashSet};

use futures::{StreamExt, pin_mut};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::ListParams;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podtail_types::{PodContainer, TargetId};

use crate::error::{K8sError, Result};

/// Buffer size of each notification channel
const CHANNEL_CAPACITY: usize = 128;

/// Which pods and containers to watch
#[derive(Clone, Debug)]
pub struct WatchQuery {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Pod names must match this pattern
    pub pod_query: Regex,
    /// Container names must match this pattern
    pub container_query: Regex,
    /// Kubernetes label selector, passed through to the API
    pub label_selector: Option<String>,
}

impl WatchQuery {
    /// Query matching every container of the pods whose name matches `pod_query`
    pub fn new(pod_query: Regex) -> Self {
        Self {
            namespace: None,
            pod_query,
            container_query: Regex::new(".*").expect("static regex"),
            label_selector: None,
        }
    }

    pub fn in_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_containers(mut self, container_query: Regex) -> Self {
        self.container_query = container_query;
        self
    }

    pub fn with_selector(mut self, selector: Option<String>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty());
        self
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }

    fn watcher_config(&self) -> watcher::Config {
        match &self.label_selector {
            Some(selector) => watcher::Config::default().labels(selector),
            None => watcher::Config::default(),
        }
    }

    fn matches_pod(&self, name: &str) -> bool {
        self.pod_query.is_match(name)
    }

    fn matches_container(&self, name: &str) -> bool {
        self.container_query.is_match(name)
    }
}

/// A classified container transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Added(PodContainer),
    Terminated(PodContainer),
    Removed(PodContainer),
}

/// Receiving side of the three notification streams
pub struct WatchStreams {
    pub added: mpsc::Receiver<PodContainer>,
    pub removed: mpsc::Receiver<PodContainer>,
    pub terminated: mpsc::Receiver<PodContainer>,
}

/// Sending side of the three notification streams
#[derive(Clone)]
pub struct WatchSenders {
    pub added: mpsc::Sender<PodContainer>,
    pub removed: mpsc::Sender<PodContainer>,
    pub terminated: mpsc::Sender<PodContainer>,
}

impl WatchStreams {
    /// Create a connected set of notification channels
    pub fn channel(capacity: usize) -> (WatchSenders, WatchStreams) {
        let (added_tx, added) = mpsc::channel(capacity);
        let (removed_tx, removed) = mpsc::channel(capacity);
        let (terminated_tx, terminated) = mpsc::channel(capacity);

        (
            WatchSenders {
                added: added_tx,
                removed: removed_tx,
                terminated: terminated_tx,
            },
            WatchStreams {
                added,
                removed,
                terminated,
            },
        )
    }
}

impl WatchSenders {
    /// Route a notification to its stream. Returns false once the receiver is gone.
    pub async fn send(&self, notification: Notification) -> bool {
        let result = match notification {
            Notification::Added(pc) => self.added.send(pc).await,
            Notification::Terminated(pc) => self.terminated.send(pc).await,
            Notification::Removed(pc) => self.removed.send(pc).await,
        };
        result.is_ok()
    }
}

/// Start watching pods.
///
/// A probing list call runs first, so an invalid selector, missing
/// permissions or an unreachable API server fail here and no streams are
/// produced. The watch itself runs on a spawned task until `cancel` fires.
pub async fn watch(
    client: Client,
    query: WatchQuery,
    cancel: CancellationToken,
) -> Result<WatchStreams> {
    let api: Api<Pod> = match &query.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    api.list(&query.list_params().limit(1))
        .await
        .map_err(K8sError::WatchSetup)?;

    let (senders, streams) = WatchStreams::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_watch(api, query, senders, cancel));

    Ok(streams)
}

async fn run_watch(
    api: Api<Pod>,
    query: WatchQuery,
    senders: WatchSenders,
    cancel: CancellationToken,
) {
    tracing::debug!(
        namespace = query.namespace.as_deref().unwrap_or("<all>"),
        pods = %query.pod_query,
        containers = %query.container_query,
        "starting pod watch"
    );

    let stream = watcher(api, query.watcher_config()).default_backoff();
    pin_mut!(stream);

    let mut classifier = Classifier::new(query);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                for notification in classifier.handle(event) {
                    let delivered = tokio::select! {
                        _ = cancel.cancelled() => false,
                        delivered = senders.send(notification) => delivered,
                    };
                    if !delivered {
                        tracing::debug!("pod watcher stopped");
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "pod watch error; retrying");
            }
            None => {
                tracing::warn!("pod watch stream ended");
                break;
            }
        }
    }

    // Dropping the senders closes all three streams
    tracing::debug!("pod watcher stopped");
}

/// Turns raw watch events into notifications, remembering which pods it has
/// reported so that deletions missed while the watch was reconnecting are
/// still reported once the re-list completes.
///
/// A terminated container instance is reported once. Later updates of the
/// same pod repeat its status unchanged and are not terminations.
struct Classifier {
    query: WatchQuery,
    known: HashMap<PodKey, Vec<PodContainer>>,
    relisted: Option<HashSet<PodKey>>,
    terminations: HashMap<TargetId, Termination>,
}

type PodKey = (String, String);

/// Which instance of a container terminated
#[derive(Clone, Debug, PartialEq, Eq)]
struct Termination {
    restart_count: i32,
    container_id: Option<String>,
}

impl Termination {
    fn of(status: &ContainerStatus) -> Self {
        let terminated = status
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .or_else(|| status.last_state.as_ref().and_then(|s| s.terminated.as_ref()));

        Self {
            restart_count: status.restart_count,
            container_id: terminated
                .and_then(|t| t.container_id.clone())
                .or_else(|| status.container_id.clone()),
        }
    }
}

impl Classifier {
    fn new(query: WatchQuery) -> Self {
        Self {
            query,
            known: HashMap::new(),
            relisted: None,
            terminations: HashMap::new(),
        }
    }

    fn handle(&mut self, event: watcher::Event<Pod>) -> Vec<Notification> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(pod_key(&pod));
                }
                self.applied(&pod)
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(pod) => self.applied(&pod),
            watcher::Event::Delete(pod) => {
                self.forget(&pod_key(&pod));
                classify_deleted(&pod, &self.query)
            }
        }
    }

    fn applied(&mut self, pod: &Pod) -> Vec<Notification> {
        if !self.query.matches_pod(&pod.name_any()) {
            return Vec::new();
        }

        let containers = spec_containers(pod, &self.query);
        self.known.insert(pod_key(pod), containers);

        let mut notifications = Vec::new();
        for (target, status) in matching_statuses(pod, &self.query) {
            match container_phase(status) {
                ContainerPhase::Running => {
                    self.terminations.remove(&target.identity());
                    notifications.push(Notification::Added(target));
                }
                ContainerPhase::Terminated => {
                    let termination = Termination::of(status);
                    let id = target.identity();
                    if self.terminations.get(&id) != Some(&termination) {
                        self.terminations.insert(id, termination);
                        notifications.push(Notification::Terminated(target));
                    }
                }
                ContainerPhase::Waiting => {}
            }
        }
        notifications
    }

    fn forget(&mut self, key: &PodKey) -> Option<Vec<PodContainer>> {
        self.terminations.retain(|id, _| id.namespace != key.0 || id.pod != key.1);
        self.known.remove(key)
    }

    fn finish_relist(&mut self) -> Vec<Notification> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };

        let stale: Vec<PodKey> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();

        let mut notifications = Vec::new();
        for key in stale {
            if let Some(containers) = self.forget(&key) {
                tracing::debug!(
                    namespace = %key.0,
                    pod = %key.1,
                    "pod disappeared during watch reconnect"
                );
                notifications.extend(containers.into_iter().map(Notification::Removed));
            }
        }
        notifications
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    (pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Init and regular container statuses that pass the container filter
fn matching_statuses<'a>(
    pod: &'a Pod,
    query: &WatchQuery,
) -> Vec<(PodContainer, &'a ContainerStatus)> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let Some(status) = &pod.status else {
        return Vec::new();
    };

    let init = status.init_container_statuses.iter().flatten();
    let regular = status.container_statuses.iter().flatten();

    init.chain(regular)
        .filter(|cs| query.matches_container(&cs.name))
        .map(|cs| (PodContainer::new(&namespace, &name, &cs.name), cs))
        .collect()
}

/// Every matching container of a deleted pod
pub(crate) fn classify_deleted(pod: &Pod, query: &WatchQuery) -> Vec<Notification> {
    if !query.matches_pod(&pod.name_any()) {
        return Vec::new();
    }

    spec_containers(pod, query)
        .into_iter()
        .map(Notification::Removed)
        .collect()
}

/// Containers declared in the pod spec that pass the container filter
fn spec_containers(pod: &Pod, query: &WatchQuery) -> Vec<PodContainer> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let Some(spec) = &pod.spec else {
        return Vec::new();
    };

    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .filter(|c| query.matches_container(&c.name))
        .map(|c| PodContainer::new(&namespace, &name, &c.name))
        .collect()
}

enum ContainerPhase {
    Running,
    Terminated,
    Waiting,
}

fn container_phase(status: &ContainerStatus) -> ContainerPhase {
    let state = status.state.as_ref();

    if state.is_some_and(|s| s.running.is_some()) {
        return ContainerPhase::Running;
    }
    if state.is_some_and(|s| s.terminated.is_some()) {
        return ContainerPhase::Terminated;
    }

    // Crash loop back-off: waiting, but the previous instance left output behind
    let crashed_before = status
        .last_state
        .as_ref()
        .is_some_and(|s| s.terminated.is_some());
    if crashed_before {
        ContainerPhase::Terminated
    } else {
        ContainerPhase::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(pods: &str) -> WatchQuery {
        WatchQuery::new(Regex::new(pods).unwrap())
    }

    fn pod(name: &str, statuses: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": "default" },
            "spec": {
                "initContainers": [{ "name": "init" }],
                "containers": [{ "name": "app" }, { "name": "sidecar" }]
            },
            "status": { "containerStatuses": statuses }
        }))
        .unwrap()
    }

    fn running(name: &str) -> serde_json::Value {
        json!({
            "name": name, "ready": true, "restartCount": 0, "image": "i", "imageID": "",
            "state": { "running": { "startedAt": "2024-01-15T10:30:00Z" } }
        })
    }

    fn terminated(name: &str) -> serde_json::Value {
        json!({
            "name": name, "ready": false, "restartCount": 0, "image": "i", "imageID": "",
            "state": { "terminated": { "exitCode": 1 } }
        })
    }

    fn crash_looping(name: &str) -> serde_json::Value {
        json!({
            "name": name, "ready": false, "restartCount": 3, "image": "i", "imageID": "",
            "state": { "waiting": { "reason": "CrashLoopBackOff" } },
            "lastState": { "terminated": { "exitCode": 2 } }
        })
    }

    fn creating(name: &str) -> serde_json::Value {
        json!({
            "name": name, "ready": false, "restartCount": 0, "image": "i", "imageID": "",
            "state": { "waiting": { "reason": "ContainerCreating" } }
        })
    }

    /// Classification of a single update seen by a fresh watcher
    fn classify_applied(pod: &Pod, query: &WatchQuery) -> Vec<Notification> {
        Classifier::new(query.clone()).handle(watcher::Event::Apply(pod.clone()))
    }

    fn target(pod: &str, container: &str) -> PodContainer {
        PodContainer::new("default", pod, container)
    }

    #[test]
    fn test_running_containers_are_added() {
        let pod = pod("web-1", json!([running("app"), running("sidecar")]));
        let notifications = classify_applied(&pod, &query("web"));

        assert_eq!(
            notifications,
            vec![
                Notification::Added(target("web-1", "app")),
                Notification::Added(target("web-1", "sidecar")),
            ]
        );
    }

    #[test]
    fn test_terminated_and_crash_looping_are_terminated() {
        let pod = pod(
            "web-1",
            json!([terminated("app"), crash_looping("sidecar")]),
        );
        let notifications = classify_applied(&pod, &query("web"));

        assert_eq!(
            notifications,
            vec![
                Notification::Terminated(target("web-1", "app")),
                Notification::Terminated(target("web-1", "sidecar")),
            ]
        );
    }

    #[test]
    fn test_waiting_container_emits_nothing() {
        let pod = pod("web-1", json!([creating("app")]));
        assert!(classify_applied(&pod, &query("web")).is_empty());
    }

    #[test]
    fn test_filters_apply_before_emission() {
        let db = pod("db-0", json!([running("app")]));
        assert!(classify_applied(&db, &query("^web")).is_empty());
        assert!(classify_deleted(&db, &query("^web")).is_empty());

        let web = pod("web-1", json!([running("app"), running("sidecar")]));
        let only_app = query("web").with_containers(Regex::new("^app$").unwrap());
        assert_eq!(
            classify_applied(&web, &only_app),
            vec![Notification::Added(target("web-1", "app"))]
        );
    }

    #[test]
    fn test_deleted_pod_removes_spec_containers() {
        let pod = pod("web-1", json!([running("app")]));
        let notifications = classify_deleted(&pod, &query("web"));

        assert_eq!(
            notifications,
            vec![
                Notification::Removed(target("web-1", "init")),
                Notification::Removed(target("web-1", "app")),
                Notification::Removed(target("web-1", "sidecar")),
            ]
        );
    }

    #[test]
    fn test_relist_reports_pods_deleted_while_disconnected() {
        let mut classifier = Classifier::new(
            query("web").with_containers(Regex::new("^app$").unwrap()),
        );

        classifier.handle(watcher::Event::Apply(pod("web-1", json!([running("app")]))));
        classifier.handle(watcher::Event::Apply(pod("web-2", json!([running("app")]))));

        // Reconnect: only web-2 is still there
        assert!(classifier.handle(watcher::Event::Init).is_empty());
        let replayed =
            classifier.handle(watcher::Event::InitApply(pod("web-2", json!([running("app")]))));
        assert_eq!(replayed, vec![Notification::Added(target("web-2", "app"))]);

        let removed = classifier.handle(watcher::Event::InitDone);
        assert_eq!(removed, vec![Notification::Removed(target("web-1", "app"))]);

        // Nothing stale is left to report
        assert!(classifier.handle(watcher::Event::Init).is_empty());
        classifier.handle(watcher::Event::InitApply(pod("web-2", json!([running("app")]))));
        assert!(classifier.handle(watcher::Event::InitDone).is_empty());
    }

    fn with_init(statuses: serde_json::Value, init: serde_json::Value) -> Pod {
        let mut pod = pod("web-1", statuses);
        if let Some(status) = pod.status.as_mut() {
            status.init_container_statuses = serde_json::from_value(init).unwrap();
        }
        pod
    }

    #[test]
    fn test_terminated_container_reported_once() {
        let mut classifier = Classifier::new(query("web"));
        let pod = with_init(json!([running("app")]), json!([terminated("init")]));

        let first = classifier.handle(watcher::Event::Apply(pod.clone()));
        assert_eq!(
            first,
            vec![
                Notification::Terminated(target("web-1", "init")),
                Notification::Added(target("web-1", "app")),
            ]
        );

        // Same statuses again, e.g. after a readiness change
        let second = classifier.handle(watcher::Event::Apply(pod));
        assert_eq!(second, vec![Notification::Added(target("web-1", "app"))]);
    }

    #[test]
    fn test_new_crash_is_reported_again() {
        let mut classifier = Classifier::new(query("web"));
        let crashed = |restarts: i32| {
            let mut status = crash_looping("app");
            status["restartCount"] = json!(restarts);
            pod("web-1", json!([status]))
        };

        let terminated_app = vec![Notification::Terminated(target("web-1", "app"))];
        assert_eq!(classifier.handle(watcher::Event::Apply(crashed(3))), terminated_app);
        assert!(classifier.handle(watcher::Event::Apply(crashed(3))).is_empty());
        assert_eq!(classifier.handle(watcher::Event::Apply(crashed(4))), terminated_app);
    }

    #[test]
    fn test_recreated_pod_reports_termination_again() {
        let mut classifier = Classifier::new(query("web"));
        let pod = pod("web-1", json!([terminated("app")]));
        let terminated_app = vec![Notification::Terminated(target("web-1", "app"))];

        assert_eq!(classifier.handle(watcher::Event::Apply(pod.clone())), terminated_app);
        classifier.handle(watcher::Event::Delete(pod.clone()));
        assert_eq!(classifier.handle(watcher::Event::Apply(pod)), terminated_app);
    }

    #[test]
    fn test_delete_forgets_pod() {
        let mut classifier = Classifier::new(query("web"));
        classifier.handle(watcher::Event::Apply(pod("web-1", json!([running("app")]))));
        classifier.handle(watcher::Event::Delete(pod("web-1", json!([]))));

        classifier.handle(watcher::Event::Init);
        assert!(classifier.handle(watcher::Event::InitDone).is_empty());
    }

    #[tokio::test]
    async fn test_senders_route_by_kind() {
        let (senders, mut streams) = WatchStreams::channel(4);

        assert!(senders.send(Notification::Added(target("a", "app"))).await);
        assert!(senders.send(Notification::Terminated(target("b", "app"))).await);
        assert!(senders.send(Notification::Removed(target("c", "app"))).await);

        assert_eq!(streams.added.recv().await.unwrap().pod_name, "a");
        assert_eq!(streams.terminated.recv().await.unwrap().pod_name, "b");
        assert_eq!(streams.removed.recv().await.unwrap().pod_name, "c");

        drop(streams);
        assert!(!senders.send(Notification::Added(target("d", "app"))).await);
    }
}
