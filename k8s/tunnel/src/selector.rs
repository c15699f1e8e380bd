use crate::{
    cluster::{ClusterApi, ListQuery},
    error::{
        ContainerNotFoundSnafu, InvalidPortSnafu, ListTimeoutSnafu, NoRunningPodForLabelSnafu,
        NoRunningPodSnafu, PortNotFoundSnafu, Result,
    },
    pod_is_running,
    vx::Pod,
    Target, TargetSelector, TunnelTarget,
};
use kube::ResourceExt;
use snafu::OptionExt;
use std::time::Duration;

/// Timeout of the pod list queries, sent to the api-server and enforced locally.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the sidecar proxy container.
pub const PROXY_CONTAINER_NAME: &str = "web-proxy";
/// Name of the admin port of the sidecar proxy container.
pub const PROXY_ADMIN_PORT_NAME: &str = "admin-http";

/// Selects a pod out of a candidate set, in the order given.
pub trait PodSelection {
    /// Returns the selected pod, if any.
    fn select<'a>(&self, pods: &'a [Pod]) -> Option<&'a Pod>;
}

/// Selects the first running pod whose name starts with the prefix.
/// This is not load balanced: the same pod is picked for as long as it's listed first.
pub struct RunningByPrefix<'a>(pub &'a str);
impl PodSelection for RunningByPrefix<'_> {
    fn select<'a>(&self, pods: &'a [Pod]) -> Option<&'a Pod> {
        pods.iter()
            .filter(|pod| pod_is_running(pod))
            .find(|pod| pod.name_any().starts_with(self.0))
    }
}

/// Selects the first running pod, the candidates having been listed by label already.
pub struct RunningByLabel;
impl PodSelection for RunningByLabel {
    fn select<'a>(&self, pods: &'a [Pod]) -> Option<&'a Pod> {
        pods.iter().find(|pod| pod_is_running(pod))
    }
}

/// List the pods of the namespace, bounding the query on both the server and the client side.
async fn list_pods(
    cluster: &dyn ClusterApi,
    namespace: &str,
    query: ListQuery,
) -> Result<Vec<Pod>> {
    let timeout = query.timeout;
    match tokio::time::timeout(timeout, cluster.list_pods(namespace, &query)).await {
        Ok(result) => result,
        Err(_) => ListTimeoutSnafu { namespace, timeout }.fail(),
    }
}

/// Returns the name of the first running pod in the namespace whose name starts with
/// `name_prefix`, in the order listed by the api-server.
/// Failing to list the pods and finding no such pod are reported as distinct errors.
pub async fn select_running_pod(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name_prefix: &str,
    timeout: Duration,
) -> Result<String> {
    let pods = list_pods(cluster, namespace, ListQuery::new(timeout)).await?;
    let pod = RunningByPrefix(name_prefix)
        .select(&pods)
        .context(NoRunningPodSnafu {
            namespace,
            prefix: name_prefix,
        })?;

    let pod_name = pod.name_any();
    tracing::debug!(namespace, name_prefix, pod_name, "Selected running pod");
    Ok(pod_name)
}

/// Returns the sidecar proxy container name and its admin port.
/// The pod is expected to be running.
pub fn select_proxy_admin_target(pod: &Pod) -> Result<(String, u16)> {
    select_admin_target(pod, PROXY_CONTAINER_NAME, PROXY_ADMIN_PORT_NAME)
}

/// Returns the named container and the number of its named port.
/// The pod is expected to be running.
pub fn select_admin_target(pod: &Pod, container: &str, port: &str) -> Result<(String, u16)> {
    let pod_name = pod.name_any();
    let found = pod
        .spec
        .iter()
        .flat_map(|spec| &spec.containers)
        .find(|c| c.name == container)
        .context(ContainerNotFoundSnafu {
            pod: &pod_name,
            container,
        })?;

    let container_port = found
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref() == Some(port))
        .context(PortNotFoundSnafu {
            pod: &pod_name,
            container,
            port,
        })?
        .container_port;

    let number = u16::try_from(container_port)
        .ok()
        .filter(|number| *number != 0)
        .context(InvalidPortSnafu {
            port: i64::from(container_port),
        })?;
    Ok((found.name.clone(), number))
}

/// Finds a `TunnelTarget`, which is essentially a pod name and port.
#[derive(Clone)]
pub struct TargetFinder<'a> {
    cluster: &'a dyn ClusterApi,
    timeout: Duration,
}
impl<'a> TargetFinder<'a> {
    /// Returns a new `Self` listing pods with the `DEFAULT_LIST_TIMEOUT`.
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self {
            cluster,
            timeout: DEFAULT_LIST_TIMEOUT,
        }
    }
    /// Modify and return `Self` with the given list timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finds the name and port of the target pod specified by the selector.
    /// # Arguments
    /// * `target` - the target to be found
    pub async fn find(&self, target: &Target) -> Result<TunnelTarget> {
        let namespace = target.namespace();

        match target.selector() {
            TargetSelector::PodName(name) => {
                let pod = self.cluster.get_pod(&namespace, name).await?;
                target.find(&pod)
            }
            TargetSelector::NamePrefix(prefix) => {
                let pods = list_pods(self.cluster, &namespace, ListQuery::new(self.timeout)).await?;
                let pod = RunningByPrefix(prefix)
                    .select(&pods)
                    .context(NoRunningPodSnafu {
                        namespace: &namespace,
                        prefix,
                    })?;
                target.find(pod)
            }
            TargetSelector::PodLabel(selector) => {
                let query = ListQuery::new(self.timeout).with_labels(selector);
                let pods = list_pods(self.cluster, &namespace, query).await?;
                let pod = RunningByLabel
                    .select(&pods)
                    .context(NoRunningPodForLabelSnafu {
                        namespace: &namespace,
                        selector,
                    })?;
                target.find(pod)
            }
        }
    }
}
