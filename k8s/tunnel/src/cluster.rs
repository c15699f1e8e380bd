use crate::{
    error::{
        ConnectionLostSnafu, Error, GetPodSnafu, InvalidUriSnafu, KubeClientSnafu, ListPodsSnafu,
        ListRequestSnafu, PodNotFoundSnafu, Result, StreamUnavailableSnafu, UpgradeSnafu,
    },
    pod_is_running,
    vx::Pod,
    TunnelTarget,
};
use kube::{
    api::{Api, ListParams, Portforwarder},
    core::ObjectList,
    Client, Resource,
};
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// How often an upgraded connection checks whether its pod is still running.
const POD_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// A bidirectional byte stream to a pod's container port.
pub trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardIo for T {}

/// A logical stream multiplexed over an upgraded connection.
pub type RemoteStream = Box<dyn ForwardIo>;

/// Parameters of a pod list query.
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// Only list pods matching this label selector, if Some.
    pub label_selector: Option<String>,
    /// Server-side timeout of the query.
    pub timeout: Duration,
}
impl ListQuery {
    /// A query for all pods, bounded by the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            label_selector: None,
            timeout,
        }
    }
    /// Restrict the query to the given label selector.
    pub fn with_labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

/// The request used to upgrade a connection to the port-forward subresource of a pod.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Method of the upgrade request.
    pub method: hyper::Method,
    /// The `pods/portforward` subresource uri.
    pub uri: hyper::Uri,
    /// The pod endpoint being forwarded to.
    pub target: TunnelTarget,
    /// Whether the connection may log its activity.
    pub emit_logs: bool,
}

/// The cluster capabilities needed to find pods and forward to them.
/// The implementation is shared read-only between any number of sessions.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// List the pods of the namespace, in the order returned by the api-server.
    async fn list_pods(&self, namespace: &str, query: &ListQuery) -> Result<Vec<Pod>>;
    /// Get the pod with the given name.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    /// Upgrade a connection to the pod's port-forward subresource.
    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Arc<dyn PortForwardConnection>>;
}

/// An upgraded, stream multiplexing connection to a pod.
#[async_trait::async_trait]
pub trait PortForwardConnection: Send + Sync {
    /// Open a new logical stream to the forwarded container port.
    /// A fatal error (see `Error::is_fatal`) means no further streams can be opened.
    async fn open_stream(&self) -> Result<RemoteStream>;
    /// Completes when the remote side goes away.
    /// Ok if it was closed cleanly, otherwise the reason the connection was lost.
    async fn closed(&self) -> Result<()>;
}

/// `ClusterApi` backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Returns a new `KubeCluster` using the provided `kube::Client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
    /// Tries to return a `KubeCluster` with a default `kube::Client`.
    pub async fn try_default() -> Result<Self> {
        Ok(Self {
            client: Client::try_default().await.context(KubeClientSnafu)?,
        })
    }
    /// Returns a `KubeCluster` using the given kubeconfig file, or the default one.
    pub async fn from_kubeconfig(kube_config_path: Option<PathBuf>) -> Result<Self> {
        let config = crate::config::config_from_kubeconfig(kube_config_path).await?;
        Ok(Self {
            client: Client::try_from(config).context(KubeClientSnafu)?,
        })
    }
    fn pod_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
    fn list_params(query: &ListQuery) -> ListParams {
        match &query.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }
    /// The pod list request, carrying the query timeout as the server-side `timeoutSeconds`.
    fn list_request(namespace: &str, query: &ListQuery) -> Result<hyper::Request<Vec<u8>>> {
        let url_path = Pod::url_path(&(), Some(namespace));
        let mut request = kube::core::Request::new(url_path)
            .list(&Self::list_params(query))
            .context(ListRequestSnafu { namespace })?;

        let timeout = query.timeout.as_secs().max(1);
        let mut uri = request.uri().to_string();
        if !uri.ends_with('?') {
            uri.push('&');
        }
        uri.push_str(&format!("timeoutSeconds={timeout}"));
        *request.uri_mut() = hyper::Uri::try_from(uri.as_str()).context(InvalidUriSnafu { uri })?;
        Ok(request)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespace: &str, query: &ListQuery) -> Result<Vec<Pod>> {
        let request = Self::list_request(namespace, query)?;
        let pods = self
            .client
            .request::<ObjectList<Pod>>(request)
            .await
            .context(ListPodsSnafu { namespace })?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        match self.pod_api(namespace).get(name).await {
            Ok(pod) => Ok(pod),
            Err(kube::Error::Api(response)) if response.code == 404 => PodNotFoundSnafu {
                namespace,
                pod: name,
            }
            .fail(),
            Err(source) => Err(source).context(GetPodSnafu {
                namespace,
                pod: name,
            }),
        }
    }

    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Arc<dyn PortForwardConnection>> {
        let target = &request.target;
        if request.emit_logs {
            tracing::debug!(uri = %request.uri, method = %request.method, "Upgrading connection");
        }

        let pod_api = self.pod_api(&target.namespace);
        let forwarder = pod_api
            .portforward(&target.pod_name, &[target.container_port])
            .await
            .context(UpgradeSnafu {
                pod: &target.pod_name,
            })?;

        Ok(Arc::new(KubePortForward {
            cluster: self.clone(),
            pod_api,
            target: target.clone(),
            emit_logs: request.emit_logs,
            primed: Mutex::new(Some(forwarder)),
        }))
    }
}

/// Port-forwarding over the kube-api websocket portforward protocol.
/// Each `Portforwarder` carries a single stream per port, so the forwarder created by the upgrade
/// serves the first stream and a new one is upgraded for each stream after that.
/// As there is no single long lived connection, the pod itself is polled to notice it going away.
struct KubePortForward {
    cluster: KubeCluster,
    pod_api: Api<Pod>,
    target: TunnelTarget,
    emit_logs: bool,
    primed: Mutex<Option<Portforwarder>>,
}

#[async_trait::async_trait]
impl PortForwardConnection for KubePortForward {
    async fn open_stream(&self) -> Result<RemoteStream> {
        let pod_name = &self.target.pod_name;
        let port = self.target.container_port;

        let primed = self.primed.lock().take();
        let mut forwarder = match primed {
            Some(forwarder) => forwarder,
            None => self
                .pod_api
                .portforward(pod_name, &[port])
                .await
                .context(ConnectionLostSnafu { pod: pod_name })?,
        };

        let stream = forwarder
            .take_stream(port)
            .context(StreamUnavailableSnafu {
                pod: pod_name,
                port,
            })?;

        // the forwarder completes once its stream has been closed
        let pod_name = pod_name.clone();
        let emit_logs = self.emit_logs;
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                if emit_logs {
                    tracing::trace!(pod_name, ?error, "forwarder error");
                }
            }
        });

        Ok(Box::new(stream))
    }

    async fn closed(&self) -> Result<()> {
        pod_gone(&self.cluster, &self.target, POD_CHECK_PERIOD).await
    }
}

/// Completes once the target pod no longer exists or is no longer running, checking every
/// `period`. Failing to get the pod is retried on the next check.
pub(crate) async fn pod_gone(
    cluster: &dyn ClusterApi,
    target: &TunnelTarget,
    period: Duration,
) -> Result<()> {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match cluster.get_pod(&target.namespace, &target.pod_name).await {
            Ok(pod) if pod_is_running(&pod) => {}
            Ok(_) | Err(Error::PodNotFound { .. }) => return Ok(()),
            Err(_) => {}
        }
    }
}
