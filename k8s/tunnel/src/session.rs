use crate::{
    allocator::allocate_ephemeral_port,
    cluster::{ClusterApi, UpgradeRequest},
    error::{
        AlreadyStartedSnafu, BindSnafu, NotReadySnafu, PodNotRunningSnafu, ReadyTimeoutSnafu,
        Result,
    },
    forwarder::Forwarder,
    pod_is_running,
    selector::{select_proxy_admin_target, select_running_pod, TargetFinder, DEFAULT_LIST_TIMEOUT},
    vx::Pod,
    Target, TunnelTarget,
};
use kube::ResourceExt;
use snafu::{ensure, ResultExt};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;

/// Readiness of a `TunnelSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not yet upgraded and bound.
    Pending,
    /// The upgrade completed and the local listener is bound.
    Ready,
    /// The session terminated without ever becoming ready.
    Aborted,
}

/// A port-forward tunnel into a pod.
/// The session is run once, on its own task, and discarded once stopped.
/// # Example
/// ```ignore
/// let session = Arc::new(TunnelSession::new(cluster, target, 0, false)?);
///
/// let handle = session.spawn();
/// session.wait_until_ready().await?;
/// let uri = session.local_url("/ready");
///
/// session.stop();
/// handle.await??;
/// ```
pub struct TunnelSession {
    cluster: Arc<dyn ClusterApi>,
    request: UpgradeRequest,
    local_port: u16,
    ready: watch::Sender<Readiness>,
    stop: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("request", &self.request)
            .field("local_port", &self.local_port)
            .field("emit_logs", &self.request.emit_logs)
            .field("ready", &*self.ready.borrow())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl TunnelSession {
    /// Return a new `Self`, no connection is made until it's run.
    /// # Arguments
    /// * `cluster` - the cluster the pod runs in
    /// * `target` - the pod container port we'll forward to
    /// * `local_port` - the local port to listen on, if 0 an ephemeral port is allocated
    /// * `emit_logs` - whether the forwarder logs its activity
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        target: TunnelTarget,
        local_port: u16,
        emit_logs: bool,
    ) -> Result<Self> {
        let uri = target.portforward_uri()?;
        let local_port = match local_port {
            0 => allocate_ephemeral_port()?,
            port => port,
        };

        Ok(Self {
            cluster,
            request: UpgradeRequest {
                method: hyper::Method::POST,
                uri,
                target,
                emit_logs,
            },
            local_port,
            ready: watch::channel(Readiness::Pending).0,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Return a new `Self` forwarding to the first running pod whose name starts with
    /// `name_prefix`, typically the name of the deployment which owns it.
    /// Note that the tunnel lives until stopped, care should be taken to stop it when used from
    /// long lived processes.
    pub async fn for_workload(
        cluster: Arc<dyn ClusterApi>,
        namespace: &str,
        name_prefix: &str,
        local_port: u16,
        remote_port: u16,
        emit_logs: bool,
    ) -> Result<Self> {
        let pod_name =
            select_running_pod(cluster.as_ref(), namespace, name_prefix, DEFAULT_LIST_TIMEOUT)
                .await?;
        let target = TunnelTarget::new(namespace, pod_name, remote_port.into())?;
        Self::new(cluster, target, local_port, emit_logs)
    }

    /// Return a new `Self` forwarding an ephemeral local port to the admin port of the pod's
    /// sidecar proxy.
    pub fn for_proxy_admin(
        cluster: Arc<dyn ClusterApi>,
        pod: &Pod,
        emit_logs: bool,
    ) -> Result<Self> {
        ensure!(
            pod_is_running(pod),
            PodNotRunningSnafu {
                pod: pod.name_any()
            }
        );
        let (_container, port) = select_proxy_admin_target(pod)?;
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let target = TunnelTarget::new(namespace, pod.name_any(), port.into())?;
        Self::new(cluster, target, 0, emit_logs)
    }

    /// Return a new `Self` forwarding to the given `Target`.
    pub async fn for_target(
        cluster: Arc<dyn ClusterApi>,
        target: &Target,
        local_port: u16,
        emit_logs: bool,
    ) -> Result<Self> {
        let target = TargetFinder::new(cluster.as_ref()).find(target).await?;
        Self::new(cluster, target, local_port, emit_logs)
    }

    /// Runs the tunnel until it's stopped, the remote closes the connection or a fatal error
    /// occurs. A session may only be run once.
    pub async fn run(&self) -> Result<()> {
        ensure!(
            !self.started.swap(true, Ordering::SeqCst),
            AlreadyStartedSnafu {
                pod: self.pod_name()
            }
        );

        let result = self.forward().await;
        self.ready.send_if_modified(|ready| match ready {
            Readiness::Pending => {
                *ready = Readiness::Aborted;
                true
            }
            _ => false,
        });
        result
    }

    async fn forward(&self) -> Result<()> {
        let connection = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(()),
            connection = self.cluster.upgrade(&self.request) => connection?,
        };

        let port = self.local_port;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await.context(BindSnafu { port })?;
        tracing::trace!(port, uri = %self.request.uri, "Bound to local port");

        self.ready.send_replace(Readiness::Ready);

        let forwarder = Forwarder {
            listener,
            connection,
            pod_name: self.pod_name().to_string(),
            local_port: port,
            pod_port: self.remote_port(),
            emit_logs: self.request.emit_logs,
        };
        forwarder.run(self.stop.clone()).await
    }

    /// Runs the tunnel on a new task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    /// Waits until the tunnel is ready: the connection is upgraded and the local port is bound.
    /// The local port must not be used before this returns.
    /// Fails if the session terminated without becoming ready.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let readiness = match ready.wait_for(|ready| *ready != Readiness::Pending).await {
            Ok(readiness) => *readiness,
            Err(_) => Readiness::Aborted,
        };
        match readiness {
            Readiness::Ready => Ok(()),
            _ => NotReadySnafu {
                pod: self.pod_name(),
            }
            .fail(),
        }
    }

    /// Same as `Self::wait_until_ready` but waits at most for the given timeout.
    pub async fn wait_until_ready_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait_until_ready()).await {
            Ok(result) => result,
            Err(_) => ReadyTimeoutSnafu {
                pod: self.pod_name(),
                timeout,
            }
            .fail(),
        }
    }

    /// Requests the tunnel to stop, without waiting for it.
    /// Stopping more than once has no further effect.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::trace!(pod = self.pod_name(), local_port = self.local_port, "Stopping tunnel");
        }
        self.stop.cancel();
    }

    /// Returns the url for the given path through the tunnel.
    pub fn local_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.local_port)
    }

    /// The current readiness.
    pub fn readiness(&self) -> Readiness {
        *self.ready.borrow()
    }

    /// Whether the tunnel is ready to be used.
    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// The local port connections are accepted on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The container port connections are forwarded to.
    pub fn remote_port(&self) -> u16 {
        self.request.target.container_port
    }

    /// The `portforward` subresource uri of the pod.
    pub fn request_uri(&self) -> &hyper::Uri {
        &self.request.uri
    }

    /// The pod endpoint connections are forwarded to.
    pub fn target(&self) -> &TunnelTarget {
        &self.request.target
    }

    fn pod_name(&self) -> &str {
        &self.request.target.pod_name
    }
}
