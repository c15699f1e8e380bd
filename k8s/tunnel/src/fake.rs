//! In-memory `ClusterApi` used by the unit tests.
//! The forwarded streams are served by a minimal HTTP responder which records the request lines.

use crate::{
    cluster::{ClusterApi, ListQuery, PortForwardConnection, RemoteStream, UpgradeRequest},
    error::{Error, Result},
    vx::{Container, ContainerPort, Pod, PodSpec, PodStatus},
};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};

fn api_error(code: u16, message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "ServiceUnavailable".to_string(),
        code,
    })
}

/// A pod in the given phase, labelled `app=<name up to the first dash>`.
pub(crate) fn pod(name: &str, phase: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    let app = name.split('-').next().unwrap_or(name).to_string();
    pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), app)]));
    pod.spec = Some(PodSpec::default());
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
    pod
}

pub(crate) fn running_pod(name: &str) -> Pod {
    pod(name, "Running")
}

pub(crate) trait PodExt {
    /// Add a container declaring the given named ports.
    fn with_container(self, name: &str, ports: &[(&str, i32)]) -> Pod;
}
impl PodExt for Pod {
    fn with_container(mut self, name: &str, ports: &[(&str, i32)]) -> Pod {
        let container = Container {
            name: name.to_string(),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| ContainerPort {
                        name: Some(name.to_string()),
                        container_port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        self.spec.get_or_insert_with(Default::default).containers.push(container);
        self
    }
}

#[derive(Default)]
struct Recorded {
    list_timeouts: Vec<Duration>,
    list_selectors: Vec<Option<String>>,
    upgrades: Vec<UpgradeRequest>,
    connections: Vec<Arc<FakeConnection>>,
}

/// A cluster holding a fixed list of pods.
#[derive(Default)]
pub(crate) struct FakeCluster {
    pods: Vec<Pod>,
    fail_list: bool,
    hang_list: bool,
    fail_upgrade: bool,
    recorded: Mutex<Recorded>,
}

impl FakeCluster {
    pub(crate) fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods,
            ..Default::default()
        }
    }
    pub(crate) fn fail_list(mut self) -> Self {
        self.fail_list = true;
        self
    }
    pub(crate) fn hang_list(mut self) -> Self {
        self.hang_list = true;
        self
    }
    pub(crate) fn fail_upgrade(mut self) -> Self {
        self.fail_upgrade = true;
        self
    }
    pub(crate) fn list_timeouts(&self) -> Vec<Duration> {
        self.recorded.lock().list_timeouts.clone()
    }
    pub(crate) fn list_selectors(&self) -> Vec<Option<String>> {
        self.recorded.lock().list_selectors.clone()
    }
    pub(crate) fn upgrades(&self) -> Vec<UpgradeRequest> {
        self.recorded.lock().upgrades.clone()
    }
    /// The connection upgraded for the given pod, if any.
    pub(crate) fn connection(&self, pod: &str) -> Option<Arc<FakeConnection>> {
        let recorded = self.recorded.lock();
        recorded
            .connections
            .iter()
            .find(|c| c.request.target.pod_name == pod)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, namespace: &str, query: &ListQuery) -> Result<Vec<Pod>> {
        {
            let mut recorded = self.recorded.lock();
            recorded.list_timeouts.push(query.timeout);
            recorded.list_selectors.push(query.label_selector.clone());
        }
        if self.hang_list {
            futures::future::pending::<()>().await;
        }
        if self.fail_list {
            return Err(Error::ListPods {
                namespace: namespace.to_string(),
                source: api_error(503, "the server is currently unable to handle the request"),
            });
        }

        let labels = query
            .label_selector
            .as_ref()
            .and_then(|selector| selector.split_once('='));
        Ok(self
            .pods
            .iter()
            .filter(|pod| match labels {
                Some((key, value)) => pod.labels().get(key).map(String::as_str) == Some(value),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        match self.pods.iter().find(|pod| pod.name_any() == name) {
            Some(pod) => Ok(pod.clone()),
            None => Err(Error::PodNotFound {
                namespace: namespace.to_string(),
                pod: name.to_string(),
            }),
        }
    }

    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Arc<dyn PortForwardConnection>> {
        self.recorded.lock().upgrades.push(request.clone());
        if self.fail_upgrade {
            return Err(Error::Upgrade {
                pod: request.target.pod_name.clone(),
                source: api_error(403, "pods/portforward is forbidden"),
            });
        }
        let connection = Arc::new(FakeConnection::new(request.clone()));
        self.recorded.lock().connections.push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Open,
    Closed,
    Lost,
}

/// An upgraded connection whose streams answer every HTTP request with `200 ok`.
pub(crate) struct FakeConnection {
    request: UpgradeRequest,
    state: watch::Sender<ConnectionState>,
    fail_next_stream: AtomicBool,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeConnection {
    fn new(request: UpgradeRequest) -> Self {
        Self {
            request,
            state: watch::channel(ConnectionState::Open).0,
            fail_next_stream: AtomicBool::new(false),
            requests: Default::default(),
        }
    }
    /// The request lines received by the container port, in order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
    /// The remote side closes the connection cleanly.
    pub(crate) fn close(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
    /// The connection is lost.
    pub(crate) fn lose(&self) {
        self.state.send_replace(ConnectionState::Lost);
    }
    /// The next stream fails to open.
    pub(crate) fn fail_next_stream(&self) {
        self.fail_next_stream.store(true, Ordering::SeqCst);
    }
    fn lost(&self) -> Error {
        Error::ConnectionLost {
            pod: self.request.target.pod_name.clone(),
            source: api_error(500, "connection reset by peer"),
        }
    }
}

#[async_trait::async_trait]
impl PortForwardConnection for FakeConnection {
    async fn open_stream(&self) -> Result<RemoteStream> {
        if *self.state.borrow() != ConnectionState::Open {
            return Err(self.lost());
        }
        if self.fail_next_stream.swap(false, Ordering::SeqCst) {
            return Err(Error::StreamUnavailable {
                pod: self.request.target.pod_name.clone(),
                port: self.request.target.container_port,
            });
        }

        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let requests = self.requests.clone();
        tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(read) => received.extend_from_slice(&buf[.. read]),
                }
            }
            let text = String::from_utf8_lossy(&received);
            let line = text.lines().next().unwrap_or_default().to_string();
            requests.lock().push(line);

            let response = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
            let _ = remote.write_all(response.as_bytes()).await;
            let _ = remote.shutdown().await;
        });
        Ok(Box::new(local))
    }

    async fn closed(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let state = match state.wait_for(|s| *s != ConnectionState::Open).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Lost,
        };
        match state {
            ConnectionState::Closed => Ok(()),
            _ => Err(self.lost()),
        }
    }
}
