#![deny(missing_docs)]
//! This library provides port-forward tunnels into kubernetes pods.
//!
//! A running pod is selected, a connection to its `portforward` subresource is upgraded via the
//! kubernetes api-server and a local TCP listener bridges every accepted connection to a port of
//! the pod's containers.
//!
//! # Example
//! ```ignore
//! let cluster = Arc::new(kube_tunnel::KubeCluster::try_default().await?);
//! let session = kube_tunnel::TunnelSession::for_workload(cluster, "prod", "web", 0, 8080, true)
//!     .await?;
//! let session = Arc::new(session);
//!
//! let handle = session.spawn();
//! session.wait_until_ready().await?;
//! tracing::info!(url = session.local_url("/ready"), "tunnel ready");
//!
//! session.stop();
//! handle.await??;
//! ```

mod allocator;
mod cluster;
mod config;
mod error;
mod forwarder;
mod selector;
mod session;

#[cfg(test)]
mod fake;

pub use allocator::allocate_ephemeral_port;
pub use cluster::{
    ClusterApi, ForwardIo, KubeCluster, ListQuery, PortForwardConnection, RemoteStream,
    UpgradeRequest,
};
pub use config::config_from_kubeconfig;
pub use error::{Error, ErrorKind, Result};
pub use selector::{
    select_admin_target, select_proxy_admin_target, select_running_pod, PodSelection,
    RunningByLabel, RunningByPrefix, TargetFinder, DEFAULT_LIST_TIMEOUT, PROXY_ADMIN_PORT_NAME,
    PROXY_CONTAINER_NAME,
};
pub use session::{Readiness, TunnelSession};

/// The kubernetes api version used throughout the crate.
pub(crate) use k8s_openapi::api::core::v1 as vx;

use error::{InvalidPortSnafu, PodNotRunningSnafu, PortNotFoundSnafu};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use snafu::{ensure, OptionExt, ResultExt};
use vx::Pod;

/// Different types of target selectors.
#[derive(Clone, Debug)]
pub enum TargetSelector {
    /// By pod name.
    PodName(String),
    /// By pod name prefix, eg: the name of the deployment owning the pods.
    NamePrefix(String),
    /// By pod label selector.
    PodLabel(String),
}
impl TargetSelector {
    /// New `Self` from the given pod label key value.
    pub fn pod_label(key: &str, val: &str) -> Self {
        Self::PodLabel(format!("{key}={val}"))
    }
    /// New `Self` from the given deployment name.
    pub fn deployment(name: &str) -> Self {
        Self::NamePrefix(name.to_string())
    }
}

/// Identify a port explicitly by its number or by name.
#[derive(Clone, Debug)]
pub enum Port {
    /// Specified using a number.
    Number(i32),
    /// Specified using a name.
    Name(String),
}
impl From<i32> for Port {
    fn from(port: i32) -> Self {
        Self::Number(port)
    }
}
impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port.into())
    }
}
impl From<&str> for Port {
    fn from(port: &str) -> Self {
        Self::Name(port.to_string())
    }
}
impl From<IntOrString> for Port {
    fn from(port: IntOrString) -> Self {
        match port {
            IntOrString::Int(port) => Self::Number(port),
            IntOrString::String(port) => Self::Name(port),
        }
    }
}

/// A kubernetes target.
#[derive(Clone, Debug)]
pub struct Target {
    selector: TargetSelector,
    port: Port,
    namespace: NameSpace,
}

/// A kubernetes namespace.
/// If None, the default is "default".
#[derive(Clone, Debug)]
pub(crate) struct NameSpace(Option<String>);
impl NameSpace {
    /// Returns the configured namespace or the default.
    pub(crate) fn name_any(&self) -> String {
        let default = "default".to_string();
        self.0.clone().unwrap_or(default)
    }
}

impl Target {
    /// Returns a new `Self` from the given parameters.
    /// # Arguments
    /// * `selector` - target selector
    /// * `port` - target port
    /// * `namespace` - target namespace
    pub fn new<I: Into<Option<T>>, T: Into<String>, P: Into<Port>>(
        selector: TargetSelector,
        port: P,
        namespace: I,
    ) -> Self {
        Self {
            selector,
            port: port.into(),
            namespace: NameSpace(namespace.into().map(Into::into)),
        }
    }

    /// Modify and return `Self` from the given parameters.
    /// # Arguments
    /// * `selector` - target selector
    pub fn with_selector(mut self, selector: TargetSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Modify and return `Self` from the given parameters.
    /// # Arguments
    /// * `port` - target port
    pub fn with_port<P: Into<Port>>(mut self, port: P) -> Self {
        self.port = port.into();
        self
    }

    /// Modify and return `Self` from the given parameters.
    /// # Arguments
    /// * `namespace` - target namespace
    pub fn with_namespace<I: Into<Option<T>>, T: Into<String>>(mut self, namespace: I) -> Self {
        self.namespace = NameSpace(namespace.into().map(Into::into));
        self
    }

    /// Returns the selector of the target.
    pub fn selector(&self) -> &TargetSelector {
        &self.selector
    }

    /// Returns the namespace of the target, or the default namespace.
    pub fn namespace(&self) -> String {
        self.namespace.name_any()
    }

    /// Returns the `TunnelTarget` for the given running pod and `self.port`.
    /// A port name is resolved against the ports declared by the pod's containers.
    pub(crate) fn find(&self, pod: &Pod) -> Result<TunnelTarget> {
        ensure!(
            pod_is_running(pod),
            PodNotRunningSnafu {
                pod: pod.name_any()
            }
        );

        let port = match &self.port {
            Port::Number(port) => *port,
            Port::Name(name) => {
                let containers = pod.spec.iter().flat_map(|spec| &spec.containers);
                let mut ports = containers.filter_map(|c| c.ports.as_ref()).flatten();
                let port = ports.find(|p| p.name.as_ref() == Some(name));
                port.context(PortNotFoundSnafu {
                    pod: pod.name_any(),
                    container: "*",
                    port: name,
                })?
                .container_port
            }
        };

        TunnelTarget::new(self.namespace(), pod.name_any(), port)
    }
}

/// A single addressable endpoint inside the cluster: a container port of a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod, observed running when it was selected.
    pub pod_name: String,
    /// The container port to forward to.
    pub container_port: u16,
}
impl TunnelTarget {
    /// Returns a new `Self`, validating the container port is within `1..=65535`.
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_port: i32,
    ) -> Result<Self> {
        let port = u16::try_from(container_port)
            .ok()
            .filter(|port| *port != 0)
            .context(InvalidPortSnafu {
                port: i64::from(container_port),
            })?;
        Ok(Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_port: port,
        })
    }

    /// The `portforward` subresource uri of the pod.
    pub(crate) fn portforward_uri(&self) -> Result<hyper::Uri> {
        let namespace = &self.namespace;
        let name = &self.pod_name;
        let port = self.container_port;
        let uri = format!("/api/v1/namespaces/{namespace}/pods/{name}/portforward?ports={port}");
        hyper::Uri::try_from(uri.as_str()).context(error::InvalidUriSnafu { uri })
    }
}

/// Check whether the pod is in the `Running` phase.
pub(crate) fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}
