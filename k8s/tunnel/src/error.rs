use snafu::Snafu;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors generated while selecting, building or running a tunnel.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    /// No running pod in the namespace matches the requested name prefix.
    #[snafu(display("No running pods found for '{}' in namespace '{}'", prefix, namespace))]
    NoRunningPod { namespace: String, prefix: String },
    /// No running pod in the namespace matches the label selector.
    #[snafu(display(
        "No running pods found for selector '{}' in namespace '{}'",
        selector,
        namespace
    ))]
    NoRunningPodForLabel { namespace: String, selector: String },
    /// The named pod does not exist.
    #[snafu(display("Pod '{}' not found in namespace '{}'", pod, namespace))]
    PodNotFound { namespace: String, pod: String },
    /// The pod exists but is not in the `Running` phase.
    #[snafu(display("Pod not running: {}", pod))]
    PodNotRunning { pod: String },
    /// The pod does not declare the requested container.
    #[snafu(display("No {} container found for pod {}", container, pod))]
    ContainerNotFound { pod: String, container: String },
    /// The container (or pod) does not declare the requested port name.
    #[snafu(display("No {} port found for container {}/{}", port, pod, container))]
    PortNotFound {
        pod: String,
        container: String,
        port: String,
    },
    /// The port number cannot address a container port.
    #[snafu(display("Port {} is not a valid container port", port))]
    InvalidPort { port: i64 },
    #[snafu(display("Failed to list pods in namespace '{}': {}", namespace, source))]
    ListPods {
        namespace: String,
        source: kube::Error,
    },
    #[snafu(display("Failed to build the pod list request for '{}': {}", namespace, source))]
    ListRequest {
        namespace: String,
        source: kube::core::request::Error,
    },
    #[snafu(display("Timed out listing pods in namespace '{}' after {:?}", namespace, timeout))]
    ListTimeout {
        namespace: String,
        timeout: std::time::Duration,
    },
    #[snafu(display("Failed to get pod '{}/{}': {}", namespace, pod, source))]
    GetPod {
        namespace: String,
        pod: String,
        source: kube::Error,
    },
    #[snafu(display("Invalid uri '{}': {}", uri, source))]
    InvalidUri {
        uri: String,
        source: hyper::http::uri::InvalidUri,
    },
    /// The api-server refused or failed the connection upgrade.
    #[snafu(display("Failed to upgrade connection to pod '{}': {}", pod, source))]
    Upgrade { pod: String, source: kube::Error },
    #[snafu(display("Failed to allocate an ephemeral port: {}", source))]
    Allocation { source: std::io::Error },
    #[snafu(display("Invalid listen address: {}", address))]
    InvalidListenAddress { address: String },
    #[snafu(display("Failed to bind local port {}: {}", port, source))]
    Bind { port: u16, source: std::io::Error },
    /// The upgraded connection was lost, no further streams can be opened.
    #[snafu(display("Lost connection to pod '{}': {}", pod, source))]
    ConnectionLost { pod: String, source: kube::Error },
    /// The remote side closed the upgraded connection.
    #[snafu(display("Connection to pod '{}' closed by the remote", pod))]
    RemoteClosed { pod: String },
    /// A logical stream could not be taken from the upgraded connection.
    #[snafu(display("Port {} not found in forwarder for pod '{}'", port, pod))]
    StreamUnavailable { pod: String, port: u16 },
    #[snafu(display("Failed to accept local connection: {}", source))]
    Accept { source: std::io::Error },
    #[snafu(display("Kubeconfig file not found in default location"))]
    KubeconfigNotFound {},
    #[snafu(display("Failed to read kubeconfig: {}", source))]
    Kubeconfig {
        source: kube::config::KubeconfigError,
    },
    #[snafu(display("Failed to create kube client: {}", source))]
    KubeClient { source: kube::Error },
    #[snafu(display("Environment variable '{}' not set: {}", name, source))]
    EnvVar {
        name: String,
        source: std::env::VarError,
    },
    /// `run` was called more than once on the same session.
    #[snafu(display("Tunnel to pod '{}' already started", pod))]
    AlreadyStarted { pod: String },
    /// The session terminated before the tunnel became ready.
    #[snafu(display("Tunnel to pod '{}' terminated before becoming ready", pod))]
    NotReady { pod: String },
    #[snafu(display("Tunnel to pod '{}' not ready after {:?}", pod, timeout))]
    ReadyTimeout {
        pod: String,
        timeout: std::time::Duration,
    },
}

/// Broad classification of an `Error`, for callers which only need to decide what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No matching pod, container or port.
    Selection,
    /// The api-server could not be reached, or refused the request.
    Transport,
    /// No ephemeral port could be reserved.
    Allocation,
    /// The tunnel failed after construction.
    RuntimeForwarding,
    /// Configuration could not be loaded.
    Config,
    /// The session was misused.
    Usage,
}

impl Error {
    /// Get the `ErrorKind` of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoRunningPod { .. }
            | Error::NoRunningPodForLabel { .. }
            | Error::PodNotFound { .. }
            | Error::PodNotRunning { .. }
            | Error::ContainerNotFound { .. }
            | Error::PortNotFound { .. }
            | Error::InvalidPort { .. } => ErrorKind::Selection,
            Error::ListPods { .. }
            | Error::ListRequest { .. }
            | Error::ListTimeout { .. }
            | Error::GetPod { .. }
            | Error::InvalidUri { .. }
            | Error::Upgrade { .. } => ErrorKind::Transport,
            Error::Allocation { .. } | Error::InvalidListenAddress { .. } => ErrorKind::Allocation,
            Error::Bind { .. }
            | Error::ConnectionLost { .. }
            | Error::RemoteClosed { .. }
            | Error::StreamUnavailable { .. }
            | Error::Accept { .. }
            | Error::ReadyTimeout { .. }
            | Error::NotReady { .. } => ErrorKind::RuntimeForwarding,
            Error::KubeconfigNotFound { .. }
            | Error::Kubeconfig { .. }
            | Error::KubeClient { .. }
            | Error::EnvVar { .. } => ErrorKind::Config,
            Error::AlreadyStarted { .. } => ErrorKind::Usage,
        }
    }
    /// Whether the error is the kind of "not found" failure reported by the selectors.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::Selection
    }
    /// Whether the error takes down the whole session rather than a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost { .. } | Error::RemoteClosed { .. } | Error::Accept { .. }
        )
    }
}
