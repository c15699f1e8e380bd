use clap::Parser;
use std::{path::PathBuf, sync::Arc};

/// Forwards a local port to a port of the first running pod of a deployment.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Namespace of the deployment.
    #[clap(long, short, default_value = "default")]
    namespace: String,

    /// Name of the deployment, pods are selected by this name prefix.
    deployment: String,

    /// Port of the pod's container to forward to.
    remote_port: u16,

    /// Local port to listen on, 0 picks an ephemeral port.
    #[clap(long, short, default_value = "0")]
    local_port: u16,

    /// Path to the kubeconfig file.
    #[clap(long, env = "KUBECONFIG")]
    kube_config_path: Option<PathBuf>,

    /// How long to wait for the tunnel to become ready.
    #[clap(long, default_value = "30s")]
    ready_timeout: humantime::Duration,

    /// Log the forwarded connections.
    #[clap(long)]
    emit_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();

    let cluster = Arc::new(kube_tunnel::KubeCluster::from_kubeconfig(args.kube_config_path).await?);
    let session = kube_tunnel::TunnelSession::for_workload(
        cluster,
        &args.namespace,
        &args.deployment,
        args.local_port,
        args.remote_port,
        args.emit_logs,
    )
    .await?;
    let session = Arc::new(session);

    let mut handle = session.spawn();
    session
        .wait_until_ready_timeout(args.ready_timeout.into())
        .await?;
    tracing::info!(
        url = %session.local_url("/"),
        pod = %session.target().pod_name,
        "Tunnel ready"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => session.stop(),
        result = &mut handle => return Ok(result??),
    }

    handle.await??;
    Ok(())
}
