use clap::Parser;
use kube_tunnel::ClusterApi;
use std::sync::Arc;

/// Queries the admin endpoint of a pod's sidecar proxy through a tunnel.
#[derive(Parser, Debug)]
struct CliArgs {
    /// Namespace of the pod.
    #[clap(long, short, default_value = "default")]
    namespace: String,

    /// Name of the pod.
    pod: String,

    /// Path of the admin endpoint.
    #[clap(long, default_value = "/ready")]
    path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();

    let cluster = Arc::new(kube_tunnel::KubeCluster::try_default().await?);
    let pod = cluster.get_pod(&args.namespace, &args.pod).await?;
    let session = Arc::new(kube_tunnel::TunnelSession::for_proxy_admin(
        cluster, &pod, false,
    )?);

    let handle = session.spawn();
    session.wait_until_ready().await?;

    let uri = session.local_url(&args.path);
    let response = hyper::Client::new().get(uri.parse()?).await?;
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await?;
    tracing::info!(%uri, %status, body = %String::from_utf8_lossy(&body), "admin request complete");

    session.stop();
    handle.await??;
    Ok(())
}
