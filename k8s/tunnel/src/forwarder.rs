use crate::{
    cluster::PortForwardConnection,
    error::{AcceptSnafu, Error, RemoteClosedSnafu, Result},
};
use futures::StreamExt;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// Forwarder events are only logged when the session was asked to emit logs.
macro_rules! forward_log {
    ($emit:expr, $level:ident, $($arg:tt)+) => {
        if $emit {
            tracing::$level!($($arg)+);
        }
    };
}

/// Bridges the connections accepted by the local listener to streams of the upgraded connection.
pub(crate) struct Forwarder {
    pub(crate) listener: TcpListener,
    pub(crate) connection: Arc<dyn PortForwardConnection>,
    pub(crate) pod_name: String,
    pub(crate) local_port: u16,
    pub(crate) pod_port: u16,
    pub(crate) emit_logs: bool,
}

impl Forwarder {
    /// Runs until `stop` is cancelled, the upgraded connection goes away or a fatal error occurs.
    /// Connections still being forwarded are cancelled on return.
    pub(crate) async fn run(self, stop: CancellationToken) -> Result<()> {
        let Self {
            listener,
            connection,
            pod_name,
            local_port,
            pod_port,
            emit_logs,
        } = self;

        let active = stop.child_token();
        let (fatal_send, mut fatal_recv) = mpsc::channel::<Error>(1);
        let mut incoming = TcpListenerStream::new(listener);
        let closed = connection.closed();
        tokio::pin!(closed);

        forward_log!(emit_logs, info, local_port, pod_port, pod_name, "Forwarding connections");

        let result = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break Ok(()),
                remote = &mut closed => {
                    break match remote {
                        Ok(()) => RemoteClosedSnafu { pod: &pod_name }.fail(),
                        Err(error) => Err(error),
                    }
                }
                Some(error) = fatal_recv.recv() => break Err(error),
                client_conn = incoming.next() => {
                    let client_conn = match client_conn {
                        Some(Ok(client_conn)) => client_conn,
                        Some(Err(error)) => break Err(error).context(AcceptSnafu),
                        None => break Ok(()),
                    };
                    if let Ok(peer_addr) = client_conn.peer_addr() {
                        forward_log!(emit_logs, debug, %peer_addr, local_port, "new connection");
                    }

                    let stream = StreamForward {
                        connection: connection.clone(),
                        pod_name: pod_name.clone(),
                        local_port,
                        pod_port,
                        emit_logs,
                    };
                    let cancel = active.clone();
                    let fatal_send = fatal_send.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = stream.forward(client_conn) => {
                                if let Err(error) = result {
                                    if error.is_fatal() {
                                        // only the first fatal error is needed
                                        fatal_send.try_send(error).ok();
                                    } else {
                                        forward_log!(
                                            emit_logs,
                                            error,
                                            error = &error as &dyn std::error::Error,
                                            "failed to forward connection"
                                        );
                                    }
                                }
                            }
                        }
                    });
                }
            }
        };

        active.cancel();
        match &result {
            Ok(()) => {
                forward_log!(emit_logs, info, local_port, pod_port, pod_name, "Stopped forwarding");
            }
            Err(error) => {
                forward_log!(
                    emit_logs,
                    error,
                    local_port,
                    pod_port,
                    pod_name,
                    error = error as &dyn std::error::Error,
                    "Forwarding terminated"
                );
            }
        }
        result
    }
}

/// Forwards a single local connection.
struct StreamForward {
    connection: Arc<dyn PortForwardConnection>,
    pod_name: String,
    local_port: u16,
    pod_port: u16,
    emit_logs: bool,
}

impl StreamForward {
    async fn forward(self, mut client_conn: tokio::net::TcpStream) -> Result<()> {
        let Self {
            connection,
            pod_name,
            local_port,
            pod_port,
            emit_logs,
        } = self;

        let mut upstream_conn = connection.open_stream().await?;
        forward_log!(emit_logs, debug, local_port, pod_port, pod_name, "forwarding connection");

        if let Err(error) =
            tokio::io::copy_bidirectional(&mut client_conn, &mut upstream_conn).await
        {
            forward_log!(
                emit_logs,
                trace,
                local_port,
                pod_port,
                pod_name,
                ?error,
                "connection error"
            );
        }

        forward_log!(emit_logs, debug, local_port, pod_port, pod_name, "connection closed");
        Ok(())
    }
}
