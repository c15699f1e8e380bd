use crate::error::{AllocationSnafu, InvalidListenAddressSnafu, Result};
use snafu::{ensure, ResultExt};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Selects a local port for the port-forwarding.
/// It binds to a free ephemeral port on the wildcard address and returns the port number, the
/// socket being released before returning.
/// The port is only guaranteed to have been free when it was bound, another process may take
/// it before the caller binds it again.
pub fn allocate_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .context(AllocationSnafu)?;
    let address = listener.local_addr().context(AllocationSnafu)?;
    drop(listener);

    let port = address.port();
    ensure!(
        port != 0,
        InvalidListenAddressSnafu {
            address: address.to_string()
        }
    );

    tracing::trace!(port, "Allocated ephemeral port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ports_are_bindable() {
        for _ in 0 .. 8 {
            let port = allocate_ephemeral_port().unwrap();
            assert_ne!(port, 0);
            let rebound = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
            assert!(rebound.is_ok(), "port {port} should be free to bind again");
        }
    }
}
