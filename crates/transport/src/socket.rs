//! UDP socket setup and quinn endpoint construction.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::Result;

/// Bind a UDP socket with the requested buffer sizes and DSCP marking.
///
/// Buffer and TOS failures are logged and ignored; the kernel may clamp or
/// refuse them without the socket being unusable.
pub fn bind_udp(addr: SocketAddr, sockbuf: usize, dscp: u8) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if sockbuf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(sockbuf) {
            warn!(sockbuf, %e, "failed to set socket receive buffer");
        }
        if let Err(e) = socket.set_send_buffer_size(sockbuf) {
            warn!(sockbuf, %e, "failed to set socket send buffer");
        }
    }

    if dscp > 0 {
        if addr.is_ipv4() {
            if let Err(e) = socket.set_tos(u32::from(dscp) << 2) {
                warn!(dscp, %e, "failed to set DSCP");
            }
        } else {
            debug!(dscp, "DSCP marking is only applied to IPv4 sockets");
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Wrap a bound socket in a quinn endpoint driven by the tokio runtime.
pub fn endpoint(
    socket: UdpSocket,
    server_config: Option<quinn::ServerConfig>,
) -> Result<quinn::Endpoint> {
    let endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        server_config,
        socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    Ok(endpoint)
}

/// Unspecified address of the same family as `remote`, for client sockets.
pub fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0_u16; 8], 0))
    }
}
