use crate::error::{EngineError, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;

/// Binds the first free TCP port in `base..base+span` and hands back the listener,
/// so nothing can grab the port between probing and serving.
pub async fn allocate_port(bind_ip: IpAddr, base: u16, span: u16) -> Result<(u16, TcpListener)> {
    for offset in 0..span {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        if port == 0 {
            continue;
        }
        match TcpListener::bind(SocketAddr::new(bind_ip, port)).await {
            Ok(listener) => return Ok((port, listener)),
            Err(e) => tracing::debug!("chat port {} unavailable: {}", port, e),
        }
    }
    Err(EngineError::PortExhausted { base, span })
}
