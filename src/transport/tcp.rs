use super::{stream::StreamIo, SipAddr};
use crate::Result;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

/// Opens a plain TCP connection to `remote`
pub async fn connect(remote: &SipAddr) -> Result<(StreamIo, SocketAddr)> {
    let socket_addr = remote.get_socketaddr()?;
    let stream = TcpStream::connect(socket_addr).await?;
    stream.set_nodelay(true).ok();
    let local = stream.local_addr()?;
    debug!(%local, remote = %socket_addr, "TCP connected");
    Ok((StreamIo::new(stream), local))
}

/// Binds a listening socket with an explicit accept backlog
pub fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}
