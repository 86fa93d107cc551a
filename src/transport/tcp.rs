//! TCP transport: NODELAY, keepalive and sized socket buffers applied at
//! connection setup, framed reads/writes with per-call timeouts.

use std::net::SocketAddr;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{StreamTransport, TransportError};
use crate::config::Timeouts;

/// Preferred socket buffer size; best-effort, the OS may clamp it.
const SOCKET_BUFFER: usize = 1024 * 1024;

pub type TcpTransport = StreamTransport<TcpStream>;

/// Dials `addr` and applies the ACIP socket options.
pub async fn connect(addr: SocketAddr, timeouts: &Timeouts) -> Result<TcpTransport, TransportError> {
    let stream = timeout(timeouts.connect, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(timeouts.connect))??;
    from_stream(stream, timeouts)
}

/// Wraps an accepted or dialed stream, applying socket options.
pub fn from_stream(stream: TcpStream, timeouts: &Timeouts) -> Result<TcpTransport, TransportError> {
    let label = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "tcp:unknown".into());
    apply_socket_options(&stream, timeouts)?;
    Ok(StreamTransport::new(stream, timeouts, label))
}

fn apply_socket_options(stream: &TcpStream, timeouts: &Timeouts) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(timeouts.keepalive)
        .with_interval(timeouts.keepalive);
    sock.set_tcp_keepalive(&keepalive)?;
    // Buffer sizing is advisory; some platforms refuse large values.
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Packet;
    use crate::transport::Transport;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn loopback_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timeouts = Timeouts::testing();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = from_stream(stream, &Timeouts::testing()).unwrap();
            let packet = transport.recv_frame().await.unwrap();
            transport.send_frame(&packet).await.unwrap();
        });

        let mut client = connect(addr, &timeouts).await.unwrap();
        assert!(client.is_connected());
        let packet = Packet::new(18, 9, Bytes::from_static(b"echo"));
        client.send_frame(&packet).await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap(), packet);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_times_out_on_unroutable_host() {
        // RFC 5737 TEST-NET-1 never answers.
        let addr: SocketAddr = "192.0.2.1:27224".parse().unwrap();
        let err = connect(addr, &Timeouts::testing()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Timeout(_) | TransportError::Io(_)
        ));
    }
}
