use super::{next_closed, next_incoming, options_request, wait_until};
use crate::{
    config::{ListenerConfig, TransportConfig},
    transport::{
        connection::TransportReceiver, SipAddr, SipConnection, StreamTransport, TransportEvent,
        TransportLayer, TransportStatus,
    },
    Result,
};
use rsip::{transport::Transport, SipMessage};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

const OK: &str = "SIP/2.0 200 OK\r\n\
    Via: SIP/2.0/TCP 10.1.1.1:5060;branch=z9hG4bK776asdhds\r\n\
    From: <sip:alice@example.com>;tag=1928301774\r\n\
    To: <sip:bob@example.com>;tag=b1\r\n\
    Call-ID: tcp-1\r\n\
    CSeq: 63104 OPTIONS\r\n\
    Content-Length: 0\r\n\r\n";

async fn listening(config: TransportConfig) -> Result<(TransportLayer, TransportReceiver, SocketAddr)> {
    let layer = TransportLayer::new(config, CancellationToken::new());
    let events = layer.events().expect("event receiver");
    let listener = layer.set_listener(ListenerConfig::tcp("tcp0", "127.0.0.1".parse()?, 0));
    assert!(wait_until(|| listener.is_bound()).await, "listener never bound");
    let addr = listener.local_addr().expect("listener address");
    Ok((layer, events, addr))
}

/// Accepted transport announced by the registry
async fn next_accepted(events: &mut TransportReceiver) -> Option<StreamTransport> {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let TransportEvent::New(SipConnection::Stream(t)) = event {
                if !t.is_outgoing() {
                    return Some(t);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Result<Vec<u8>> {
    let mut received = vec![];
    let mut buf = [0u8; 2048];
    timeout(Duration::from_secs(2), async {
        while !received.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        Ok::<_, std::io::Error>(())
    })
    .await??;
    Ok(received)
}

async fn read_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 256];
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
    });
    closed.await.unwrap_or(false)
}

#[tokio::test]
async fn test_tcp_request_split_across_writes() -> Result<()> {
    let (layer, mut events, addr) = listening(TransportConfig::default()).await?;
    let mut client = TcpStream::connect(addr).await?;
    let raw = options_request("TCP 10.1.1.1:5060", "tcp-1");
    let (head, tail) = raw.as_bytes().split_at(60);
    client.write_all(head).await?;
    sleep(Duration::from_millis(30)).await;
    client.write_all(tail).await?;

    let (connection, source) = match next_incoming(&mut events, Duration::from_secs(2)).await {
        Some(TransportEvent::Incoming(SipMessage::Request(_), connection, source)) => {
            (connection, source)
        }
        _ => panic!("no incoming request"),
    };
    assert_eq!(source.get_socketaddr()?, client.local_addr()?);
    let transport = match &connection {
        SipConnection::Stream(t) => t.clone(),
        SipConnection::Udp(_) => panic!("expected a stream transport"),
    };
    assert!(!transport.is_outgoing());
    assert_eq!(transport.protocol(), Transport::Tcp);
    assert!(layer.find(transport.id()).is_some());

    connection.send(SipMessage::try_from(OK)?, None).await?;
    let reply = read_until(&mut client, b"\r\n\r\n").await?;
    assert!(reply.starts_with(b"SIP/2.0 200 OK"));

    client.write_all(b"\r\n\r\n").await?;
    let pong = read_until(&mut client, b"\r\n").await?;
    assert_eq!(pong, b"\r\n");
    Ok(())
}

#[tokio::test]
async fn test_outgoing_stream_connects_and_is_reused() -> Result<()> {
    let (layer, mut events, addr) = listening(TransportConfig::default()).await?;
    let remote = SipAddr::from_socket(Transport::Tcp, addr);

    let outgoing = layer.connect_stream(&remote, None)?;
    assert!(outgoing.is_outgoing());
    outgoing.send(SipMessage::try_from(options_request("TCP 10.1.1.1:5060", "out-1").as_str())?)?;

    match next_incoming(&mut events, Duration::from_secs(2)).await {
        Some(TransportEvent::Incoming(_, SipConnection::Stream(accepted), _)) => {
            assert!(!accepted.is_outgoing());
            assert_ne!(accepted.id(), outgoing.id());
        }
        _ => panic!("request never reached the listener"),
    }
    assert!(outgoing.is_connected());
    assert_eq!(outgoing.queued(), 0);

    let again = layer.connect_stream(&remote, None)?;
    assert_eq!(again.id(), outgoing.id());
    assert!(layer.find_stream(&remote).is_some());
    Ok(())
}

#[tokio::test]
async fn test_outgoing_gives_up_after_connect_retries() -> Result<()> {
    let refused = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let config = TransportConfig::default().with_connect(
        3,
        Duration::from_millis(20),
        Duration::from_millis(200),
    );
    let layer = TransportLayer::new(config, CancellationToken::new());
    let mut events = layer.events().expect("event receiver");

    let transport = layer.connect_stream(&SipAddr::from_socket(Transport::Tcp, refused), None)?;
    match next_closed(&mut events, Duration::from_secs(3)).await {
        Some(TransportEvent::Closed(connection)) => assert_eq!(connection.id(), transport.id()),
        _ => panic!("transport never closed"),
    }
    assert_eq!(transport.status(), TransportStatus::Terminated);
    assert_eq!(
        transport.last_error().as_deref(),
        Some("connect retries exhausted")
    );
    assert!(layer.find(transport.id()).is_none());
    assert!(transport.send(SipMessage::try_from(OK)?).is_err());
    Ok(())
}

#[tokio::test]
async fn test_outgoing_sends_keepalive_when_idle() -> Result<()> {
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let config = TransportConfig::default().with_idle_interval(Duration::from_millis(100));
    let layer = TransportLayer::new(config, CancellationToken::new());
    let remote = SipAddr::from_socket(Transport::Tcp, server.local_addr()?);
    let transport = layer.connect_stream(&remote, None)?;

    let (mut peer, _) = timeout(Duration::from_secs(2), server.accept()).await??;
    let ping = read_until(&mut peer, b"\r\n\r\n").await?;
    assert!(ping.starts_with(b"\r\n\r\n"));
    assert!(transport.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_incoming_idle_timeout_respects_references() -> Result<()> {
    let config = TransportConfig::default().with_idle_interval(Duration::from_millis(150));
    let (_layer, mut events, addr) = listening(config).await?;
    let mut client = TcpStream::connect(addr).await?;

    let accepted = next_accepted(&mut events).await.expect("accepted transport");
    accepted.acquire();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(accepted.status(), TransportStatus::Connected);

    assert_eq!(accepted.release(), 0);
    assert!(read_eof(&mut client).await);
    assert!(wait_until(|| accepted.status() == TransportStatus::Terminated).await);
    assert_eq!(accepted.last_error().as_deref(), Some("idle timeout"));
    Ok(())
}

#[tokio::test]
async fn test_oversized_frame_terminates_connection() -> Result<()> {
    let config = TransportConfig::default().with_max_packet(1500, 256);
    let (_layer, mut events, addr) = listening(config).await?;
    let mut client = TcpStream::connect(addr).await?;
    let accepted = next_accepted(&mut events).await.expect("accepted transport");

    let mut junk = b"INVITE sip:bob@example.com SIP/2.0\r\nSubject: ".to_vec();
    junk.extend_from_slice(&[b'x'; 400]);
    client.write_all(&junk).await?;

    assert!(read_eof(&mut client).await);
    assert!(wait_until(|| accepted.status() == TransportStatus::Terminated).await);
    assert!(accepted
        .last_error()
        .unwrap_or_default()
        .contains("overflow"));
    Ok(())
}

#[tokio::test]
async fn test_flow_timer_is_clamped() -> Result<()> {
    let config = TransportConfig::default().with_idle_interval(Duration::from_secs(10));
    let (layer, _events, addr) = listening(config).await?;
    let outgoing = layer.connect_stream(&SipAddr::from_socket(Transport::Tcp, addr), None)?;
    assert_eq!(outgoing.idle_interval(), Duration::from_secs(10));

    outgoing.set_flow_timer(Duration::from_secs(5));
    assert_eq!(outgoing.idle_interval(), Duration::from_secs(20));
    outgoing.set_flow_timer(Duration::from_secs(3600));
    assert_eq!(outgoing.idle_interval(), Duration::from_secs(600));
    outgoing.set_flow_timer(Duration::from_secs(90));
    assert_eq!(outgoing.idle_interval(), Duration::from_secs(90));
    Ok(())
}

#[tokio::test]
async fn test_outgoing_reconnects_after_overflow() -> Result<()> {
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let config = TransportConfig::default().with_max_packet(1500, 256);
    let layer = TransportLayer::new(config, CancellationToken::new());
    let remote = SipAddr::from_socket(Transport::Tcp, server.local_addr()?);
    let transport = layer.connect_stream(&remote, None)?;

    let (mut first, _) = timeout(Duration::from_secs(2), server.accept()).await??;
    let mut junk = b"SIP/2.0 200 OK\r\nSubject: ".to_vec();
    junk.extend_from_slice(&[b'x'; 400]);
    first.write_all(&junk).await?;
    assert!(read_eof(&mut first).await);

    let (_second, _) = timeout(Duration::from_secs(2), server.accept()).await??;
    assert!(wait_until(|| transport.is_connected()).await);
    assert_ne!(transport.status(), TransportStatus::Terminated);
    assert!(layer.find(transport.id()).is_some());
    Ok(())
}

#[tokio::test]
async fn test_malformed_framing_is_fatal_for_outgoing() -> Result<()> {
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let layer = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
    let remote = SipAddr::from_socket(Transport::Tcp, server.local_addr()?);
    let transport = layer.connect_stream(&remote, None)?;

    let (mut peer, _) = timeout(Duration::from_secs(2), server.accept()).await??;
    peer.write_all(b"SIP/2.0 200 OK\r\nContent-Length: many\r\n\r\n")
        .await?;
    assert!(read_eof(&mut peer).await);
    assert!(wait_until(|| transport.status() == TransportStatus::Terminated).await);
    assert!(transport
        .last_error()
        .unwrap_or_default()
        .contains("Content-Length"));
    Ok(())
}
