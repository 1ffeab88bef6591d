use super::{next_incoming, options_request, wait_until};
use crate::{
    config::{AddressChangePolicy, ListenerConfig, TransportConfig},
    transport::{
        BindingParams, PartyBinding, SipAddr, SipConnection, TransportEvent, TransportLayer,
    },
    Result,
};
use rsip::{transport::Transport, Header, SipMessage};
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

async fn udp_layer() -> Result<(TransportLayer, SocketAddr)> {
    let layer = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
    let udp = layer.add_udp("udp0", "127.0.0.1:0".parse()?);
    assert!(wait_until(|| udp.is_bound()).await);
    let local = udp.local_addr().expect("local address");
    Ok((layer, local))
}

fn options() -> Result<SipMessage> {
    Ok(SipMessage::try_from(
        options_request("UDP 127.0.0.1:5060", "bind-1").as_str(),
    )?)
}

#[tokio::test]
async fn test_udp_binding_sends_to_remote() -> Result<()> {
    let (layer, local) = udp_layer().await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let binding = PartyBinding::new(
        layer.clone(),
        BindingParams::new(Transport::Udp, peer.local_addr()?),
        AddressChangePolicy::Ignore,
    );

    assert!(binding.transport().is_none());
    binding.send(options()?).await?;
    assert_eq!(binding.transport().map(|t| t.id().to_string()).as_deref(), Some("udp0"));

    let mut buf = [0u8; 1500];
    let (len, from) =
        tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await??;
    assert_eq!(from, local);
    assert!(buf[..len].starts_with(b"OPTIONS sip:bob@example.com"));
    Ok(())
}

#[tokio::test]
async fn test_udp_binding_on_missing_local_address() -> Result<()> {
    let (layer, _) = udp_layer().await?;
    let binding = PartyBinding::new(
        layer,
        BindingParams::new(Transport::Udp, "127.0.0.1:5060".parse()?)
            .with_local("127.0.0.1:9".parse()?),
        AddressChangePolicy::Ignore,
    );
    assert!(!binding.bind(false));
    assert!(binding
        .last_error()
        .unwrap_or_default()
        .contains("no UDP transport on 127.0.0.1:9"));
    assert!(binding.send(options()?).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_stream_binding_holds_a_reference() -> Result<()> {
    let layer = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
    let mut events = layer.events().expect("event receiver");
    let listener = layer.set_listener(ListenerConfig::tcp("tcp0", "127.0.0.1".parse()?, 0));
    assert!(wait_until(|| listener.is_bound()).await);
    let remote = listener.local_addr().expect("listener address");

    let binding = PartyBinding::new(
        layer.clone(),
        BindingParams::new(Transport::Tcp, remote),
        AddressChangePolicy::Ignore,
    );
    assert!(binding.bind(false));
    let stream = match binding.transport() {
        Some(SipConnection::Stream(t)) => t,
        other => panic!("expected a stream transport, got {:?}", other),
    };
    assert_eq!(stream.refs(), 1);
    assert_eq!(binding.params().transport_id.as_deref(), Some(stream.id()));

    binding.send(options()?).await?;
    assert!(matches!(
        next_incoming(&mut events, Duration::from_secs(2)).await,
        Some(TransportEvent::Incoming(..))
    ));

    // same parameters keep the transport
    assert!(binding.rebind(binding.params()));
    assert_eq!(stream.refs(), 1);

    let mut ok = rsip::Response {
        status_code: rsip::StatusCode::from(200u16),
        version: rsip::Version::V2,
        headers: Default::default(),
        body: vec![],
    };
    ok.headers
        .push(Header::Other("Flow-Timer".into(), "30".into()));
    assert_eq!(
        binding.apply_flow_timer(&ok),
        Some(Duration::from_secs(120))
    );

    drop(binding);
    assert_eq!(stream.refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_rebind_switches_transport() -> Result<()> {
    let (layer, _) = udp_layer().await?;
    let other = layer.add_udp("udp1", "127.0.0.1:0".parse()?);
    assert!(wait_until(|| other.is_bound()).await);
    let other_local = other.local_addr().expect("local address");

    let remote: SocketAddr = "127.0.0.1:5060".parse()?;
    let binding = PartyBinding::new(
        layer,
        BindingParams::new(Transport::Udp, remote),
        AddressChangePolicy::Ignore,
    );
    assert!(binding.bind(false));
    assert_eq!(binding.transport().map(|t| t.id().to_string()).as_deref(), Some("udp0"));

    assert!(binding.rebind(BindingParams::new(Transport::Udp, remote).with_local(other_local)));
    assert_eq!(binding.transport().map(|t| t.id().to_string()).as_deref(), Some("udp1"));
    Ok(())
}

#[tokio::test]
async fn test_remote_address_change_policies() -> Result<()> {
    let (layer, _) = udp_layer().await?;
    let connection = layer.find("udp0").expect("udp transport");
    let original = SipAddr::from_socket(Transport::Udp, "10.0.0.5:5060".parse()?);
    let moved = SipAddr::from_socket(Transport::Udp, "10.0.0.9:5070".parse()?);

    let ignore = PartyBinding::from_connection(
        layer.clone(),
        connection.clone(),
        original.clone(),
        AddressChangePolicy::Ignore,
    );
    assert!(!ignore.on_remote_address_changed(&moved, &connection, Some(&moved)));
    assert_eq!(ignore.remote(), Some(original.clone()));

    let observed = PartyBinding::from_connection(
        layer.clone(),
        connection.clone(),
        original.clone(),
        AddressChangePolicy::Observed,
    );
    assert!(!observed.on_remote_address_changed(&original, &connection, None));
    assert!(observed.on_remote_address_changed(&moved, &connection, None));
    assert_eq!(observed.remote(), Some(moved.clone()));

    let via = PartyBinding::from_connection(
        layer,
        connection.clone(),
        original.clone(),
        AddressChangePolicy::Via,
    );
    assert!(!via.on_remote_address_changed(&moved, &connection, Some(&original)));
    assert!(!via.on_remote_address_changed(&moved, &connection, None));
    assert!(via.on_remote_address_changed(&moved, &connection, Some(&moved)));
    assert_eq!(via.remote(), Some(moved));
    Ok(())
}
