use super::{stream::StreamTransport, udp::UdpTransport, SipAddr};
use crate::Result;
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Clone)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Lifecycle of a transport, only ever moving forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransportStatus {
    Idle = 0,
    Connected = 1,
    Terminating = 2,
    Terminated = 3,
}

impl From<u8> for TransportStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => TransportStatus::Idle,
            1 => TransportStatus::Connected,
            2 => TransportStatus::Terminating,
            _ => TransportStatus::Terminated,
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Idle => write!(f, "Idle"),
            TransportStatus::Connected => write!(f, "Connected"),
            TransportStatus::Terminating => write!(f, "Terminating"),
            TransportStatus::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Atomic holder enforcing forward-only status transitions
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(TransportStatus::Idle as u8))
    }

    pub fn get(&self) -> TransportStatus {
        self.0.load(Ordering::Acquire).into()
    }

    /// Moves to `status` if it is ahead of the current one
    pub fn advance(&self, status: TransportStatus) -> bool {
        let target = status as u8;
        self.0.fetch_max(target, Ordering::AcqRel) < target
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What the worker does after one `process()` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Process {
    Continue,
    Sleep(Duration),
    Terminate,
}

/// Number of transport events handed out but not yet consumed
#[derive(Debug, Clone, Default)]
pub struct EventCounter(Arc<AtomicUsize>);

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by the consumer once an incoming event has been handled
    pub fn done(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpTransport),
    Stream(StreamTransport),
}

impl SipConnection {
    pub fn id(&self) -> &str {
        match self {
            SipConnection::Udp(t) => t.id(),
            SipConnection::Stream(t) => t.id(),
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, SipConnection::Stream(_))
    }

    pub fn protocol(&self) -> rsip::transport::Transport {
        match self {
            SipConnection::Udp(_) => rsip::transport::Transport::Udp,
            SipConnection::Stream(t) => t.protocol(),
        }
    }

    pub fn status(&self) -> TransportStatus {
        match self {
            SipConnection::Udp(t) => t.status(),
            SipConnection::Stream(t) => t.status(),
        }
    }

    pub fn get_addr(&self) -> SipAddr {
        match self {
            SipConnection::Udp(t) => t.get_addr(),
            SipConnection::Stream(t) => t.get_addr().clone(),
        }
    }

    /// Local address announced in Via and Contact
    pub fn local_addr(&self) -> Option<SipAddr> {
        match self {
            SipConnection::Udp(t) => Some(t.get_addr()),
            SipConnection::Stream(t) => t.local_addr(),
        }
    }

    /// Sends a message; `destination` is required for UDP and ignored by streams
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(t) => {
                let target = match destination {
                    Some(addr) => addr.get_socketaddr()?,
                    None => Self::get_destination(&msg)?,
                };
                t.send(msg, target).await
            }
            SipConnection::Stream(t) => t.send(msg),
        }
    }

    pub async fn process(&self) -> Process {
        match self {
            SipConnection::Udp(t) => t.process().await,
            SipConnection::Stream(t) => t.process().await,
        }
    }

    pub fn terminate(&self, reason: &str) {
        match self {
            SipConnection::Udp(t) => t.terminate(reason),
            SipConnection::Stream(t) => t.terminate(reason),
        }
    }

    pub fn acquire(&self) {
        if let SipConnection::Stream(t) = self {
            t.acquire();
        }
    }

    pub fn release(&self) {
        if let SipConnection::Stream(t) = self {
            t.release();
        }
    }
}

impl SipConnection {
    pub fn update_msg_received(msg: SipMessage, addr: SocketAddr) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    /// Stamps `received` and `rport` when the sent-by differs from the source
    pub fn build_via_received(via: &mut rsip::headers::Via, addr: SocketAddr) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.uri.host_with_port == received {
            return Ok(());
        }
        typed_via.params.retain(|param| match param {
            Param::Other(key, _) => !key.value().eq_ignore_ascii_case("rport"),
            Param::Received(_) => false,
            _ => true,
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(addr.ip().to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Address a response must be sent to, honoring `received` and `rport`
    pub fn parse_target_from_via(via: &rsip::headers::untyped::Via) -> Result<HostWithPort> {
        let typed = via.typed()?;
        let mut host_with_port = typed.uri.host_with_port;
        for param in typed.params.iter() {
            match param {
                Param::Received(v) => {
                    if let Ok(addr) = v.value().parse::<std::net::IpAddr>() {
                        host_with_port.host = addr.into();
                    }
                }
                Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                    if let Ok(port) = value.value().parse::<u16>() {
                        host_with_port.port = Some(port.into());
                    }
                }
                _ => {}
            }
        }
        Ok(host_with_port)
    }

    pub fn get_destination(msg: &SipMessage) -> Result<SocketAddr> {
        let host_with_port = match msg {
            SipMessage::Request(req) => req.uri.host_with_port.clone(),
            SipMessage::Response(res) => Self::parse_target_from_via(res.via_header()?)?,
        };
        SipAddr::from(host_with_port).get_socketaddr()
    }
}

impl PartialEq for SipConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Stream(t) => write!(f, "{}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpTransport> for SipConnection {
    fn from(transport: UdpTransport) -> Self {
        SipConnection::Udp(transport)
    }
}

impl From<StreamTransport> for SipConnection {
    fn from(transport: StreamTransport) -> Self {
        SipConnection::Stream(transport)
    }
}
