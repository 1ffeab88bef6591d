use crate::Result;
use rsip::{host_with_port, transport::Transport, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// Network address of a SIP peer or local socket
///
/// Combines a host/port with the transport protocol that reaches it. Used as
/// the key for transport lookups and as the address reported in transport
/// events.
///
/// ```rust
/// use rsipchan::transport::SipAddr;
/// use rsip::transport::Transport;
///
/// let addr = SipAddr::from_socket(Transport::Tcp, "192.168.1.100:5060".parse().unwrap());
/// assert_eq!(addr.protocol(), Transport::Tcp);
/// assert_eq!(addr.get_socketaddr().unwrap().port(), 5060);
/// ```
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr {
                r#type: Some(r#type),
                addr,
            } => write!(f, "{} {}", r#type, addr),
            SipAddr { r#type: None, addr } => write!(f, "{}", addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn from_socket(transport: Transport, addr: SocketAddr) -> Self {
        SipAddr::new(transport, addr.into())
    }

    pub fn protocol(&self) -> Transport {
        self.r#type.unwrap_or(Transport::Udp)
    }

    fn default_port(&self) -> u16 {
        match self.r#type {
            Some(Transport::Tls) => 5061,
            _ => 5060,
        }
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(crate::Error::Error(format!(
                "Cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => {
                let port = self
                    .addr
                    .port
                    .map_or(self.default_port(), |p| p.value().to_owned());
                Ok(SocketAddr::new(ip_addr.to_owned(), port))
            }
        }
    }

    /// Same endpoint regardless of protocol annotation
    pub fn same_endpoint(&self, other: &SocketAddr) -> bool {
        self.get_socketaddr().is_ok_and(|addr| addr == *other)
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        let scheme = match addr.r#type {
            Some(Transport::Tls) => rsip::Scheme::Sips,
            _ => rsip::Scheme::Sip,
        };
        let mut params = vec![];
        if let Some(t @ (Transport::Tcp | Transport::Tls)) = addr.r#type {
            params.push(rsip::Param::Transport(t));
        }
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.addr.clone(),
            params,
            ..Default::default()
        }
    }
}

impl From<SipAddr> for HostWithPort {
    fn from(addr: SipAddr) -> Self {
        addr.addr
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(host_with_port: HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let transport = uri.transport().cloned().or(match uri.scheme {
            Some(rsip::Scheme::Sips) => Some(Transport::Tls),
            _ => None,
        });
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}
