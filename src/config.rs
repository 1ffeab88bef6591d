//! Immutable configuration for transports, listeners and sessions
//!
//! Every value that governs retries, timeouts or policy lives here and is
//! handed to constructors wrapped in an `Arc`. Nothing in the crate reads
//! process-wide settings.
use rsip::transport::Transport;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

const USER_AGENT: &str = crate::VERSION;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// First bind retry delay, doubled on every failure
    pub bind_retry_min: Duration,
    /// Upper bound of the bind retry delay
    pub bind_retry_max: Duration,
    /// Listener retry interval while its TLS context is missing
    pub tls_retry_interval: Duration,
    /// Connect attempts made by an outgoing stream before it gives up
    pub connect_retries: u32,
    pub connect_interval: Duration,
    pub connect_timeout: Duration,
    /// Default keepalive / idle interval of stream transports
    pub idle_interval: Duration,
    pub flow_timer_min: Duration,
    pub flow_timer_max: Duration,
    pub udp_max_packet: usize,
    pub tcp_max_packet: usize,
    /// Datagrams shorter than this are dropped
    pub min_packet_size: usize,
    /// Longest time a worker waits for socket readiness in one pass
    pub idle_sleep: Duration,
    /// Events in flight above which new UDP requests are dropped, 0 disables
    pub flood_threshold: usize,
    pub shutdown_flush_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_retry_min: Duration::from_millis(500),
            bind_retry_max: Duration::from_secs(30),
            tls_retry_interval: Duration::from_secs(10),
            connect_retries: 3,
            connect_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            idle_interval: Duration::from_secs(120),
            flow_timer_min: Duration::from_secs(20),
            flow_timer_max: Duration::from_secs(600),
            udp_max_packet: 1500,
            tcp_max_packet: 4096,
            min_packet_size: 72,
            idle_sleep: Duration::from_millis(20),
            flood_threshold: 0,
            shutdown_flush_timeout: Duration::from_millis(500),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn with_bind_retry(mut self, min: Duration, max: Duration) -> Self {
        self.bind_retry_min = min;
        self.bind_retry_max = max.max(min);
        self
    }

    pub fn with_tls_retry_interval(mut self, interval: Duration) -> Self {
        self.tls_retry_interval = interval;
        self
    }

    pub fn with_connect(mut self, retries: u32, interval: Duration, timeout: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_interval = interval;
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, idle: Duration) -> Self {
        self.idle_interval = idle;
        self
    }

    pub fn with_flow_timer_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.flow_timer_min = min;
        self.flow_timer_max = max.max(min);
        self
    }

    pub fn with_max_packet(mut self, udp: usize, tcp: usize) -> Self {
        self.udp_max_packet = udp;
        self.tcp_max_packet = tcp;
        self
    }

    pub fn with_min_packet_size(mut self, size: usize) -> Self {
        self.min_packet_size = size;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_flood_threshold(mut self, threshold: usize) -> Self {
        self.flood_threshold = threshold;
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Clamp a negotiated flow timer into the configured range
    pub fn clamp_flow_timer(&self, value: Duration) -> Duration {
        value.clamp(self.flow_timer_min, self.flow_timer_max)
    }
}

/// Bind parameters of one TCP or TLS listener
///
/// Two configs that compare equal describe the same socket; any difference
/// makes the registry rebuild the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub name: String,
    pub protocol: Transport,
    pub addr: IpAddr,
    pub port: u16,
    pub ipv6: bool,
    pub backlog: u32,
    pub tls_context: Option<String>,
}

impl ListenerConfig {
    pub fn tcp(name: &str, addr: IpAddr, port: u16) -> Self {
        Self {
            name: name.to_string(),
            protocol: Transport::Tcp,
            addr,
            port,
            ipv6: addr.is_ipv6(),
            backlog: 5,
            tls_context: None,
        }
    }

    pub fn tls(name: &str, addr: IpAddr, port: u16, context: &str) -> Self {
        Self {
            protocol: Transport::Tls,
            tls_context: Some(context.to_string()),
            ..Self::tcp(name, addr, port)
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    /// Socket address the listener binds
    ///
    /// A wildcard `addr` binds the wildcard of the family `ipv6` selects.
    /// A concrete address keeps its own family.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.addr {
            ip if !ip.is_unspecified() => ip,
            _ if self.ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn is_tls(&self) -> bool {
        self.protocol == Transport::Tls
    }
}

/// When the Session may offer direct media between the call legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardPolicy {
    /// Media is always relayed locally
    Never,
    /// Forward when the peer leg accepts it
    #[default]
    Allowed,
    /// Refuse calls whose peer leg cannot forward
    Required,
}

/// What to do when an in-dialog request arrives from a new network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressChangePolicy {
    /// Keep the original binding
    #[default]
    Ignore,
    /// Follow the address observed at the network layer
    Observed,
    /// Follow only when the topmost Via announces the new address
    Via,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub forward_policy: ForwardPolicy,
    pub nat_detect: bool,
    pub nat_rewrite: bool,
    pub address_change: AddressChangePolicy,
    pub info_dtmf: bool,
    pub reinvite_allowed: bool,
    pub user_agent: String,
    pub realm: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forward_policy: ForwardPolicy::default(),
            nat_detect: true,
            nat_rewrite: true,
            address_change: AddressChangePolicy::default(),
            info_dtmf: true,
            reinvite_allowed: true,
            user_agent: USER_AGENT.to_string(),
            realm: "rsipchan".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_forward_policy(mut self, policy: ForwardPolicy) -> Self {
        self.forward_policy = policy;
        self
    }

    pub fn with_nat(mut self, detect: bool, rewrite: bool) -> Self {
        self.nat_detect = detect;
        self.nat_rewrite = rewrite;
        self
    }

    pub fn with_address_change(mut self, policy: AddressChangePolicy) -> Self {
        self.address_change = policy;
        self
    }

    pub fn with_info_dtmf(mut self, enabled: bool) -> Self {
        self.info_dtmf = enabled;
        self
    }

    pub fn with_reinvite(mut self, allowed: bool) -> Self {
        self.reinvite_allowed = allowed;
        self
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = realm.to_string();
        self
    }
}
