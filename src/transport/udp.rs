use super::{
    backoff::Backoff,
    codec,
    connection::{EventCounter, Process, StatusCell, TransportSender, TransportStatus},
    SipAddr, SipConnection, TransportEvent,
};
use crate::{config::TransportConfig, Result};
use parking_lot::Mutex;
use rsip::transport::Transport;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, error, info, instrument, trace, warn};

const NEW_DIALOG_METHODS: &[&str] = &["INVITE", "REGISTER", "SUBSCRIBE", "OPTIONS"];

struct UdpTransportInner {
    id: String,
    config: Arc<TransportConfig>,
    bind_addr: Mutex<SocketAddr>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    status: StatusCell,
    backoff: Mutex<Backoff>,
    last_error: Mutex<Option<String>>,
    send_alarm: AtomicBool,
    sender: TransportSender,
    counter: EventCounter,
}

/// Datagram transport, also acting as the UDP listener
///
/// The socket is bound lazily by [`UdpTransport::process`] and rebound on
/// demand; bind failures are retried with a bounded exponential backoff.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

impl UdpTransport {
    pub fn new(
        id: &str,
        bind_addr: SocketAddr,
        config: Arc<TransportConfig>,
        sender: TransportSender,
        counter: EventCounter,
    ) -> Self {
        let backoff = Backoff::new(config.bind_retry_min, config.bind_retry_max);
        UdpTransport {
            inner: Arc::new(UdpTransportInner {
                id: id.to_string(),
                config,
                bind_addr: Mutex::new(bind_addr),
                socket: Mutex::new(None),
                local_addr: Mutex::new(None),
                status: StatusCell::new(),
                backoff: Mutex::new(backoff),
                last_error: Mutex::new(None),
                send_alarm: AtomicBool::new(false),
                sender,
                counter,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status.get()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.socket.lock().is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Configured bind address
    pub fn bind_address(&self) -> SocketAddr {
        *self.inner.bind_addr.lock()
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn get_addr(&self) -> SipAddr {
        let addr = self.local_addr().unwrap_or_else(|| self.bind_address());
        SipAddr::from_socket(Transport::Udp, addr)
    }

    /// Changes the bind address; the socket is rebound on the next pass
    pub fn rebind(&self, addr: SocketAddr) {
        let mut bind_addr = self.inner.bind_addr.lock();
        if *bind_addr == addr && self.is_bound() {
            return;
        }
        info!(id = %self.inner.id, from = %*bind_addr, to = %addr, "rebinding UDP transport");
        *bind_addr = addr;
        self.inner.socket.lock().take();
        self.inner.local_addr.lock().take();
        self.inner.backoff.lock().reset();
    }

    pub fn terminate(&self, reason: &str) {
        if self.inner.status.advance(TransportStatus::Terminating) {
            info!(id = %self.inner.id, reason, "terminating UDP transport");
            *self.inner.last_error.lock() = Some(reason.to_string());
        }
    }

    async fn try_bind(&self) -> std::result::Result<Arc<UdpSocket>, std::time::Duration> {
        let addr = self.bind_address();
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                let local = socket.local_addr().ok();
                *self.inner.local_addr.lock() = local;
                *self.inner.socket.lock() = Some(socket.clone());
                *self.inner.last_error.lock() = None;
                self.inner.backoff.lock().reset();
                self.inner.status.advance(TransportStatus::Connected);
                info!(id = %self.inner.id, local = ?local, "UDP transport bound");
                Ok(socket)
            }
            Err(e) => {
                let delay = self.inner.backoff.lock().next();
                let reason = format!("bind {} failed: {}", addr, e);
                warn!(id = %self.inner.id, retry_in = ?delay, "{}", reason);
                *self.inner.last_error.lock() = Some(reason);
                Err(delay)
            }
        }
    }

    /// One worker pass: bind if needed, then read at most one datagram
    pub async fn process(&self) -> Process {
        if self.inner.status.get() >= TransportStatus::Terminating {
            self.inner.socket.lock().take();
            self.inner.status.advance(TransportStatus::Terminated);
            return Process::Terminate;
        }
        let socket = self.inner.socket.lock().clone();
        let socket = match socket {
            Some(socket) => socket,
            None => match self.try_bind().await {
                Ok(socket) => socket,
                Err(delay) => return Process::Sleep(delay),
            },
        };

        let mut buf = vec![0u8; self.inner.config.udp_max_packet];
        match timeout(self.inner.config.idle_sleep, socket.recv_from(&mut buf)).await {
            Err(_) => Process::Continue,
            Ok(Err(e)) => {
                debug!(id = %self.inner.id, "error receiving UDP packet: {}", e);
                Process::Continue
            }
            Ok(Ok((len, from))) => self.on_datagram(&buf[..len], from),
        }
    }

    fn flooded(&self) -> bool {
        let threshold = self.inner.config.flood_threshold;
        threshold > 0 && self.inner.counter.get() > threshold
    }

    fn on_datagram(&self, data: &[u8], from: SocketAddr) -> Process {
        if data.len() < self.inner.config.min_packet_size {
            trace!(id = %self.inner.id, %from, len = data.len(), "dropping short datagram");
            return Process::Continue;
        }
        if self.flooded() && !codec::looks_in_dialog(data) {
            if let Some(method) = codec::request_method(data) {
                if NEW_DIALOG_METHODS
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(method))
                {
                    debug!(id = %self.inner.id, %from, method, "flood guard dropping request");
                    return Process::Continue;
                }
            }
        }

        let msg = match codec::parse_datagram(data) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Process::Continue,
            Err(e) => {
                info!(id = %self.inner.id, %from, "error parsing SIP message: {}", e);
                return Process::Continue;
            }
        };
        let msg = match SipConnection::update_msg_received(msg, from) {
            Ok(msg) => msg,
            Err(e) => {
                info!(id = %self.inner.id, %from, "invalid Via header: {}", e);
                return Process::Continue;
            }
        };
        debug!(id = %self.inner.id, %from, len = data.len(), "received datagram");

        self.inner.counter.inc();
        let event = TransportEvent::Incoming(
            msg,
            SipConnection::Udp(self.clone()),
            SipAddr::from_socket(Transport::Udp, from),
        );
        if self.inner.sender.send(event).is_err() {
            self.inner.counter.done();
            self.terminate("event channel closed");
            return Process::Terminate;
        }
        Process::Continue
    }

    #[instrument(skip(self, msg), fields(id = %self.inner.id))]
    pub async fn send(&self, msg: rsip::SipMessage, target: SocketAddr) -> Result<()> {
        let buf = codec::serialize(&msg);
        trace!("sending {} -> {}", buf.len(), target);
        self.send_raw(&buf, target).await
    }

    pub async fn send_raw(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let socket = self.inner.socket.lock().clone();
        let socket = socket.ok_or_else(|| {
            crate::Error::TransportLayerError("socket not bound".to_string(), self.get_addr())
        })?;
        match socket.send_to(data, target).await {
            Ok(_) => {
                if self.inner.send_alarm.swap(false, Ordering::AcqRel) {
                    info!(id = %self.inner.id, "UDP send recovered");
                }
                Ok(())
            }
            Err(e) => {
                if !self.inner.send_alarm.swap(true, Ordering::AcqRel) {
                    error!(id = %self.inner.id, %target, "UDP send failed: {}", e);
                } else {
                    debug!(id = %self.inner.id, %target, "UDP send failed: {}", e);
                }
                Err(crate::Error::TransportLayerError(
                    e.to_string(),
                    self.get_addr(),
                ))
            }
        }
    }
}

impl std::fmt::Display for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.local_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.inner.id, self.get_addr())
    }
}

impl Drop for UdpTransportInner {
    fn drop(&mut self) {
        debug!(id = %self.id, "dropping UDP transport");
    }
}
