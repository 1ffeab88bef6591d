use super::{
    backoff::Backoff,
    connection::{Process, StatusCell, TransportStatus},
    stream::{StreamIo, StreamTransport},
    tcp, tls,
    transport_layer::TransportLayerInner,
    worker::Worker,
    SipAddr, SipConnection,
};
use crate::config::{ListenerConfig, TransportConfig};
use parking_lot::Mutex;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct ListenerInner {
    instance: u64,
    config: ListenerConfig,
    transport_config: Arc<TransportConfig>,
    socket: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<TlsAcceptor>>,
    status: StatusCell,
    backoff: Mutex<Backoff>,
    last_error: Mutex<Option<String>>,
    registry: Weak<TransportLayerInner>,
    cancel: CancellationToken,
}

/// TCP or TLS listening socket
///
/// Never mutated after creation: the registry builds a new listener when
/// the bind parameters or the TLS context change.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub(crate) fn new(
        config: ListenerConfig,
        transport_config: Arc<TransportConfig>,
        registry: Weak<TransportLayerInner>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(
            transport_config.bind_retry_min,
            transport_config.bind_retry_max,
        );
        Listener {
            inner: Arc::new(ListenerInner {
                instance: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
                config,
                transport_config,
                socket: tokio::sync::Mutex::new(None),
                local_addr: Mutex::new(None),
                acceptor: Mutex::new(None),
                status: StatusCell::new(),
                backoff: Mutex::new(backoff),
                last_error: Mutex::new(None),
                registry,
                cancel,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn is_bound(&self) -> bool {
        self.inner.local_addr.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status.get()
    }

    pub fn terminate(&self) {
        if self.inner.status.advance(TransportStatus::Terminating) {
            info!(name = %self.inner.config.name, "terminating listener");
            self.inner.cancel.cancel();
        }
    }

    fn set_error(&self, reason: String) {
        warn!(name = %self.inner.config.name, "{}", reason);
        *self.inner.last_error.lock() = Some(reason);
    }

    /// Looks up the server side of the configured TLS context
    fn resolve_acceptor(&self) -> std::result::Result<Option<TlsAcceptor>, String> {
        let name = match &self.inner.config.tls_context {
            Some(name) if self.inner.config.is_tls() => name,
            _ => return Ok(None),
        };
        let registry = self
            .inner
            .registry
            .upgrade()
            .ok_or_else(|| "registry dropped".to_string())?;
        match registry.tls_context(name) {
            Some(context) => match context.acceptor() {
                Some(acceptor) => Ok(Some(acceptor.clone())),
                None => Err(format!("TLS context {} has no server certificate", name)),
            },
            None => Err(format!("TLS context {} not available", name)),
        }
    }

    async fn try_bind(&self) -> Option<Process> {
        let acceptor = match self.resolve_acceptor() {
            Ok(acceptor) => acceptor,
            Err(reason) => {
                self.set_error(reason);
                return Some(Process::Sleep(self.inner.transport_config.tls_retry_interval));
            }
        };
        let addr = self.inner.config.socket_addr();
        match tcp::listen(addr, self.inner.config.backlog) {
            Ok(listener) => {
                let local = listener.local_addr().ok();
                *self.inner.socket.lock().await = Some(listener);
                *self.inner.local_addr.lock() = local;
                *self.inner.acceptor.lock() = acceptor;
                *self.inner.last_error.lock() = None;
                self.inner.backoff.lock().reset();
                self.inner.status.advance(TransportStatus::Connected);
                info!(name = %self.inner.config.name, local = ?local, protocol = %self.inner.config.protocol, "listener bound");
                None
            }
            Err(e) => {
                let delay = self.inner.backoff.lock().next();
                self.set_error(format!("bind {} failed: {}", addr, e));
                Some(Process::Sleep(delay))
            }
        }
    }

    /// One worker pass: bind if needed, then accept at most one connection
    pub async fn process(&self) -> Process {
        if self.status() >= TransportStatus::Terminating {
            self.inner.socket.lock().await.take();
            self.inner.local_addr.lock().take();
            self.inner.status.advance(TransportStatus::Terminated);
            return Process::Terminate;
        }
        if !self.is_bound() {
            if let Some(process) = self.try_bind().await {
                return process;
            }
        }

        let accepted = {
            let guard = self.inner.socket.lock().await;
            let listener = match guard.as_ref() {
                Some(listener) => listener,
                None => return Process::Continue,
            };
            timeout(self.inner.transport_config.idle_sleep, listener.accept()).await
        };
        match accepted {
            Err(_) => Process::Continue,
            Ok(Err(e)) => {
                debug!(name = %self.inner.config.name, "accept failed: {}", e);
                Process::Continue
            }
            Ok(Ok((stream, remote))) => {
                self.on_accept(stream, remote);
                Process::Continue
            }
        }
    }

    fn on_accept(&self, stream: TcpStream, remote: SocketAddr) {
        stream.set_nodelay(true).ok();
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                debug!(name = %self.inner.config.name, %remote, "dropping accepted socket: {}", e);
                return;
            }
        };
        let acceptor = self.inner.acceptor.lock().clone();
        let listener = self.clone();
        match acceptor {
            None => listener.register(StreamIo::new(stream), local, remote),
            Some(acceptor) => {
                let cancel = self.inner.cancel.clone();
                let handshake_timeout = self.inner.transport_config.connect_timeout;
                tokio::spawn(async move {
                    let handshake = timeout(handshake_timeout, tls::accept(&acceptor, stream));
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = handshake => match result {
                            Ok(Ok(io)) => listener.register(io, local, remote),
                            Ok(Err(e)) => debug!(%remote, "TLS accept failed: {}", e),
                            Err(_) => debug!(%remote, "TLS handshake timed out"),
                        }
                    }
                });
            }
        }
    }

    fn register(&self, io: StreamIo, local: SocketAddr, remote: SocketAddr) {
        let registry = match self.inner.registry.upgrade() {
            Some(registry) => registry,
            None => return,
        };
        let transport = StreamTransport::incoming(
            io,
            self.inner.config.protocol,
            local,
            remote,
            self.inner.transport_config.clone(),
            registry.sender(),
            registry.counter(),
        );
        debug!(name = %self.inner.config.name, id = transport.id(), %remote, "accepted connection");
        TransportLayerInner::add_transport(&registry, SipConnection::Stream(transport));
    }

    pub fn get_addr(&self) -> SipAddr {
        SipAddr::from_socket(
            self.inner.config.protocol,
            self.local_addr().unwrap_or_else(|| self.inner.config.socket_addr()),
        )
    }
}

#[async_trait::async_trait]
impl Worker for Listener {
    fn name(&self) -> String {
        format!("listener {}", self.inner.config.name)
    }

    async fn process(&self) -> Process {
        Listener::process(self).await
    }

    async fn finish(&self) {
        self.terminate();
        Listener::process(self).await;
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener {}", self.inner.config.protocol, self.get_addr())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
