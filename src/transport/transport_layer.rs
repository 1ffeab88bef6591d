use super::{
    connection::{EventCounter, TransportReceiver, TransportSender, TransportStatus},
    listener::Listener,
    stream::StreamTransport,
    tls::{TlsConfig, TlsContext},
    udp::UdpTransport,
    worker::spawn_worker,
    SipAddr, SipConnection, TransportEvent,
};
use crate::{
    config::{ListenerConfig, TransportConfig},
    Error, Result,
};
use parking_lot::Mutex;
use rsip::transport::Transport;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::mpsc::unbounded_channel, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the TLS context used by outgoing connections that name none
pub const DEFAULT_TLS_CONTEXT: &str = "default";

struct TransportEntry {
    connection: SipConnection,
    cancel: CancellationToken,
}

struct ListenerEntry {
    listener: Listener,
}

pub struct TransportLayerInner {
    config: Arc<TransportConfig>,
    cancel_token: CancellationToken,
    transports: Mutex<HashMap<String, TransportEntry>>,
    listeners: Mutex<HashMap<String, ListenerEntry>>,
    tls_contexts: Mutex<HashMap<String, TlsContext>>,
    default_id: Mutex<Option<String>>,
    sender: TransportSender,
    receiver: Mutex<Option<TransportReceiver>>,
    counter: EventCounter,
}

/// Registry of every live transport and listener
///
/// `TransportLayer` owns the transports of the process. Each registered
/// transport gets a worker task and is removed, with a
/// [`TransportEvent::Closed`] broadcast, when that worker exits. Locks are
/// held only for map mutation and lookups, never across I/O.
///
/// # Key Features
///
/// * **UDP transports** - bound lazily by their worker, rebound after errors
/// * **Listeners** - TCP/TLS listeners keyed by name, rebuilt when their config changes
/// * **Stream reuse** - outgoing TCP/TLS connections are shared per remote address
/// * **TLS contexts** - named certificate sets, hot-swapped into listeners
/// * **Events** - one receiver for every incoming message and lifecycle change
///
/// # Examples
///
/// ## Serving SIP over UDP and TCP
///
/// ```rust,no_run
/// # use rsipchan::{ListenerConfig, TransportConfig, transport::{TransportLayer, TransportEvent}};
/// # use tokio_util::sync::CancellationToken;
/// # async fn example() -> rsipchan::Result<()> {
/// let layer = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
/// let udp = layer.add_udp("default", "0.0.0.0:5060".parse()?);
/// layer.set_default(udp.id());
/// layer.set_listener(ListenerConfig::tcp("tcp", "0.0.0.0".parse()?, 5060));
///
/// let mut events = layer.events().expect("events taken once");
/// while let Some(event) = events.recv().await {
///     if let TransportEvent::Incoming(msg, connection, source) = event {
///         println!("{} from {} on {}", msg, source, connection);
///     }
/// }
/// layer.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
/// ## Connecting out over TLS
///
/// ```rust,no_run
/// # use rsipchan::{TransportConfig, transport::{TransportLayer, SipAddr, tls::TlsConfig}};
/// # use rsip::transport::Transport;
/// # use tokio_util::sync::CancellationToken;
/// # async fn example(tls: TlsConfig) -> rsipchan::Result<()> {
/// let layer = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
/// layer.set_tls_context("default", &tls)?;
/// let remote = SipAddr::from_socket(Transport::Tls, "192.0.2.10:5061".parse()?);
/// // a second call with the same remote returns the same transport
/// let stream = layer.connect_stream(&remote, None)?;
/// # Ok(())
/// # }
/// ```
///
/// # Thread Safety
///
/// `TransportLayer` is a cheap handle; clones share one registry.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(config: TransportConfig, cancel_token: CancellationToken) -> Self {
        let (sender, receiver) = unbounded_channel();
        let inner = TransportLayerInner {
            config: Arc::new(config),
            cancel_token,
            transports: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            tls_contexts: Mutex::new(HashMap::new()),
            default_id: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
            counter: EventCounter::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.inner.config
    }

    /// Event stream of all transports; can be taken once
    pub fn events(&self) -> Option<TransportReceiver> {
        self.inner.receiver.lock().take()
    }

    /// Counter of delivered incoming events the consumer has not finished
    pub fn event_counter(&self) -> EventCounter {
        self.inner.counter.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Creates a UDP transport bound (by its worker) to `addr`
    pub fn add_udp(&self, name: &str, addr: SocketAddr) -> UdpTransport {
        let transport = UdpTransport::new(
            name,
            addr,
            self.inner.config.clone(),
            self.inner.sender(),
            self.inner.counter(),
        );
        self.add_transport(SipConnection::Udp(transport.clone()));
        transport
    }

    pub fn add_transport(&self, connection: SipConnection) {
        self.inner.add_transport(connection)
    }

    /// Creates or rebuilds the listener named in `config`
    ///
    /// An existing listener with the same name is kept when its config is
    /// unchanged and replaced otherwise; connections it already accepted
    /// stay registered. Binding happens on the listener's worker, so a
    /// bind failure shows up in [`Listener::last_error`] and is retried.
    pub fn set_listener(&self, config: ListenerConfig) -> Listener {
        self.inner.set_listener(config, false)
    }

    pub fn remove_listener(&self, name: &str) -> bool {
        let entry = self.inner.listeners.lock().remove(name);
        match entry {
            Some(entry) => {
                entry.listener.terminate();
                true
            }
            None => false,
        }
    }

    pub fn listener(&self, name: &str) -> Option<Listener> {
        self.inner
            .listeners
            .lock()
            .get(name)
            .map(|entry| entry.listener.clone())
    }

    /// Installs or replaces a TLS context, rebuilding the listeners using it
    pub fn set_tls_context(&self, name: &str, config: &TlsConfig) -> Result<()> {
        let context = TlsContext::new(name, config)?;
        self.inner
            .tls_contexts
            .lock()
            .insert(name.to_string(), context);
        info!(name, "TLS context installed");
        let affected = self
            .inner
            .listeners
            .lock()
            .values()
            .filter(|entry| entry.listener.config().tls_context.as_deref() == Some(name))
            .map(|entry| entry.listener.config().clone())
            .collect::<Vec<_>>();
        for config in affected {
            self.inner.set_listener(config, true);
        }
        Ok(())
    }

    pub fn tls_context(&self, name: &str) -> Option<TlsContext> {
        self.inner.tls_context(name)
    }

    pub fn find(&self, id: &str) -> Option<SipConnection> {
        self.inner.find(id)
    }

    /// UDP transport bound to `local`, or the default/first UDP transport
    pub fn find_udp(&self, local: Option<SocketAddr>) -> Option<UdpTransport> {
        let transports = self.inner.transports.lock();
        let udp = transports
            .values()
            .filter_map(|entry| match &entry.connection {
                SipConnection::Udp(t) if t.status() < TransportStatus::Terminating => Some(t),
                _ => None,
            })
            .collect::<Vec<_>>();
        if let Some(local) = local {
            return udp
                .into_iter()
                .find(|t| t.bind_address() == local || t.local_addr() == Some(local))
                .cloned();
        }
        let default_id = self.inner.default_id.lock().clone();
        udp.iter()
            .find(|t| Some(t.id()) == default_id.as_deref())
            .or_else(|| udp.iter().min_by(|a, b| a.id().cmp(b.id())))
            .map(|t| (*t).clone())
    }

    /// Live stream transport towards `remote` over the same protocol
    pub fn find_stream(&self, remote: &SipAddr) -> Option<StreamTransport> {
        let target = remote.get_socketaddr().ok()?;
        let protocol = remote.protocol();
        self.inner
            .transports
            .lock()
            .values()
            .filter_map(|entry| match &entry.connection {
                SipConnection::Stream(t)
                    if t.status() < TransportStatus::Terminating
                        && t.protocol() == protocol
                        && t.remote_addr().same_endpoint(&target) =>
                {
                    Some(t.clone())
                }
                _ => None,
            })
            .next()
    }

    /// Reuses a stream transport towards `remote` or creates an outgoing one
    ///
    /// TLS connections use the context named `tls_context`, or
    /// [`DEFAULT_TLS_CONTEXT`]. The returned transport connects on its worker
    /// and queues messages sent before it is up.
    ///
    /// # Errors
    ///
    /// * `remote` does not resolve to a socket address
    /// * the TLS context is not installed
    /// * `remote` is not a stream protocol
    pub fn connect_stream(
        &self,
        remote: &SipAddr,
        tls_context: Option<&str>,
    ) -> Result<StreamTransport> {
        if let Some(transport) = self.find_stream(remote) {
            return Ok(transport);
        }
        remote.get_socketaddr()?;
        let connector = match remote.protocol() {
            Transport::Tls => {
                let name = tls_context.unwrap_or(DEFAULT_TLS_CONTEXT);
                let context = self.tls_context(name).ok_or_else(|| {
                    Error::TransportLayerError(
                        format!("TLS context {} not available", name),
                        remote.clone(),
                    )
                })?;
                Some(context.connector().clone())
            }
            Transport::Tcp => None,
            other => {
                return Err(Error::TransportLayerError(
                    format!("unsupported stream protocol: {}", other),
                    remote.clone(),
                ))
            }
        };
        let transport = StreamTransport::connect(
            remote.clone(),
            self.inner.config.clone(),
            self.inner.sender(),
            self.inner.counter(),
            connector,
        );
        self.add_transport(SipConnection::Stream(transport.clone()));
        Ok(transport)
    }

    pub fn default_transport(&self) -> Option<SipConnection> {
        let id = self.inner.default_id.lock().clone()?;
        self.find(&id)
    }

    pub fn set_default(&self, id: &str) -> bool {
        if self.find(id).is_none() {
            return false;
        }
        *self.inner.default_id.lock() = Some(id.to_string());
        true
    }

    /// Asks a transport to stop; its worker removes it from the registry
    pub fn terminate(&self, id: &str, reason: &str) -> bool {
        let entry = self
            .inner
            .transports
            .lock()
            .get(id)
            .map(|entry| (entry.connection.clone(), entry.cancel.clone()));
        match entry {
            Some((connection, cancel)) => {
                connection.terminate(reason);
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn transports(&self) -> Vec<SipConnection> {
        self.inner
            .transports
            .lock()
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    /// Cancels every worker and waits, bounded, for them to flush and exit
    pub async fn shutdown(&self) {
        info!("transport layer shutting down");
        self.inner.cancel_token.cancel();
        let deadline = Instant::now() + self.inner.config.shutdown_flush_timeout * 2;
        while Instant::now() < deadline {
            if self.inner.transports.lock().is_empty() && self.inner.listeners.lock().is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl TransportLayerInner {
    pub(crate) fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub(crate) fn counter(&self) -> EventCounter {
        self.counter.clone()
    }

    pub(crate) fn tls_context(&self, name: &str) -> Option<TlsContext> {
        self.tls_contexts.lock().get(name).cloned()
    }

    fn find(&self, id: &str) -> Option<SipConnection> {
        self.transports
            .lock()
            .get(id)
            .filter(|entry| entry.connection.status() < TransportStatus::Terminating)
            .map(|entry| entry.connection.clone())
    }

    pub(crate) fn add_transport(self: &Arc<Self>, connection: SipConnection) {
        let id = connection.id().to_string();
        let cancel = self.cancel_token.child_token();
        {
            let mut transports = self.transports.lock();
            if transports.contains_key(&id) {
                warn!(id = %id, "transport already registered");
                return;
            }
            transports.insert(
                id.clone(),
                TransportEntry {
                    connection: connection.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        if let SipConnection::Udp(_) = connection {
            let mut default_id = self.default_id.lock();
            if default_id.is_none() {
                *default_id = Some(id.clone());
            }
        }
        info!(id = %id, %connection, "transport registered");
        self.sender.send(TransportEvent::New(connection.clone())).ok();

        let registry: Weak<TransportLayerInner> = Arc::downgrade(self);
        spawn_worker(connection, cancel, move |connection: &SipConnection| {
            if let Some(registry) = registry.upgrade() {
                registry.remove_transport(connection);
            }
        });
    }

    fn remove_transport(&self, connection: &SipConnection) {
        let removed = self.transports.lock().remove(connection.id()).is_some();
        {
            let mut default_id = self.default_id.lock();
            if default_id.as_deref() == Some(connection.id()) {
                *default_id = None;
            }
        }
        if removed {
            debug!(id = connection.id(), "transport removed");
            self.sender
                .send(TransportEvent::Closed(connection.clone()))
                .ok();
        }
    }

    fn set_listener(self: &Arc<Self>, config: ListenerConfig, force: bool) -> Listener {
        let previous = {
            let listeners = self.listeners.lock();
            listeners.get(&config.name).map(|e| e.listener.clone())
        };
        if let Some(previous) = previous {
            if !force && previous.config() == &config {
                return previous;
            }
            info!(name = %config.name, "rebuilding listener");
            previous.terminate();
        }

        let cancel = self.cancel_token.child_token();
        let listener = Listener::new(
            config.clone(),
            self.config.clone(),
            Arc::downgrade(self),
            cancel.clone(),
        );
        self.listeners.lock().insert(
            config.name.clone(),
            ListenerEntry {
                listener: listener.clone(),
            },
        );

        let registry = Arc::downgrade(self);
        spawn_worker(listener.clone(), cancel, move |listener: &Listener| {
            if let Some(registry) = registry.upgrade() {
                let mut listeners = registry.listeners.lock();
                if listeners
                    .get(listener.name())
                    .is_some_and(|e| e.listener.instance() == listener.instance())
                {
                    listeners.remove(listener.name());
                }
            }
        });
        listener
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("transports", &self.inner.transports.lock().len())
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}
