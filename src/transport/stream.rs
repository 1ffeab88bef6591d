use super::{
    codec::{self, Frame, SipCodec},
    connection::{
        EventCounter, Process, StatusCell, TransportSender, TransportStatus, KEEPALIVE_REQUEST,
        KEEPALIVE_RESPONSE,
    },
    tcp, tls, SipAddr, SipConnection, TransportEvent,
};
use crate::{config::TransportConfig, Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rsip::{transport::Transport, SipMessage};
use std::{
    collections::VecDeque,
    fmt,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::Notify,
    time::{sleep, timeout, Instant},
};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Decoder;
use tracing::{debug, info, instrument, trace, warn};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of an established byte stream
pub struct StreamIo {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl StreamIo {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    offset: usize,
    keepalive_pending: bool,
}

struct Inbound {
    codec: SipCodec,
    buffer: BytesMut,
}

#[derive(Default)]
struct Reconnect {
    attempts: u32,
    next_attempt: Option<Instant>,
}

struct StreamTransportInner {
    id: String,
    protocol: Transport,
    outgoing: bool,
    config: Arc<TransportConfig>,
    remote: SipAddr,
    local: Mutex<Option<SipAddr>>,
    reader: tokio::sync::Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    status: StatusCell,
    connected: AtomicBool,
    reconnect: Mutex<Reconnect>,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
    flow_timer: Mutex<Option<Duration>>,
    refs: AtomicUsize,
    notify: Notify,
    last_error: Mutex<Option<String>>,
    connector: Option<TlsConnector>,
    sender: TransportSender,
    counter: EventCounter,
}

/// TCP or TLS transport
///
/// An outgoing transport is created disconnected and connects from its
/// worker, reconnecting after failures until the retry budget is spent. An
/// incoming transport wraps an accepted socket and ends with it.
///
/// Callers enqueue messages with [`StreamTransport::send`]; the worker drains
/// the queue, reads and frames inbound bytes, answers keepalive probes and
/// enforces the idle interval.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamTransportInner>,
}

impl StreamTransport {
    fn build(
        protocol: Transport,
        outgoing: bool,
        remote: SipAddr,
        config: Arc<TransportConfig>,
        sender: TransportSender,
        counter: EventCounter,
        connector: Option<TlsConnector>,
    ) -> StreamTransportInner {
        let seq = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", protocol.to_string().to_lowercase(), seq);
        let now = Instant::now();
        StreamTransportInner {
            id,
            protocol,
            outgoing,
            remote,
            local: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            inbound: Mutex::new(Inbound {
                codec: SipCodec::new(config.tcp_max_packet),
                buffer: BytesMut::with_capacity(config.tcp_max_packet),
            }),
            outbound: Mutex::new(Outbound::default()),
            status: StatusCell::new(),
            connected: AtomicBool::new(false),
            reconnect: Mutex::new(Reconnect::default()),
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
            flow_timer: Mutex::new(None),
            refs: AtomicUsize::new(0),
            notify: Notify::new(),
            last_error: Mutex::new(None),
            connector,
            sender,
            counter,
            config,
        }
    }

    /// Outgoing transport towards `remote`, connected lazily by the worker
    pub fn connect(
        remote: SipAddr,
        config: Arc<TransportConfig>,
        sender: TransportSender,
        counter: EventCounter,
        connector: Option<TlsConnector>,
    ) -> Self {
        let protocol = remote.protocol();
        let inner = Self::build(protocol, true, remote, config, sender, counter, connector);
        info!(id = %inner.id, remote = %inner.remote, "created outgoing stream transport");
        StreamTransport {
            inner: Arc::new(inner),
        }
    }

    /// Transport around an accepted socket
    pub fn incoming(
        io: StreamIo,
        protocol: Transport,
        local: SocketAddr,
        remote: SocketAddr,
        config: Arc<TransportConfig>,
        sender: TransportSender,
        counter: EventCounter,
    ) -> Self {
        let remote = SipAddr::from_socket(protocol, remote);
        let mut inner = Self::build(protocol, false, remote, config, sender, counter, None);
        *inner.local.lock() = Some(SipAddr::from_socket(protocol, local));
        *inner.reader.get_mut() = Some(io.reader);
        *inner.writer.get_mut() = Some(io.writer);
        inner.connected.store(true, Ordering::Release);
        inner.status.advance(TransportStatus::Connected);
        info!(id = %inner.id, %local, remote = %inner.remote, "accepted stream transport");
        StreamTransport {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn protocol(&self) -> Transport {
        self.inner.protocol
    }

    pub fn is_outgoing(&self) -> bool {
        self.inner.outgoing
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote
    }

    pub fn local_addr(&self) -> Option<SipAddr> {
        self.inner.local.lock().clone()
    }

    /// Remote address, which identifies a stream transport
    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.remote
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn acquire(&self) -> usize {
        self.inner.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> usize {
        match self
            .inner
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn refs(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Applies a negotiated Flow-Timer value, clamped to the configured range
    pub fn set_flow_timer(&self, value: Duration) {
        let value = self.inner.config.clamp_flow_timer(value);
        debug!(id = %self.inner.id, ?value, "flow timer set");
        *self.inner.flow_timer.lock() = Some(value);
    }

    /// Keepalive interval for outgoing, idle timeout for incoming transports
    pub fn idle_interval(&self) -> Duration {
        let configured = self.inner.config.idle_interval;
        match *self.inner.flow_timer.lock() {
            Some(flow) if self.inner.outgoing => flow.max(configured),
            Some(flow) => flow,
            None => configured,
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.outbound.lock().queue.len()
    }

    #[instrument(skip(self, msg), fields(id = %self.inner.id))]
    pub fn send(&self, msg: SipMessage) -> Result<()> {
        self.enqueue_raw(codec::serialize(&msg))
    }

    pub fn enqueue_raw(&self, data: Bytes) -> Result<()> {
        if self.status() >= TransportStatus::Terminating {
            return Err(Error::TransportLayerError(
                "transport terminated".to_string(),
                self.inner.remote.clone(),
            ));
        }
        trace!(id = %self.inner.id, len = data.len(), "enqueue");
        self.inner.outbound.lock().queue.push_back(data);
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn terminate(&self, reason: &str) {
        if self.inner.status.advance(TransportStatus::Terminating) {
            info!(id = %self.inner.id, remote = %self.inner.remote, reason, "terminating stream transport");
            *self.inner.last_error.lock() = Some(reason.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// One worker pass
    pub async fn process(&self) -> Process {
        if self.status() >= TransportStatus::Terminating {
            self.close().await;
            self.inner.status.advance(TransportStatus::Terminated);
            return Process::Terminate;
        }
        if !self.is_connected() {
            if !self.inner.outgoing {
                self.terminate("connection lost");
                return Process::Continue;
            }
            return self.try_connect().await;
        }
        if let Some(process) = self.check_idle() {
            return process;
        }
        if let Err(e) = self.flush().await {
            return self.on_disconnect(&format!("write error: {}", e)).await;
        }
        self.read_once().await
    }

    async fn try_connect(&self) -> Process {
        let config = &self.inner.config;
        if let Some(at) = self.inner.reconnect.lock().next_attempt {
            let now = Instant::now();
            if now < at {
                return Process::Sleep(at - now);
            }
        }

        let result = match timeout(config.connect_timeout, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Error(format!(
                "connect timeout after {:?}",
                config.connect_timeout
            ))),
        };

        match result {
            Ok((io, local)) => {
                *self.inner.reader.lock().await = Some(io.reader);
                *self.inner.writer.lock().await = Some(io.writer);
                *self.inner.local.lock() = Some(SipAddr::from_socket(self.inner.protocol, local));
                *self.inner.reconnect.lock() = Reconnect::default();
                *self.inner.last_error.lock() = None;
                let now = Instant::now();
                *self.inner.last_rx.lock() = now;
                *self.inner.last_tx.lock() = now;
                self.inner.connected.store(true, Ordering::Release);
                self.inner.status.advance(TransportStatus::Connected);
                info!(id = %self.inner.id, %local, remote = %self.inner.remote, "stream transport connected");
                Process::Continue
            }
            Err(e) => {
                let mut reconnect = self.inner.reconnect.lock();
                reconnect.attempts += 1;
                let reason = format!(
                    "connect to {} failed ({}/{}): {}",
                    self.inner.remote, reconnect.attempts, config.connect_retries, e
                );
                warn!(id = %self.inner.id, "{}", reason);
                *self.inner.last_error.lock() = Some(reason);
                if reconnect.attempts >= config.connect_retries {
                    drop(reconnect);
                    self.terminate("connect retries exhausted");
                    return Process::Continue;
                }
                reconnect.next_attempt = Some(Instant::now() + config.connect_interval);
                Process::Sleep(config.connect_interval)
            }
        }
    }

    async fn open(&self) -> Result<(StreamIo, SocketAddr)> {
        match self.inner.protocol {
            Transport::Tls => {
                let connector = self.inner.connector.as_ref().ok_or_else(|| {
                    Error::TlsError("no TLS context for outgoing connection".to_string())
                })?;
                tls::connect(connector, &self.inner.remote).await
            }
            _ => tcp::connect(&self.inner.remote).await,
        }
    }

    fn check_idle(&self) -> Option<Process> {
        let idle = self.idle_interval();
        let now = Instant::now();
        if self.inner.outgoing {
            let last_tx = *self.inner.last_tx.lock();
            if now.duration_since(last_tx) >= idle {
                let mut outbound = self.inner.outbound.lock();
                if outbound.queue.is_empty() {
                    trace!(id = %self.inner.id, "sending keepalive probe");
                    outbound.queue.push_back(Bytes::from_static(KEEPALIVE_REQUEST));
                }
            }
            return None;
        }
        let last_activity = (*self.inner.last_rx.lock()).max(*self.inner.last_tx.lock());
        if self.refs() == 0 && now.duration_since(last_activity) >= idle {
            self.terminate("idle timeout");
            return Some(Process::Continue);
        }
        None
    }

    fn next_chunk(&self) -> Option<(Bytes, usize, bool)> {
        let mut outbound = self.inner.outbound.lock();
        if outbound.keepalive_pending && outbound.offset == 0 {
            outbound.keepalive_pending = false;
            return Some((Bytes::from_static(KEEPALIVE_RESPONSE), 0, true));
        }
        outbound
            .queue
            .front()
            .map(|data| (data.clone(), outbound.offset, false))
    }

    async fn flush(&self) -> std::io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let idle_sleep = self.inner.config.idle_sleep;
        let mut written = false;
        while let Some((chunk, offset, keepalive)) = self.next_chunk() {
            if keepalive {
                writer.write_all(&chunk).await?;
                written = true;
                continue;
            }
            let n = match timeout(idle_sleep, writer.write(&chunk[offset..])).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_transient(&e) => break,
                Ok(Err(e)) => return Err(e),
            };
            written = true;
            let mut outbound = self.inner.outbound.lock();
            outbound.offset += n;
            if outbound.offset >= chunk.len() {
                outbound.queue.pop_front();
                outbound.offset = 0;
            }
        }
        if written {
            writer.flush().await?;
            *self.inner.last_tx.lock() = Instant::now();
        }
        Ok(())
    }

    async fn read_once(&self) -> Process {
        let mut buf = vec![0u8; self.inner.config.tcp_max_packet];
        let result = {
            let mut guard = self.inner.reader.lock().await;
            let reader = match guard.as_mut() {
                Some(reader) => reader,
                None => return Process::Continue,
            };
            select! {
                r = reader.read(&mut buf) => r,
                _ = self.inner.notify.notified() => return Process::Continue,
                _ = sleep(self.inner.config.idle_sleep) => return Process::Continue,
            }
        };
        match result {
            Ok(0) => self.on_disconnect("connection closed by peer").await,
            Ok(n) => {
                *self.inner.last_rx.lock() = Instant::now();
                self.on_data(&buf[..n]).await
            }
            Err(e) if is_transient(&e) => Process::Continue,
            Err(e) => self.on_disconnect(&format!("read error: {}", e)).await,
        }
    }

    async fn on_data(&self, data: &[u8]) -> Process {
        let mut frames = Vec::new();
        let framing = {
            let mut inbound = self.inner.inbound.lock();
            let Inbound { codec, buffer } = &mut *inbound;
            buffer.extend_from_slice(data);
            loop {
                match codec.decode(buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        for frame in frames {
            match frame {
                Frame::KeepaliveRequest => {
                    trace!(id = %self.inner.id, "keepalive probe received");
                    self.inner.outbound.lock().keepalive_pending = true;
                    self.inner.notify.notify_one();
                }
                Frame::Message(msg) => {
                    if !self.deliver(msg) {
                        self.terminate("event channel closed");
                        return Process::Continue;
                    }
                }
            }
        }

        match framing {
            Ok(()) => Process::Continue,
            // an outgoing connection is reopened, the oversized data is lost with it
            Err(e) if e.is_overflow() => {
                warn!(id = %self.inner.id, remote = %self.inner.remote, "peer exceeded the packet limit: {}", e);
                self.on_disconnect(&e.to_string()).await
            }
            Err(e) => {
                warn!(id = %self.inner.id, remote = %self.inner.remote, "framing error: {}", e);
                self.terminate(&e.to_string());
                Process::Continue
            }
        }
    }

    fn deliver(&self, msg: SipMessage) -> bool {
        let msg = match self.inner.remote.get_socketaddr() {
            Ok(addr) => match SipConnection::update_msg_received(msg, addr) {
                Ok(msg) => msg,
                Err(e) => {
                    info!(id = %self.inner.id, "invalid Via header: {}", e);
                    return true;
                }
            },
            Err(_) => msg,
        };
        debug!(id = %self.inner.id, remote = %self.inner.remote, "received message");
        self.inner.counter.inc();
        let event = TransportEvent::Incoming(
            msg,
            SipConnection::Stream(self.clone()),
            self.inner.remote.clone(),
        );
        if self.inner.sender.send(event).is_err() {
            self.inner.counter.done();
            return false;
        }
        true
    }

    async fn on_disconnect(&self, reason: &str) -> Process {
        self.inner.reader.lock().await.take();
        self.inner.writer.lock().await.take();
        self.inner.connected.store(false, Ordering::Release);
        {
            let mut inbound = self.inner.inbound.lock();
            inbound.buffer.clear();
            inbound.codec = SipCodec::new(self.inner.config.tcp_max_packet);
        }
        {
            let mut outbound = self.inner.outbound.lock();
            outbound.offset = 0;
            outbound.keepalive_pending = false;
        }
        *self.inner.last_error.lock() = Some(reason.to_string());
        if self.inner.outgoing && self.status() < TransportStatus::Terminating {
            warn!(id = %self.inner.id, remote = %self.inner.remote, reason, "connection lost, reconnecting");
            return Process::Continue;
        }
        self.terminate(reason);
        Process::Continue
    }

    async fn close(&self) {
        self.inner.reader.lock().await.take();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Best-effort write of everything still queued, bounded in time
    pub async fn shutdown_flush(&self) {
        let limit = self.inner.config.shutdown_flush_timeout;
        let pending = {
            let mut outbound = self.inner.outbound.lock();
            let offset = std::mem::take(&mut outbound.offset);
            let mut data = outbound.queue.drain(..).collect::<Vec<_>>();
            if let Some(first) = data.first_mut() {
                *first = first.slice(offset.min(first.len())..);
            }
            data
        };
        if pending.is_empty() {
            return;
        }
        let mut guard = self.inner.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let flushed = timeout(limit, async {
                for data in pending.iter() {
                    writer.write_all(data).await?;
                }
                writer.flush().await
            })
            .await;
            match flushed {
                Ok(Ok(())) => debug!(id = %self.inner.id, "flushed queue on shutdown"),
                Ok(Err(e)) => debug!(id = %self.inner.id, "flush on shutdown failed: {}", e),
                Err(_) => debug!(id = %self.inner.id, "flush on shutdown timed out"),
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

impl fmt::Display for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Some(local) => write!(
                f,
                "{} {} -> {}",
                self.inner.protocol, local.addr, self.inner.remote.addr
            ),
            None => write!(f, "{} * -> {}", self.inner.protocol, self.inner.remote.addr),
        }
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inner.id, self)
    }
}

impl Drop for StreamTransportInner {
    fn drop(&mut self) {
        debug!(id = %self.id, remote = %self.remote, "dropping stream transport");
    }
}
