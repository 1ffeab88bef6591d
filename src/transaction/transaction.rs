use super::key::TransactionKey;
use crate::{
    transport::{SipAddr, SipConnection},
    Result,
};
use parking_lot::Mutex;
use rsip::SipMessage;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Weak,
    },
};

/// Lifecycle reported by the transaction engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Initial request seen, nothing answered yet
    Trying,
    /// A response or in-transaction request arrived
    Process,
    /// Finished; no further events follow
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Receives the events of transactions it owns
///
/// Implementations must not block: the dispatcher calls `on_event` inline.
pub trait TransactionHandler: Send + Sync {
    /// Returns false when the handler no longer accepts events
    fn on_event(&self, event: TransactionEvent) -> bool;
}

struct TransactionInner {
    key: TransactionKey,
    role: TransactionRole,
    original: rsip::Request,
    connection: Option<SipConnection>,
    source: Option<SipAddr>,
    latest: Mutex<Option<SipMessage>>,
    code: AtomicU16,
    owner: Mutex<Option<Weak<dyn TransactionHandler>>>,
}

/// Handle on one transaction tracked by the engine
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    fn build(
        role: TransactionRole,
        original: rsip::Request,
        connection: Option<SipConnection>,
        source: Option<SipAddr>,
    ) -> Result<Self> {
        let key = TransactionKey::try_from(&original)?;
        Ok(Self {
            inner: Arc::new(TransactionInner {
                key,
                role,
                original,
                connection,
                source,
                latest: Mutex::new(None),
                code: AtomicU16::new(0),
                owner: Mutex::new(None),
            }),
        })
    }

    /// Server transaction for a request received on `connection` from `source`
    pub fn incoming(
        original: rsip::Request,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<Self> {
        Self::build(
            TransactionRole::Server,
            original,
            Some(connection),
            Some(source),
        )
    }

    pub fn outgoing(original: rsip::Request) -> Result<Self> {
        Self::build(TransactionRole::Client, original, None, None)
    }

    pub fn key(&self) -> &TransactionKey {
        &self.inner.key
    }

    pub fn role(&self) -> TransactionRole {
        self.inner.role
    }

    pub fn is_outgoing(&self) -> bool {
        self.inner.role == TransactionRole::Client
    }

    pub fn original(&self) -> &rsip::Request {
        &self.inner.original
    }

    pub fn method(&self) -> rsip::Method {
        self.inner.original.method.clone()
    }

    pub fn connection(&self) -> Option<&SipConnection> {
        self.inner.connection.as_ref()
    }

    pub fn source(&self) -> Option<&SipAddr> {
        self.inner.source.as_ref()
    }

    pub fn latest(&self) -> Option<SipMessage> {
        self.inner.latest.lock().clone()
    }

    /// Last response code; zero until one is sent or received
    pub fn code(&self) -> u16 {
        self.inner.code.load(Ordering::Acquire)
    }

    /// Records a message passing through this transaction
    pub fn update(&self, msg: SipMessage) {
        if let SipMessage::Response(resp) = &msg {
            self.inner
                .code
                .store(resp.status_code.code(), Ordering::Release);
        }
        *self.inner.latest.lock() = Some(msg);
    }

    /// True once a final response went through
    pub fn is_answered(&self) -> bool {
        self.code() >= 200
    }

    pub fn owner(&self) -> Option<Arc<dyn TransactionHandler>> {
        self.inner.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_owner(&self, owner: Weak<dyn TransactionHandler>) {
        *self.inner.owner.lock() = Some(owner);
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.inner.role, self.inner.key)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One transaction lifecycle notification
#[derive(Clone, Debug)]
pub struct TransactionEvent {
    pub state: TransactionState,
    pub transaction: Transaction,
    /// The message that caused the event, if any
    pub message: Option<SipMessage>,
    /// Response code at the time of the event
    pub code: u16,
}

impl TransactionEvent {
    pub fn new(
        state: TransactionState,
        transaction: Transaction,
        message: Option<SipMessage>,
    ) -> Self {
        if let Some(msg) = &message {
            transaction.update(msg.clone());
        }
        let code = transaction.code();
        Self {
            state,
            transaction,
            message,
            code,
        }
    }

    pub fn request(&self) -> Option<&rsip::Request> {
        match &self.message {
            Some(SipMessage::Request(req)) => Some(req),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&rsip::Response> {
        match &self.message {
            Some(SipMessage::Response(resp)) => Some(resp),
            _ => None,
        }
    }
}
