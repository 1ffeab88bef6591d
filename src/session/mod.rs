//! Call sessions
//!
//! A [`Session`] is the per-dialog state machine sitting on a
//! [`PartyBinding`](crate::transport::PartyBinding). It consumes transaction
//! events, talks to the routing bus, owns the media forwarding decision and
//! runs the re-INVITE protocol. The [`SessionRegistry`] finds sessions by
//! dialog and the [`Dispatcher`] routes engine events to their owners.
use crate::{
    config::SessionConfig,
    media::SdpCodec,
    routing::MessageBus,
    transaction::TransactionEngine,
    transport::TransportLayer,
};
use std::{fmt, sync::Arc};

pub mod dispatcher;
mod reinvite;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use dispatcher::Dispatcher;
pub use registry::SessionRegistry;
pub use session::{OutgoingCall, Reason, Session};

#[cfg(test)]
mod tests;

/// Dialog identity as seen from this side: `(call-id, local tag, remote tag)`
///
/// The remote tag is empty while an outgoing call has no answer yet.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }

    pub fn is_early(&self) -> bool {
        self.remote_tag.is_empty()
    }

    pub fn swapped(&self) -> Self {
        Self {
            call_id: self.call_id.clone(),
            local_tag: self.remote_tag.clone(),
            remote_tag: self.local_tag.clone(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Call lifecycle, moving forward only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Incoming,
    Outgoing,
    Ringing,
    Established,
    Cleared,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Incoming | SessionState::Outgoing => 0,
            SessionState::Ringing => 1,
            SessionState::Established => 2,
            SessionState::Cleared => 3,
        }
    }

    /// True if `next` is ahead of this state
    pub fn can_move_to(self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_early(self) -> bool {
        self.rank() < SessionState::Established.rank()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Incoming => write!(f, "Incoming"),
            SessionState::Outgoing => write!(f, "Outgoing"),
            SessionState::Ringing => write!(f, "Ringing"),
            SessionState::Established => write!(f, "Established"),
            SessionState::Cleared => write!(f, "Cleared"),
        }
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub transports: TransportLayer,
    pub engine: Arc<dyn TransactionEngine>,
    pub bus: Arc<dyn MessageBus>,
    pub sdp: Arc<dyn SdpCodec>,
    pub registry: SessionRegistry,
}

impl SessionContext {
    pub fn new(
        config: SessionConfig,
        transports: TransportLayer,
        engine: Arc<dyn TransactionEngine>,
        bus: Arc<dyn MessageBus>,
        sdp: Arc<dyn SdpCodec>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transports,
            engine,
            bus,
            sdp,
            registry: SessionRegistry::new(),
        }
    }
}
