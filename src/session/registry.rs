use super::{session::Session, DialogId};
use crate::rsip_ext::RsipMessageExt;
use parking_lot::Mutex;
use rsip::prelude::{HeadersExt, UntypedHeader};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// Maps dialog keys to live sessions
///
/// At most one session owns a key. Lookups are symmetric in the two tags,
/// so a request is matched whichever side generated it.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<DialogId, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under its current dialog key; false if taken
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let id = session.dialog_id();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            debug!(%id, "dialog key already claimed");
            return false;
        }
        info!(%id, "session registered");
        sessions.insert(id, session);
        true
    }

    /// Removes the session registered under `id`; repeated calls are no-ops
    pub fn remove(&self, id: &DialogId) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().remove(id);
        if removed.is_some() {
            info!(%id, "session removed");
        }
        removed
    }

    pub fn find(&self, call_id: &str, tag: &str, other_tag: &str) -> Option<Arc<Session>> {
        let id = DialogId::new(call_id, tag, other_tag);
        let sessions = self.sessions.lock();
        sessions
            .get(&id)
            .or_else(|| sessions.get(&id.swapped()))
            .cloned()
    }

    /// Session an in-dialog request belongs to
    pub fn find_by_request(&self, req: &rsip::Request) -> Option<Arc<Session>> {
        let call_id = req.call_id_header().ok()?.value().to_string();
        let from_tag = req.from_tag()?;
        let to_tag = req.to_tag().unwrap_or_default();
        self.find(&call_id, &to_tag, &from_tag)
    }

    /// Session of a dialog still lacking a confirmed peer, matched by
    /// call-id and one known tag
    ///
    /// Used for CANCEL and for the first tagged response of an outgoing call.
    pub fn find_early(&self, call_id: &str, tag: &str) -> Option<Arc<Session>> {
        self.find_tagged(call_id, tag, true)
    }

    /// Any session in dialog `call_id` carrying `tag` on either side
    ///
    /// A new INVITE matching one here was merged or looped back to us.
    pub fn find_by_tag(&self, call_id: &str, tag: &str) -> Option<Arc<Session>> {
        self.find_tagged(call_id, tag, false)
    }

    fn find_tagged(&self, call_id: &str, tag: &str, early_only: bool) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .find(|(id, session)| {
                id.call_id == call_id
                    && (id.local_tag == tag || id.remote_tag == tag)
                    && (!early_only || session.state().is_early())
            })
            .map(|(_, session)| session.clone())
    }

    /// Moves a session to a new key; fails only if the new key is claimed
    ///
    /// A key nobody registered moves trivially.
    pub fn rekey(&self, old: &DialogId, new: DialogId) -> bool {
        let mut sessions = self.sessions.lock();
        if old == &new {
            return true;
        }
        if sessions.contains_key(&new) {
            return false;
        }
        if let Some(session) = sessions.remove(old) {
            debug!(from = %old, to = %new, "session rekeyed");
            sessions.insert(new, session);
        }
        true
    }

    /// The session whose bus id (`sip/N`) is `id`
    pub fn find_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().values().find(|s| s.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}
