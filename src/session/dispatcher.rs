use super::{session::Session, SessionContext};
use crate::{
    routing::BusMessage,
    rsip_ext::RsipMessageExt,
    transaction::{
        make_tag, message::make_response, Transaction, TransactionEvent, TransactionHandler,
        TransactionState,
    },
};
use parking_lot::Mutex;
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Method,
};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::{select, sync::mpsc::UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes transaction events from the engine to their owners
///
/// Events of an owned transaction go straight to the owner. A new
/// dialog-creating INVITE spawns a [`Session`]; in-dialog requests and
/// CANCEL are matched against the [`SessionRegistry`](super::SessionRegistry);
/// anything else goes to the handler registered for its method.
pub struct Dispatcher {
    ctx: SessionContext,
    handlers: Mutex<HashMap<String, Weak<dyn TransactionHandler>>>,
}

impl Dispatcher {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Out-of-dialog requests with `method` go to `handler` while it lives
    pub fn register_handler(&self, method: Method, handler: Weak<dyn TransactionHandler>) {
        self.handlers.lock().insert(method.to_string(), handler);
    }

    fn handler(&self, method: &Method) -> Option<(Weak<dyn TransactionHandler>, Arc<dyn TransactionHandler>)> {
        let mut handlers = self.handlers.lock();
        let key = method.to_string();
        let weak = handlers.get(&key)?.clone();
        match weak.upgrade() {
            Some(handler) => Some((weak, handler)),
            None => {
                handlers.remove(&key);
                None
            }
        }
    }

    /// Delivers one event; false when nobody took it
    pub async fn dispatch(&self, event: TransactionEvent) -> bool {
        let tx = event.transaction.clone();
        if let Some(owner) = tx.owner() {
            return owner.on_event(event);
        }
        if tx.is_outgoing() {
            debug!(transaction = %tx, "event for an unowned client transaction");
            return false;
        }
        if event.state != TransactionState::Trying {
            return false;
        }

        let req = tx.original();
        let method = req.method.clone();
        if method == Method::Invite && req.to_tag().is_none() {
            return self.new_session(event).await;
        }
        if method == Method::Cancel {
            let session = req
                .call_id_header()
                .ok()
                .map(|call_id| call_id.value().to_string())
                .zip(req.from_tag())
                .and_then(|(call_id, tag)| self.ctx.registry.find_early(&call_id, &tag));
            return match session {
                Some(session) => Self::claim(&session, event),
                None => {
                    self.reply(&tx, 481).await;
                    false
                }
            };
        }
        if req.to_tag().is_some() {
            return match self.ctx.registry.find_by_request(req) {
                Some(session) => Self::claim(&session, event),
                None if method == Method::Ack => false,
                None => {
                    debug!(transaction = %tx, "no dialog for request");
                    self.reply(&tx, 481).await;
                    false
                }
            };
        }
        if let Some((weak, handler)) = self.handler(&method) {
            tx.set_owner(weak);
            return handler.on_event(event);
        }
        match method {
            Method::Ack => false,
            Method::Options => {
                self.reply(&tx, 200).await;
                true
            }
            _ => {
                self.reply(&tx, 501).await;
                false
            }
        }
    }

    async fn new_session(&self, event: TransactionEvent) -> bool {
        let tx = event.transaction.clone();
        let req = tx.original();
        let existing = req
            .call_id_header()
            .ok()
            .map(|call_id| call_id.value().to_string())
            .zip(req.from_tag())
            .and_then(|(call_id, tag)| self.ctx.registry.find_by_tag(&call_id, &tag));
        if let Some(existing) = existing {
            warn!(transaction = %tx, dialog = %existing.dialog_id(), "merged or looped INVITE");
            self.reply(&tx, 482).await;
            return false;
        }
        let session = match Session::incoming(&self.ctx, &tx) {
            Ok(session) => session,
            Err(e) => {
                warn!(transaction = %tx, "cannot create session: {}", e);
                self.reply(&tx, 400).await;
                return false;
            }
        };
        if !self.ctx.registry.insert(session.clone()) {
            warn!(dialog = %session.dialog_id(), "dialog already exists");
            self.reply(&tx, 482).await;
            return false;
        }
        Self::claim(&session, event)
    }

    fn claim(session: &Arc<Session>, event: TransactionEvent) -> bool {
        let weak: Weak<Session> = Arc::downgrade(session);
        let owner: Weak<dyn TransactionHandler> = weak;
        event.transaction.set_owner(owner);
        session.post(event)
    }

    async fn reply(&self, tx: &Transaction, code: u16) {
        let tag = make_tag().to_string();
        let resp = make_response(
            tx.original(),
            code.into(),
            Some(&tag),
            None,
            &self.ctx.config.user_agent,
        );
        tx.update(resp.clone().into());
        if let Err(e) = self.ctx.engine.respond(tx, resp).await {
            warn!(transaction = %tx, code, "failed to respond: {}", e);
        }
    }

    /// Hands a `call.update` record to the session named by its `id` param
    pub async fn on_update(&self, msg: &BusMessage) -> crate::Result<bool> {
        let id = msg.param("id").unwrap_or_default();
        match self.ctx.registry.find_by_id(id) {
            Some(session) => session.on_update(msg).await,
            None => {
                debug!(id, "media update for unknown session");
                Ok(false)
            }
        }
    }

    /// Dispatches events from `receiver` until it closes or `cancel_token` fires
    pub async fn serve(
        &self,
        mut receiver: UnboundedReceiver<TransactionEvent>,
        cancel_token: CancellationToken,
    ) {
        let process = async {
            while let Some(event) = receiver.recv().await {
                self.dispatch(event).await;
            }
        };
        select! {
            _ = cancel_token.cancelled() => {
                info!("dispatcher cancelled");
            }
            _ = process => {}
        }
        info!(sessions = self.ctx.registry.len(), "dispatcher stopped");
    }
}
