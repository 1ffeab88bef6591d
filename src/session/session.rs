use super::{reinvite::Secondary, DialogId, SessionContext, SessionState};
use crate::{
    config::ForwardPolicy,
    media::{decide_media_mode, detect_nat, nat::apply_nat, MediaDescription, MediaMode},
    routing::{self, code_to_error, error_to_code, BusMessage},
    rsip_ext::{RsipMessageExt, RsipResponseExt},
    transaction::{
        make_call_id, make_tag,
        message::{make_ack, make_request, make_response, make_via},
        Transaction, TransactionEvent, TransactionHandler, TransactionState,
    },
    transport::{BindingParams, PartyBinding, SipAddr},
    Error, Result,
};
use parking_lot::Mutex;
use rsip::{
    headers::{Allow, ContentType, Route},
    host_with_port::Host,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, SipMessage,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, INFO, MESSAGE, REFER";

static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Why a session ended
///
/// `code` is the SIP status that ended the call, or 0 for a normal hangup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub code: u16,
    pub text: String,
}

impl Reason {
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
        }
    }

    pub fn from_error(error: &str) -> Self {
        let (code, text) = error_to_code(error);
        Self::new(code, text)
    }

    /// Routing error name, `None` for a normal hangup
    pub fn error(&self) -> Option<&'static str> {
        (self.code >= 300).then(|| code_to_error(self.code))
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// What a new outgoing call leg needs
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub target: rsip::Uri,
    pub caller: rsip::Uri,
    pub binding: BindingParams,
    pub media: Option<MediaDescription>,
    /// The media belongs to the peer leg and should flow to it directly
    pub forward: bool,
    pub peer_id: Option<String>,
    /// Retransmission limit for the INVITE, engine default when `None`
    pub retries: Option<u32>,
}

impl OutgoingCall {
    pub fn new(target: rsip::Uri, caller: rsip::Uri, binding: BindingParams) -> Self {
        Self {
            target,
            caller,
            binding,
            media: None,
            forward: false,
            peer_id: None,
            retries: None,
        }
    }

    pub fn with_media(mut self, media: MediaDescription, forward: bool) -> Self {
        self.media = Some(media);
        self.forward = forward;
        self
    }

    pub fn with_peer(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(peer_id.to_string());
        self
    }

    /// Gives up on the callee after `retries` INVITE retransmissions
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

pub(super) struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_uri: rsip::Uri,
    pub remote_uri: rsip::Uri,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub remote_target: rsip::Uri,
    pub route_set: Vec<Header>,
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        DialogId::new(
            &self.call_id,
            &self.local_tag,
            self.remote_tag.as_deref().unwrap_or_default(),
        )
    }

    /// Next request inside this dialog; ACK reuses the current CSeq
    pub fn make_request(
        &mut self,
        method: Method,
        via: rsip::typed::Via,
        user_agent: &str,
    ) -> rsip::Request {
        if method != Method::Ack {
            self.local_cseq += 1;
        }
        let from = rsip::typed::From {
            display_name: None,
            uri: self.local_uri.clone(),
            params: vec![rsip::Param::Tag(rsip::param::Tag::new(
                self.local_tag.clone(),
            ))],
        };
        let to = rsip::typed::To {
            display_name: None,
            uri: self.remote_uri.clone(),
            params: self
                .remote_tag
                .iter()
                .map(|tag| rsip::Param::Tag(rsip::param::Tag::new(tag.clone())))
                .collect(),
        };
        let mut req = make_request(
            method,
            self.remote_target.clone(),
            via,
            from,
            to,
            &self.call_id,
            self.local_cseq,
            user_agent,
        );
        req.headers.extend(self.route_set.clone());
        req
    }
}

pub(super) struct SessionInner {
    pub state: SessionState,
    pub dialog: Dialog,
    /// The INVITE transaction that created the dialog
    pub primary: Option<Transaction>,
    pub secondary: Option<Secondary>,
    pub routed: bool,
    pub media_mode: MediaMode,
    pub remote_media: Option<MediaDescription>,
    pub local_media: Option<MediaDescription>,
    /// Last working remote media, kept while a proxied update is pending
    pub revert: Option<MediaDescription>,
    pub behind_nat: bool,
    pub reason: Option<Reason>,
    pub last_error: Option<String>,
    pub peer_id: Option<String>,
}

impl SessionInner {
    fn new(state: SessionState, dialog: Dialog, primary: Option<Transaction>) -> Self {
        Self {
            state,
            dialog,
            primary,
            secondary: None,
            routed: false,
            media_mode: MediaMode::Unknown,
            remote_media: None,
            local_media: None,
            revert: None,
            behind_nat: false,
            reason: None,
            last_error: None,
            peer_id: None,
        }
    }

    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_move_to(next) {
            return false;
        }
        debug!(dialog = %self.dialog.id(), from = %self.state, to = %next, "session state changed");
        self.state = next;
        true
    }
}

/// One call leg: a SIP dialog bound to a transport
///
/// A `Session` pairs one INVITE dialog with the [`PartyBinding`] it sends
/// through and with the routing bus that connects it to the peer leg. It is
/// created by the [`Dispatcher`](super::Dispatcher) for an incoming INVITE,
/// or by [`Session::outgoing`] for a call placed on behalf of the peer leg.
///
/// # Call Lifecycle
///
/// 1. **Incoming/Outgoing** - the dialog-creating INVITE is pending
/// 2. **Ringing** - a provisional response with a To tag was sent or received
/// 3. **Established** - the INVITE was answered with 2xx
/// 4. **Cleared** - final; the session leaves the registry and posts `chan.hangup`
///
/// While established, at most one re-INVITE is in progress in either
/// direction. A second one is refused with 491.
///
/// # Examples
///
/// ## Answering an incoming call
///
/// ```rust,no_run
/// # use rsipchan::{session::Session, media::{MediaDescription, MediaStream}};
/// # async fn example(session: &Session) -> rsipchan::Result<()> {
/// let media = MediaDescription::new("192.0.2.1", vec![MediaStream::new("audio", 20000, &["0", "8"])]);
/// session.ringing(None).await?;
/// session.answer(Some(media)).await?;
/// // later, from this side
/// session.hangup(None).await;
/// # Ok(())
/// # }
/// ```
///
/// ## Placing a call
///
/// ```rust,no_run
/// # use rsipchan::{session::{OutgoingCall, Session, SessionContext}, transport::BindingParams};
/// # use rsip::transport::Transport;
/// # async fn example(ctx: SessionContext) -> rsipchan::Result<()> {
/// let binding = BindingParams::new(Transport::Udp, "192.0.2.10:5060".parse()?);
/// let call = OutgoingCall::new(
///     rsip::Uri::try_from("sip:bob@192.0.2.10")?,
///     rsip::Uri::try_from("sip:alice@192.0.2.1")?,
///     binding,
/// )
/// .with_peer("chan/7")
/// .with_retries(3);
/// let session = Session::outgoing(&ctx, call).await?;
/// println!("calling as {}", session.id());
/// # Ok(())
/// # }
/// ```
///
/// # Thread Safety
///
/// Transaction events are queued through [`Session::post`] and handled one at
/// a time by the session's own task, so a session never sees two events
/// concurrently. The state lock is never held across an await.
pub struct Session {
    id: String,
    me: Weak<Session>,
    pub(super) ctx: SessionContext,
    outgoing: bool,
    pub(super) binding: Arc<PartyBinding>,
    pub(super) inner: Mutex<SessionInner>,
    events: UnboundedSender<TransactionEvent>,
}

impl Session {
    fn create(
        ctx: &SessionContext,
        outgoing: bool,
        binding: Arc<PartyBinding>,
        inner: SessionInner,
    ) -> Arc<Self> {
        let (events, receiver) = unbounded_channel();
        let session = Arc::new_cyclic(|me| Session {
            id: format!("sip/{}", SESSION_SEQ.fetch_add(1, Ordering::Relaxed)),
            me: me.clone(),
            ctx: ctx.clone(),
            outgoing,
            binding,
            inner: Mutex::new(inner),
            events,
        });
        Self::serve_events(Arc::downgrade(&session), receiver);
        session
    }

    fn serve_events(me: Weak<Session>, mut receiver: UnboundedReceiver<TransactionEvent>) {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(session) = me.upgrade() else {
                    break;
                };
                session.handle_event(event).await;
            }
        });
    }

    /// Session for a dialog-creating INVITE received in `tx`
    pub fn incoming(ctx: &SessionContext, tx: &Transaction) -> Result<Arc<Session>> {
        let req = tx.original();
        if req.method != Method::Invite {
            return Err(Error::SessionError(
                format!("{} cannot start a session", req.method),
                DialogId::default(),
            ));
        }
        let call_id = req.call_id_header()?.value().to_string();
        let remote_tag = req.from_tag().ok_or_else(|| {
            Error::SessionError("missing From tag".to_string(), DialogId::new(&call_id, "", ""))
        })?;
        let connection = tx.connection().cloned().ok_or_else(|| {
            Error::SessionError(
                "request without a connection".to_string(),
                DialogId::new(&call_id, "", &remote_tag),
            )
        })?;
        let source = tx.source().cloned().unwrap_or_else(|| connection.get_addr());
        let remote_uri = req.from_header()?.typed()?.uri;
        let local_uri = req.to_header()?.typed()?.uri;
        let remote_target = req.contact_uri().unwrap_or_else(|_| remote_uri.clone());
        let remote_cseq = req.cseq_header()?.seq()?;

        let binding = Arc::new(PartyBinding::from_connection(
            ctx.transports.clone(),
            connection,
            source.clone(),
            ctx.config.address_change,
        ));
        let dialog = Dialog {
            call_id,
            local_tag: make_tag().to_string(),
            remote_tag: Some(remote_tag),
            local_uri,
            remote_uri,
            local_cseq: 0,
            remote_cseq,
            remote_target,
            route_set: route_set(&req.headers, false),
        };
        let (remote_media, behind_nat) = inspect_media(ctx, &req.body, Some(&source));
        let mut inner = SessionInner::new(SessionState::Incoming, dialog, Some(tx.clone()));
        inner.remote_media = remote_media;
        inner.behind_nat = behind_nat;

        let session = Self::create(ctx, false, binding, inner);
        info!(id = %session.id, dialog = %session.dialog_id(), from = %source, "incoming session");
        Ok(session)
    }

    /// Starts an outgoing call and registers it under its early dialog key
    pub async fn outgoing(ctx: &SessionContext, call: OutgoingCall) -> Result<Arc<Session>> {
        let binding = Arc::new(PartyBinding::new(
            ctx.transports.clone(),
            call.binding.clone(),
            ctx.config.address_change,
        ));
        if !binding.bind(false) {
            return Err(Error::TransportLayerError(
                binding.last_error().unwrap_or_default(),
                binding.remote().unwrap_or_default(),
            ));
        }
        let local = binding
            .transport()
            .and_then(|t| t.local_addr())
            .ok_or_else(|| {
                Error::TransportLayerError(
                    "no local address".to_string(),
                    binding.remote().unwrap_or_default(),
                )
            })?;
        let domain = local.addr.host.to_string();
        let dialog = Dialog {
            call_id: make_call_id(Some(&domain)),
            local_tag: make_tag().to_string(),
            remote_tag: None,
            local_uri: call.caller,
            remote_uri: call.target.clone(),
            local_cseq: 0,
            remote_cseq: 0,
            remote_target: call.target,
            route_set: vec![],
        };
        let mut inner = SessionInner::new(SessionState::Outgoing, dialog, None);
        inner.media_mode = match (&call.media, call.forward) {
            (None, _) => MediaMode::Unknown,
            (Some(_), true) if ctx.config.forward_policy != ForwardPolicy::Never => {
                MediaMode::Forwarded
            }
            _ => MediaMode::Proxied,
        };
        inner.local_media = call.media.clone();
        inner.peer_id = call.peer_id;

        let session = Self::create(ctx, true, binding, inner);
        if !ctx.registry.insert(session.clone()) {
            return Err(Error::SessionError(
                "dialog key already claimed".to_string(),
                session.dialog_id(),
            ));
        }
        let started = async {
            let request = session.dialog_request(Method::Invite, call.media.as_ref())?;
            ctx.engine
                .submit(request, session.binding.clone(), session.owner())
                .await
        }
        .await;
        match started {
            Ok(tx) => {
                if let Some(retries) = call.retries {
                    ctx.engine.set_max_retries(&tx, retries);
                }
                let mut inner = session.inner.lock();
                if inner.primary.is_none() {
                    inner.primary = Some(tx);
                }
            }
            Err(e) => {
                ctx.registry.remove(&session.dialog_id());
                session.inner.lock().advance(SessionState::Cleared);
                return Err(e);
            }
        }
        info!(id = %session.id, dialog = %session.dialog_id(), remote = ?session.binding.remote(), "outgoing session");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn media_mode(&self) -> MediaMode {
        self.inner.lock().media_mode
    }

    pub fn reason(&self) -> Option<Reason> {
        self.inner.lock().reason.clone()
    }

    pub fn dialog_id(&self) -> DialogId {
        self.inner.lock().dialog.id()
    }

    pub fn remote_media(&self) -> Option<MediaDescription> {
        self.inner.lock().remote_media.clone()
    }

    pub fn local_media(&self) -> Option<MediaDescription> {
        self.inner.lock().local_media.clone()
    }

    /// True once the peer was seen announcing a private media address from
    /// a public one
    pub fn behind_nat(&self) -> bool {
        self.inner.lock().behind_nat
    }

    pub fn peer_id(&self) -> Option<String> {
        self.inner.lock().peer_id.clone()
    }

    /// Human-readable cause of the last failed operation
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn binding(&self) -> &Arc<PartyBinding> {
        &self.binding
    }

    pub(super) fn set_last_error(&self, error: String) {
        self.inner.lock().last_error = Some(error);
    }

    pub(super) fn owner(&self) -> Weak<dyn TransactionHandler> {
        self.me.clone()
    }

    /// Queues an event for this session's task; false once the session is gone
    pub fn post(&self, event: TransactionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub async fn handle_event(&self, event: TransactionEvent) {
        if event.transaction.is_outgoing() {
            self.on_client_event(event).await
        } else {
            self.on_server_event(event).await
        }
    }

    pub async fn ringing(&self, media: Option<MediaDescription>) -> Result<()> {
        self.provisional(180, media).await
    }

    pub async fn progress(&self, media: Option<MediaDescription>) -> Result<()> {
        self.provisional(183, media).await
    }

    async fn provisional(&self, code: u16, media: Option<MediaDescription>) -> Result<()> {
        let tx = self.pending_primary()?;
        let contact = self.contact();
        self.respond(&tx, code, media.as_ref(), contact.into_iter().collect())
            .await;
        let mut inner = self.inner.lock();
        if media.is_some() {
            inner.local_media = media;
        }
        inner.advance(SessionState::Ringing);
        Ok(())
    }

    /// Accepts an incoming call; without `media` the last local media is used
    pub async fn answer(&self, media: Option<MediaDescription>) -> Result<()> {
        let tx = self.pending_primary()?;
        let media = media.or_else(|| self.local_media());
        let contact = self.contact();
        if !self
            .respond(&tx, 200, media.as_ref(), contact.into_iter().collect())
            .await
        {
            return Err(Error::SessionError(
                "failed to send the answer".to_string(),
                self.dialog_id(),
            ));
        }
        let mut inner = self.inner.lock();
        inner.local_media = media;
        inner.advance(SessionState::Established);
        info!(id = %self.id, dialog = %inner.dialog.id(), "call answered");
        Ok(())
    }

    /// Refuses an unanswered incoming call and clears the session
    ///
    /// Codes outside 300..700 are replaced by 500. Without `text` the
    /// reason phrase follows from the code.
    pub async fn reject(&self, code: u16, text: Option<&str>) -> Result<()> {
        let tx = self.pending_primary()?;
        let code = if (300..700).contains(&code) { code } else { 500 };
        let reason = match text {
            Some(text) => Reason::new(code, text),
            None => Reason::new(code, error_to_code(code_to_error(code)).1),
        };
        self.respond(&tx, code, None, vec![]).await;
        self.finish(reason).await;
        Ok(())
    }

    /// Ends the call from this side in whatever way its state requires
    ///
    /// An established call is ended with BYE, an unanswered incoming one
    /// with a final response mapped from `error`, and an outgoing one still
    /// ringing with CANCEL. Calling it on a cleared session does nothing.
    pub async fn hangup(&self, error: Option<&str>) {
        match self.state() {
            SessionState::Cleared => {}
            SessionState::Established => {
                self.send_bye().await;
                let reason = error
                    .map(Reason::from_error)
                    .unwrap_or_else(|| Reason::new(0, "hangup"));
                self.finish(reason).await;
            }
            _ => {
                self.finish(Reason::from_error(error.unwrap_or("cancelled")))
                    .await
            }
        }
    }

    fn pending_primary(&self) -> Result<Transaction> {
        let inner = self.inner.lock();
        if self.outgoing || !inner.state.is_early() {
            return Err(Error::SessionError(
                format!("cannot answer in state {}", inner.state),
                inner.dialog.id(),
            ));
        }
        inner
            .primary
            .clone()
            .filter(|tx| !tx.is_answered())
            .ok_or_else(|| {
                Error::SessionError("no pending INVITE".to_string(), inner.dialog.id())
            })
    }

    pub(super) async fn finish(&self, reason: Reason) {
        let (id, primary, secondary) = {
            let mut inner = self.inner.lock();
            if !inner.advance(SessionState::Cleared) {
                return;
            }
            if inner.reason.is_none() {
                inner.reason = Some(reason.clone());
            }
            (inner.dialog.id(), inner.primary.clone(), inner.secondary.take())
        };
        info!(id = %self.id, dialog = %id, %reason, "session cleared");

        if let Some(primary) = primary.filter(|tx| !tx.is_answered()) {
            if primary.is_outgoing() {
                if let Err(e) = self.ctx.engine.cancel(&primary).await {
                    debug!(id = %self.id, "cancel failed: {}", e);
                }
            } else {
                let code = if reason.code >= 300 { reason.code } else { 487 };
                self.respond(&primary, code, None, vec![]).await;
            }
        }
        if let Some(secondary) = secondary {
            self.drop_secondary(secondary).await;
        }
        self.ctx.registry.remove(&id);

        let mut msg = self
            .bus_message(routing::CHAN_HANGUP)
            .with_param("reason", &reason.text);
        if let Some(error) = reason.error() {
            msg.set_param("error", error);
            msg.set_param("code", reason.code);
        }
        self.ctx.bus.enqueue(msg);
    }

    /// Routing record describing this call
    pub(super) fn bus_message(&self, name: &str) -> BusMessage {
        let inner = self.inner.lock();
        let (caller, called) = if self.outgoing {
            (&inner.dialog.local_uri, &inner.dialog.remote_uri)
        } else {
            (&inner.dialog.remote_uri, &inner.dialog.local_uri)
        };
        let mut msg = BusMessage::new(name)
            .with_param("id", &self.id)
            .with_param("callid", &inner.dialog.call_id)
            .with_param("caller", caller)
            .with_param("called", called)
            .with_param(
                "direction",
                if self.outgoing { "outgoing" } else { "incoming" },
            );
        if let Some(remote) = self.binding.remote() {
            msg.set_param("address", remote.addr);
        }
        if let Some(peer) = &inner.peer_id {
            msg.set_param("peerid", peer);
        }
        if inner.behind_nat {
            msg.set_param("nat", "yes");
        }
        if let Some(media) = &inner.remote_media {
            media.to_params(&mut msg.params);
        }
        msg
    }

    /// Sends a response in `tx`, recording it on the transaction
    pub(super) async fn respond(
        &self,
        tx: &Transaction,
        code: u16,
        media: Option<&MediaDescription>,
        extra: Vec<Header>,
    ) -> bool {
        let body = media.map(|m| self.ctx.sdp.build(m));
        let has_body = body.is_some();
        let local_tag = self.inner.lock().dialog.local_tag.clone();
        let mut resp = make_response(
            tx.original(),
            code.into(),
            Some(&local_tag),
            body,
            &self.ctx.config.user_agent,
        );
        if has_body {
            resp.headers
                .push(ContentType::new("application/sdp").into());
        }
        resp.headers.extend(extra);
        tx.update(SipMessage::Response(resp.clone()));
        match self.ctx.engine.respond(tx, resp).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %self.id, code, "failed to send response: {}", e);
                false
            }
        }
    }

    /// Contact pointing at the local end of the binding
    pub(super) fn contact(&self) -> Option<Header> {
        let local = self.binding.transport()?.local_addr()?;
        let mut uri = rsip::Uri::from(&local);
        uri.auth = self.inner.lock().dialog.local_uri.auth.clone();
        let contact = rsip::typed::Contact {
            display_name: None,
            uri,
            params: vec![],
        };
        Some(Header::Contact(contact.into()))
    }

    fn local_via(&self) -> Result<rsip::typed::Via> {
        let remote = || self.binding.remote().unwrap_or_default();
        if !self.binding.bind(false) {
            return Err(Error::TransportLayerError(
                self.binding.last_error().unwrap_or_default(),
                remote(),
            ));
        }
        let local = self
            .binding
            .transport()
            .and_then(|t| t.local_addr())
            .ok_or_else(|| Error::TransportLayerError("no local address".to_string(), remote()))?;
        Ok(make_via(&local))
    }

    /// Builds the next in-dialog request, with an SDP body for `media`
    pub(super) fn dialog_request(
        &self,
        method: Method,
        media: Option<&MediaDescription>,
    ) -> Result<rsip::Request> {
        let via = self.local_via()?;
        let contact = if method == Method::Invite {
            self.contact()
        } else {
            None
        };
        let mut req =
            self.inner
                .lock()
                .dialog
                .make_request(method, via, &self.ctx.config.user_agent);
        if let Some(contact) = contact {
            req.headers.push(contact);
        }
        if let Some(media) = media {
            let body = self.ctx.sdp.build(media);
            req.headers.push(ContentType::new("application/sdp").into());
            req.headers
                .push(Header::ContentLength((body.len() as u32).into()));
            req.body = body;
        }
        Ok(req)
    }

    pub(super) async fn send_bye(&self) {
        let request = match self.dialog_request(Method::Bye, None) {
            Ok(request) => request,
            Err(e) => {
                warn!(id = %self.id, "cannot build BYE: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .ctx
            .engine
            .submit(request, self.binding.clone(), self.owner())
            .await
        {
            warn!(id = %self.id, "failed to send BYE: {}", e);
        }
    }

    pub(super) async fn send_ack(&self, resp: &rsip::Response) {
        let ack = match make_ack(resp, &self.ctx.config.user_agent) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(id = %self.id, "cannot build ACK: {}", e);
                return;
            }
        };
        if let Err(e) = self.binding.send(ack.into()).await {
            warn!(id = %self.id, "failed to send ACK: {}", e);
        }
    }

    /// Parses an SDP body seen from the bound remote, applying NAT rules
    pub(super) fn observe_media(&self, body: &[u8]) -> Option<MediaDescription> {
        let remote = self.binding.remote();
        let (media, nat) = inspect_media(&self.ctx, body, remote.as_ref());
        if nat {
            self.inner.lock().behind_nat = true;
        }
        media
    }

    async fn on_server_event(&self, event: TransactionEvent) {
        let tx = event.transaction.clone();
        let is_primary = self.inner.lock().primary.as_ref() == Some(&tx);
        if is_primary {
            match event.state {
                TransactionState::Trying => {
                    let route = {
                        let mut inner = self.inner.lock();
                        let route = inner.state == SessionState::Incoming && !inner.routed;
                        inner.routed = true;
                        route
                    };
                    if route {
                        self.route(&tx).await;
                    }
                }
                TransactionState::Process => {}
                TransactionState::Cleared => {
                    self.inner.lock().primary = None;
                    if !tx.is_answered() && self.state().is_early() {
                        self.finish(Reason::from_error("timeout")).await;
                    }
                }
            }
            return;
        }
        if self.is_relay(&tx) {
            if event.state == TransactionState::Cleared {
                self.abort_relay(&tx);
            }
            return;
        }
        if event.state == TransactionState::Trying {
            self.on_request(&tx).await;
        }
    }

    async fn route(&self, tx: &Transaction) {
        let has_offer = self.inner.lock().remote_media.is_some();
        let policy = self.ctx.config.forward_policy;
        let mut msg = self.bus_message(routing::CALL_PREROUTE);
        if has_offer && policy != ForwardPolicy::Never {
            msg.set_param("rtp_forward", "possible");
        }
        if self.ctx.bus.dispatch(&mut msg).await {
            if let Some(error) = msg.error().map(str::to_string) {
                return self.route_failed(tx, &error, &msg).await;
            }
        }

        msg.name = routing::CALL_ROUTE.to_string();
        msg.ret_value.clear();
        let handled = self.ctx.bus.dispatch(&mut msg).await;
        if let Some(error) = msg.error().map(str::to_string) {
            return self.route_failed(tx, &error, &msg).await;
        }
        if !handled || msg.ret_value.is_empty() {
            return self.route_failed(tx, "noroute", &msg).await;
        }
        if self.state() != SessionState::Incoming {
            debug!(id = %self.id, state = %self.state(), "session moved on while routing");
            return;
        }

        let Some(mode) = decide_media_mode(policy, has_offer, msg.flag("rtp_forward")) else {
            self.set_last_error("peer refused required media forwarding".to_string());
            self.respond(tx, 488, None, vec![]).await;
            self.finish(Reason::from_error("notacceptable")).await;
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.media_mode = mode;
            if let Some(peer) = msg.param("peerid") {
                inner.peer_id = Some(peer.to_string());
            }
        }
        info!(id = %self.id, target = %msg.ret_value, media = %mode, "call routed");
        let mut execute = self
            .bus_message(routing::CALL_EXECUTE)
            .with_param("callto", &msg.ret_value);
        if mode == MediaMode::Forwarded {
            execute.set_param("rtp_forward", "yes");
        }
        self.ctx.bus.enqueue(execute);
    }

    async fn route_failed(&self, tx: &Transaction, error: &str, msg: &BusMessage) {
        info!(id = %self.id, error, "call routing failed");
        if error == "noauth" {
            let proxy = msg.flag("auth_proxy");
            match self
                .ctx
                .engine
                .request_auth(tx, &self.ctx.config.realm, proxy)
                .await
            {
                // the challenge was the final answer
                Ok(()) => self.inner.lock().primary = None,
                Err(e) => warn!(id = %self.id, "failed to challenge caller: {}", e),
            }
            let reason = if proxy {
                Reason::new(407, "Proxy Authentication Required")
            } else {
                Reason::new(401, "Unauthorized")
            };
            self.finish(reason).await;
            return;
        }
        let mut reason = Reason::from_error(error);
        if let Some(text) = msg.param("reason") {
            reason.text = text.to_string();
        }
        self.respond(tx, reason.code, None, vec![]).await;
        self.finish(reason).await;
    }

    async fn on_request(&self, tx: &Transaction) {
        let req = tx.original().clone();
        if req.method == Method::Ack {
            debug!(id = %self.id, "ACK received");
            return;
        }
        let (state, local_tag) = {
            let inner = self.inner.lock();
            (inner.state, inner.dialog.local_tag.clone())
        };
        if state == SessionState::Cleared {
            self.respond(tx, 481, None, vec![]).await;
            return;
        }
        if req.method != Method::Cancel {
            if req.to_tag().as_deref() != Some(local_tag.as_str()) {
                debug!(id = %self.id, method = %req.method, "request does not match the dialog");
                self.respond(tx, 481, None, vec![]).await;
                return;
            }
            self.follow_remote(tx, &req);
            if let Ok(seq) = req.cseq_header().and_then(|cseq| cseq.seq()) {
                let mut inner = self.inner.lock();
                inner.dialog.remote_cseq = inner.dialog.remote_cseq.max(seq);
            }
        }

        match req.method {
            Method::Bye => {
                self.respond(tx, 200, None, vec![]).await;
                self.finish(Reason::new(0, "hangup")).await;
            }
            Method::Cancel => self.on_cancel(tx).await,
            Method::Invite => self.on_reinvite(tx).await,
            Method::Info => self.on_info(tx, &req).await,
            Method::Message => self.on_message(tx, &req).await,
            Method::Refer => self.on_refer(tx, &req).await,
            Method::Options => {
                self.respond(tx, 200, None, vec![Allow::new(ALLOWED_METHODS).into()])
                    .await;
            }
            _ => {
                self.respond(tx, 501, None, vec![]).await;
            }
        }
    }

    fn follow_remote(&self, tx: &Transaction, req: &rsip::Request) {
        let (Some(connection), Some(source)) = (tx.connection(), tx.source()) else {
            return;
        };
        let via = req
            .via_header()
            .ok()
            .and_then(|via| via.typed().ok())
            .map(|via| SipAddr::new(via.transport, via.uri.host_with_port));
        self.binding
            .on_remote_address_changed(source, connection, via.as_ref());
    }

    async fn on_cancel(&self, tx: &Transaction) {
        self.respond(tx, 200, None, vec![]).await;
        if !self.outgoing && self.state().is_early() {
            info!(id = %self.id, "call cancelled by caller");
            self.finish(Reason::from_error("cancelled")).await;
        }
    }

    async fn on_info(&self, tx: &Transaction, req: &rsip::Request) {
        if req.body.is_empty() {
            self.respond(tx, 200, None, vec![]).await;
            return;
        }
        let content_type = req.content_type_value().unwrap_or_default();
        let code = match content_type.as_str() {
            "application/dtmf-relay" | "application/dtmf" if self.ctx.config.info_dtmf => {
                match parse_dtmf(&content_type, &req.body) {
                    Some(tones) => {
                        let msg = self
                            .bus_message(routing::CHAN_DTMF)
                            .with_param("text", tones)
                            .with_param("method", "info");
                        self.ctx.bus.enqueue(msg);
                    }
                    None => debug!(id = %self.id, "INFO without a usable signal"),
                }
                200
            }
            _ => 415,
        };
        self.respond(tx, code, None, vec![]).await;
    }

    async fn on_message(&self, tx: &Transaction, req: &rsip::Request) {
        let content_type = req.content_type_value();
        if !matches!(content_type.as_deref(), None | Some("text/plain")) {
            self.respond(tx, 415, None, vec![]).await;
            return;
        }
        let text = String::from_utf8_lossy(&req.body).to_string();
        let msg = self.bus_message(routing::CHAN_TEXT).with_param("text", text);
        self.ctx.bus.enqueue(msg);
        self.respond(tx, 200, None, vec![]).await;
    }

    async fn on_refer(&self, tx: &Transaction, req: &rsip::Request) {
        let Some(refer_to) = req.header_text("refer-to").or_else(|| req.header_text("r")) else {
            self.respond(tx, 400, None, vec![]).await;
            return;
        };
        let mut msg = self
            .bus_message(routing::CALL_TRANSFER)
            .with_param("refer_to", &refer_to);
        if let Some(by) = req.header_text("referred-by") {
            msg.set_param("referred_by", by);
        }
        let handled = self.ctx.bus.dispatch(&mut msg).await;
        let code = match (handled, msg.error()) {
            (true, None) => 202,
            (true, Some(error)) => error_to_code(error).0,
            (false, _) => 603,
        };
        info!(id = %self.id, %refer_to, code, "transfer requested");
        self.respond(tx, code, None, vec![]).await;
    }

    async fn on_client_event(&self, event: TransactionEvent) {
        let tx = event.transaction.clone();
        let is_primary = {
            let mut inner = self.inner.lock();
            match inner.primary.clone() {
                Some(primary) => primary == tx,
                // the first events can race the submit call that returns the handle
                None if self.outgoing
                    && inner.state == SessionState::Outgoing
                    && tx.method() == Method::Invite =>
                {
                    inner.primary = Some(tx.clone());
                    true
                }
                None => false,
            }
        };
        if is_primary {
            self.on_primary_response(event).await;
        } else if self.is_local_reinvite(&tx) {
            self.on_reinvite_response(event).await;
        } else {
            debug!(id = %self.id, transaction = %tx, state = ?event.state, "ignoring client event");
        }
    }

    async fn on_primary_response(&self, event: TransactionEvent) {
        let Some(resp) = event.response().cloned() else {
            if event.state == TransactionState::Cleared && !event.transaction.is_answered() {
                self.finish(Reason::from_error("timeout")).await;
            }
            return;
        };
        let code = resp.status_code.code();
        match code {
            100 => {}
            101..=199 => self.on_provisional(&resp).await,
            200..=299 => self.on_answered(&resp).await,
            _ => {
                let text = resp
                    .reason_phrase()
                    .map(str::to_string)
                    .unwrap_or_else(|| resp.status_code.to_string());
                self.finish(Reason::new(code, &text)).await;
            }
        }
    }

    /// Learns the remote tag once and moves the session to the full key
    fn learn_remote_tag(&self, resp: &rsip::Response) {
        let Some(tag) = resp.to_tag() else {
            return;
        };
        let old = {
            let inner = self.inner.lock();
            match inner.dialog.remote_tag.as_deref() {
                Some(known) if known == tag => return,
                Some(known) => {
                    debug!(id = %self.id, known, %tag, "ignoring response from another fork");
                    return;
                }
                None => inner.dialog.id(),
            }
        };
        let new = DialogId::new(&old.call_id, &old.local_tag, &tag);
        if !self.ctx.registry.rekey(&old, new) {
            warn!(id = %self.id, %old, %tag, "dialog key already claimed");
            return;
        }
        let mut inner = self.inner.lock();
        if inner.dialog.remote_tag.is_none() {
            inner.dialog.remote_tag = Some(tag);
        }
    }

    async fn on_provisional(&self, resp: &rsip::Response) {
        if self.state() == SessionState::Cleared {
            return;
        }
        self.learn_remote_tag(resp);
        let media = self.observe_media(&resp.body);
        let progress = resp.status_code.code() == 183 || media.is_some();
        let advanced = {
            let mut inner = self.inner.lock();
            if media.is_some() {
                inner.remote_media = media;
            }
            inner.advance(SessionState::Ringing)
        };
        let name = if progress {
            routing::CALL_PROGRESS
        } else {
            routing::CALL_RINGING
        };
        if advanced || progress {
            self.ctx.bus.enqueue(self.bus_message(name));
        }
    }

    async fn on_answered(&self, resp: &rsip::Response) {
        self.learn_remote_tag(resp);
        self.send_ack(resp).await;
        let state = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Established {
                if let Ok(target) = resp.contact_uri() {
                    inner.dialog.remote_target = target;
                }
                inner.dialog.route_set = route_set(&resp.headers, true);
            }
            inner.state
        };
        match state {
            SessionState::Established => return,
            SessionState::Cleared => {
                info!(id = %self.id, "answer arrived after the call was dropped");
                self.send_bye().await;
                return;
            }
            _ => {}
        }
        if let Some(interval) = self.binding.apply_flow_timer(resp) {
            debug!(id = %self.id, ?interval, "keepalive interval negotiated");
        }
        let media = self.observe_media(&resp.body);
        {
            let mut inner = self.inner.lock();
            if media.is_some() {
                inner.remote_media = media;
            }
            inner.advance(SessionState::Established);
        }
        info!(id = %self.id, dialog = %self.dialog_id(), "call answered by remote");
        self.ctx
            .bus
            .enqueue(self.bus_message(routing::CALL_ANSWERED));
    }
}

impl TransactionHandler for Session {
    fn on_event(&self, event: TransactionEvent) -> bool {
        self.post(event)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("dialog", &inner.dialog.id())
            .field("state", &inner.state)
            .field("media_mode", &inner.media_mode)
            .finish()
    }
}

/// Route headers for a dialog; a UAC reverses the Record-Route order
fn route_set(headers: &rsip::Headers, reverse: bool) -> Vec<Header> {
    let mut routes = headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(record_route) => {
                Some(Header::Route(Route::from(record_route.value())))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    if reverse {
        routes.reverse();
    }
    routes
}

/// Parses `body`; the flag reports a peer behind NAT as seen from `observed`
fn inspect_media(
    ctx: &SessionContext,
    body: &[u8],
    observed: Option<&SipAddr>,
) -> (Option<MediaDescription>, bool) {
    if body.is_empty() {
        return (None, false);
    }
    let Some(mut media) = ctx.sdp.parse(body) else {
        return (None, false);
    };
    let observed = match observed.map(|addr| &addr.addr.host) {
        Some(Host::IpAddr(ip)) => *ip,
        _ => return (Some(media), false),
    };
    if !ctx.config.nat_detect {
        return (Some(media), false);
    }
    let nat = media
        .ip()
        .is_some_and(|embedded| detect_nat(embedded, observed));
    if nat {
        info!(announced = %media.address, %observed, "peer media behind NAT");
        if ctx.config.nat_rewrite {
            apply_nat(&mut media, observed);
        }
    }
    (Some(media), nat)
}

/// Tones carried by an INFO body
fn parse_dtmf(content_type: &str, body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let signal = if content_type == "application/dtmf" {
        text.trim()
    } else {
        text.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("signal")
                .then(|| value.trim())
        })?
    };
    let tones = match signal {
        "10" => "*",
        "11" => "#",
        other => other,
    };
    let valid = !tones.is_empty()
        && tones
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c.to_ascii_uppercase(), '*' | '#' | 'A'..='D'));
    valid.then(|| tones.to_ascii_uppercase())
}
