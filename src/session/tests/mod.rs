use super::{session::Session, SessionContext};
use crate::{
    config::{SessionConfig, TransportConfig},
    media::{MediaDescription, MediaStream, SdpCodec},
    routing::{self, update, BusMessage, MessageBus},
    transaction::{
        message::make_response, random_text, Transaction, TransactionEngine, TransactionEvent,
        TransactionHandler, TransactionState,
    },
    transport::{PartyBinding, SipAddr, SipConnection, TransportLayer},
    Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rsip::{headers::*, transport::Transport, Header, Method};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod test_reinvite;

pub(super) const ALICE: &str = "10.0.0.5:4000";

/// Records everything the session layer asks of the engine
#[derive(Default)]
pub(super) struct MockEngine {
    pub responses: Mutex<Vec<(Transaction, rsip::Response)>>,
    pub submitted: Mutex<Vec<Transaction>>,
    pub cancelled: Mutex<Vec<Transaction>>,
    pub challenges: Mutex<Vec<(Transaction, String, bool)>>,
    pub fail_challenges: Mutex<bool>,
    pub retries: Mutex<Vec<(Transaction, u32)>>,
}

impl MockEngine {
    pub fn codes_for(&self, method: Method) -> Vec<u16> {
        self.responses
            .lock()
            .iter()
            .filter(|(tx, _)| tx.method() == method)
            .map(|(_, resp)| resp.status_code.code())
            .collect()
    }

    pub fn last_response(&self) -> Option<rsip::Response> {
        self.responses.lock().last().map(|(_, resp)| resp.clone())
    }

    pub fn submitted_for(&self, method: Method) -> Vec<Transaction> {
        self.submitted
            .lock()
            .iter()
            .filter(|tx| tx.method() == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransactionEngine for MockEngine {
    async fn submit(
        &self,
        request: rsip::Request,
        _binding: Arc<PartyBinding>,
        owner: Weak<dyn TransactionHandler>,
    ) -> Result<Transaction> {
        let tx = Transaction::outgoing(request)?;
        tx.set_owner(owner);
        self.submitted.lock().push(tx.clone());
        Ok(tx)
    }

    async fn respond(&self, transaction: &Transaction, response: rsip::Response) -> Result<()> {
        self.responses.lock().push((transaction.clone(), response));
        Ok(())
    }

    async fn cancel(&self, transaction: &Transaction) -> Result<()> {
        self.cancelled.lock().push(transaction.clone());
        Ok(())
    }

    fn set_max_retries(&self, transaction: &Transaction, retries: u32) {
        self.retries.lock().push((transaction.clone(), retries));
    }

    async fn request_auth(
        &self,
        transaction: &Transaction,
        realm: &str,
        proxy: bool,
    ) -> Result<()> {
        if *self.fail_challenges.lock() {
            return Err(crate::Error::Error("no credentials backend".to_string()));
        }
        self.challenges
            .lock()
            .push((transaction.clone(), realm.to_string(), proxy));
        Ok(())
    }
}

/// How the mock peer leg answers `call.update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UpdateReply {
    Unhandled,
    Pending,
    Accept,
    Reject,
}

type Handler = Box<dyn Fn(&mut BusMessage) -> bool + Send + Sync>;

pub(super) struct MockBus {
    handler: Handler,
    pub dispatched: Mutex<Vec<BusMessage>>,
    pub queued: Mutex<Vec<BusMessage>>,
}

impl MockBus {
    pub fn new(handler: impl Fn(&mut BusMessage) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            dispatched: Mutex::new(vec![]),
            queued: Mutex::new(vec![]),
        })
    }

    /// Routes every call to `target`; `forward` accepts direct media
    pub fn router(target: &str, forward: bool, reply: UpdateReply) -> Arc<Self> {
        let target = target.to_string();
        Self::new(move |msg| match msg.name.as_str() {
            routing::CALL_ROUTE => {
                msg.ret_value = target.clone();
                if forward {
                    msg.set_param("rtp_forward", "yes");
                }
                true
            }
            routing::CALL_UPDATE => match reply {
                UpdateReply::Unhandled => false,
                UpdateReply::Pending => true,
                UpdateReply::Accept => {
                    msg.set_param("operation", update::NOTIFY);
                    true
                }
                UpdateReply::Reject => {
                    msg.set_param("operation", update::REJECT);
                    msg.set_param("error", "notacceptable");
                    true
                }
            },
            routing::CALL_TRANSFER => true,
            _ => false,
        })
    }

    pub fn queued(&self, name: &str) -> Vec<BusMessage> {
        self.queued
            .lock()
            .iter()
            .filter(|msg| msg.name == name)
            .cloned()
            .collect()
    }

    pub fn dispatched(&self, name: &str) -> Vec<BusMessage> {
        self.dispatched
            .lock()
            .iter()
            .filter(|msg| msg.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn dispatch(&self, msg: &mut BusMessage) -> bool {
        let handled = (self.handler)(msg);
        self.dispatched.lock().push(msg.clone());
        handled
    }

    fn enqueue(&self, msg: BusMessage) {
        self.queued.lock().push(msg);
    }
}

/// Understands just enough SDP for the tests: `c=` and `m=` lines
pub(super) struct BasicSdp;

impl SdpCodec for BasicSdp {
    fn parse(&self, body: &[u8]) -> Option<MediaDescription> {
        let text = std::str::from_utf8(body).ok()?;
        let mut address = None;
        let mut media = vec![];
        for line in text.lines() {
            if let Some(conn) = line.strip_prefix("c=") {
                address = conn.split_whitespace().nth(2).map(str::to_string);
            } else if let Some(m) = line.strip_prefix("m=") {
                let mut parts = m.split_whitespace();
                let kind = parts.next()?;
                let port = parts.next()?.parse().ok()?;
                let formats = parts.skip(1).collect::<Vec<_>>();
                media.push(MediaStream::new(kind, port, &formats));
            }
        }
        Some(MediaDescription::new(&address?, media))
    }

    fn build(&self, media: &MediaDescription) -> Vec<u8> {
        let mut sdp = format!(
            "v=0\r\no=- 1 1 IN IP4 {0}\r\ns=-\r\nc=IN IP4 {0}\r\nt=0 0\r\n",
            media.address
        );
        for stream in &media.media {
            sdp.push_str(&format!(
                "m={} {} RTP/AVP {}\r\n",
                stream.kind,
                stream.port,
                stream.formats.join(" ")
            ));
        }
        sdp.into_bytes()
    }
}

pub(super) fn sdp(addr: &str, port: u16) -> String {
    format!(
        "v=0\r\no=- 1 1 IN IP4 {0}\r\ns=-\r\nc=IN IP4 {0}\r\nt=0 0\r\nm=audio {1} RTP/AVP 0 8\r\n",
        addr, port
    )
}

pub(super) fn local_media() -> MediaDescription {
    MediaDescription::new("192.0.2.4", vec![MediaStream::new("audio", 30000, &["0", "8"])])
}

pub(super) struct Harness {
    pub ctx: SessionContext,
    pub engine: Arc<MockEngine>,
    pub bus: Arc<MockBus>,
    pub connection: SipConnection,
}

pub(super) fn harness(config: SessionConfig, bus: Arc<MockBus>) -> Harness {
    let transports = TransportLayer::new(TransportConfig::default(), CancellationToken::new());
    let udp = transports.add_udp("udp0", "127.0.0.1:0".parse().expect("bind address"));
    let engine = Arc::new(MockEngine::default());
    let ctx = SessionContext::new(
        config,
        transports,
        engine.clone(),
        bus.clone(),
        Arc::new(BasicSdp),
    );
    Harness {
        ctx,
        engine,
        bus,
        connection: SipConnection::Udp(udp),
    }
}

pub(super) fn request(
    method: Method,
    mut headers: Vec<Header>,
    body: Option<(&str, String)>,
) -> rsip::Request {
    let body = match body {
        Some((content_type, text)) => {
            headers.push(ContentType::new(content_type).into());
            text.into_bytes()
        }
        None => vec![],
    };
    rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:bob@192.0.2.4:5060").expect("uri"),
        version: rsip::Version::V2,
        headers: headers.into(),
        body,
    }
}

pub(super) fn invite(call_id: &str, from_tag: &str, body: Option<String>) -> rsip::Request {
    request(
        Method::Invite,
        vec![
            Via::new("SIP/2.0/UDP 10.0.0.5:4000;branch=z9hG4bKinvite1").into(),
            From::new(format!("<sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new("<sip:bob@example.com>").into(),
            CallId::new(call_id).into(),
            CSeq::new("1 INVITE").into(),
            Contact::new("<sip:alice@10.0.0.5:4000>").into(),
        ],
        body.map(|sdp| ("application/sdp", sdp)),
    )
}

/// Request the remote party sends inside the dialog of `session`
pub(super) fn in_dialog(
    session: &Session,
    method: Method,
    seq: u32,
    body: Option<(&str, String)>,
) -> rsip::Request {
    let id = session.dialog_id();
    request(
        method.clone(),
        vec![
            Via::new(format!(
                "SIP/2.0/UDP 10.0.0.5:4000;branch=z9hG4bK{}",
                random_text(10)
            ))
            .into(),
            From::new(format!("<sip:alice@example.com>;tag={}", id.remote_tag)).into(),
            To::new(format!("<sip:bob@example.com>;tag={}", id.local_tag)).into(),
            CallId::new(id.call_id.clone()).into(),
            CSeq::new(format!("{} {}", seq, method)).into(),
            Contact::new("<sip:alice@10.0.0.5:4000>").into(),
        ],
        body,
    )
}

pub(super) fn incoming_tx(h: &Harness, req: rsip::Request, source: &str) -> Transaction {
    let source = SipAddr::from_socket(Transport::Udp, source.parse().expect("source address"));
    Transaction::incoming(req, h.connection.clone(), source).expect("transaction")
}

pub(super) fn trying(tx: &Transaction) -> TransactionEvent {
    TransactionEvent::new(
        TransactionState::Trying,
        tx.clone(),
        Some(tx.original().clone().into()),
    )
}

/// Response the remote party sends in a client transaction
pub(super) fn response_event(
    tx: &Transaction,
    code: u16,
    to_tag: &str,
    body: Option<String>,
) -> TransactionEvent {
    let mut resp = make_response(
        tx.original(),
        code.into(),
        Some(to_tag),
        body.as_ref().map(|b| b.as_bytes().to_vec()),
        "test",
    );
    resp.headers
        .push(Contact::new("<sip:remote@198.51.100.7:5060>").into());
    if body.is_some() {
        resp.headers
            .push(ContentType::new("application/sdp").into());
    }
    let state = if code < 200 {
        TransactionState::Process
    } else {
        TransactionState::Cleared
    };
    TransactionEvent::new(state, tx.clone(), Some(resp.into()))
}

/// Incoming call from alice, routed and answered
pub(super) async fn establish(h: &Harness, body: Option<String>) -> Result<Arc<Session>> {
    let tx = incoming_tx(h, invite("call-1", "alice1", body), ALICE);
    let session = Session::incoming(&h.ctx, &tx)?;
    assert!(h.ctx.registry.insert(session.clone()));
    session.handle_event(trying(&tx)).await;
    session.answer(Some(local_media())).await?;
    Ok(session)
}

pub(super) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}
