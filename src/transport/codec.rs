//! SIP message framing
//!
//! Helpers shared by the datagram and stream transports: locating the end of
//! a header section, reading the declared body length, turning header and body
//! bytes into an [`rsip::SipMessage`] and serializing messages back to wire
//! form. [`SipCodec`] wraps them in a stateful `tokio_util` codec used by the
//! TCP and TLS transports.
use super::connection::KEEPALIVE_REQUEST;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use rsip::{message::HasHeaders, Header, SipMessage};
use tokio_util::codec::{Decoder, Encoder};

static COMPACT_FORMS: &[(&str, &str)] = &[
    ("a", "Accept-Contact"),
    ("u", "Allow-Events"),
    ("i", "Call-ID"),
    ("m", "Contact"),
    ("e", "Content-Encoding"),
    ("l", "Content-Length"),
    ("c", "Content-Type"),
    ("o", "Event"),
    ("f", "From"),
    ("y", "Identity"),
    ("n", "Identity-Info"),
    ("r", "Refer-To"),
    ("b", "Referred-By"),
    ("j", "Reject-Contact"),
    ("d", "Request-Disposition"),
    ("x", "Session-Expires"),
    ("s", "Subject"),
    ("k", "Supported"),
    ("t", "To"),
    ("v", "Via"),
];

/// Returns the full header name for a one letter compact form
pub fn uncompact_form(name: &str) -> Option<&'static str> {
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| short.eq_ignore_ascii_case(name))
        .map(|(_, full)| *full)
}

fn header_is(name: &str, full: &str) -> bool {
    let name = name.trim();
    name.eq_ignore_ascii_case(full) || uncompact_form(name).is_some_and(|n| n == full)
}

/// Header lines of a header section, request/status line excluded
fn header_lines(headers: &[u8]) -> impl Iterator<Item = (&str, &str)> {
    headers
        .split(|b| *b == b'\n')
        .skip(1)
        .filter_map(|line| std::str::from_utf8(line).ok())
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.split_once(':'))
}

/// Offset of the first byte after the blank line ending the header section
///
/// Accepts `CRLFCRLF`, `LFLF` and mixed line endings.
pub fn find_empty_line(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(idx) = buf[pos..].iter().position(|b| *b == b'\n') {
        let mut next = pos + idx + 1;
        if buf.get(next) == Some(&b'\r') {
            next += 1;
        }
        match buf.get(next) {
            Some(b'\n') => return Some(next + 1),
            Some(_) => pos = pos + idx + 1,
            None => return None,
        }
    }
    None
}

fn declared_length(headers: &[u8]) -> Result<Option<usize>> {
    for (name, value) in header_lines(headers) {
        if header_is(name, "Content-Length") {
            return value
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|e| Error::FramingError(format!("invalid Content-Length: {}", e)));
        }
    }
    Ok(None)
}

/// Body length declared in a header section, zero when absent
pub fn content_length(headers: &[u8]) -> Result<usize> {
    Ok(declared_length(headers)?.unwrap_or(0))
}

/// Rewrites a header section with `CRLF` line endings and full header names
pub fn normalize(headers: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers.len() + 32);
    let mut lines = headers.split(|b| *b == b'\n').peekable();
    let mut first = true;
    while let Some(line) = lines.next() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if lines.peek().is_none() && line.is_empty() {
            break;
        }
        let expanded = if first {
            None
        } else {
            line.iter()
                .position(|b| *b == b':')
                .and_then(|colon| {
                    let name = std::str::from_utf8(&line[..colon]).ok()?;
                    let full = uncompact_form(name.trim())?;
                    Some((full, colon))
                })
        };
        match expanded {
            Some((full, colon)) => {
                out.extend_from_slice(full.as_bytes());
                out.extend_from_slice(&line[colon..]);
            }
            None => out.extend_from_slice(line),
        }
        out.extend_from_slice(b"\r\n");
        first = false;
    }
    out
}

/// Parses a message from its header section and exactly its body bytes
pub fn parse_message(headers: &[u8], body: &[u8]) -> Result<SipMessage> {
    let mut data = normalize(headers);
    data.extend_from_slice(body);
    SipMessage::try_from(data.as_slice()).map_err(|e| Error::SipMessageError(e.to_string()))
}

/// Parses one datagram
///
/// Returns `Ok(None)` for whitespace-only keepalive datagrams. Without a
/// Content-Length header the body extends to the end of the datagram.
pub fn parse_datagram(buf: &[u8]) -> Result<Option<SipMessage>> {
    let start = match buf.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => start,
        None => return Ok(None),
    };
    let buf = &buf[start..];
    let end = find_empty_line(buf)
        .ok_or_else(|| Error::FramingError("incomplete header section".to_string()))?;
    let available = buf.len() - end;
    let body_len = match declared_length(&buf[..end])? {
        Some(len) if len > available => {
            return Err(Error::FramingError(format!(
                "truncated body: {} of {} bytes",
                available, len
            )))
        }
        Some(len) => len,
        None => available,
    };
    parse_message(&buf[..end], &buf[end..end + body_len]).map(Some)
}

/// Wire form of a message, with a Content-Length header added when missing
pub fn serialize(msg: &SipMessage) -> Bytes {
    let has_length = msg
        .headers()
        .iter()
        .any(|h| matches!(h, Header::ContentLength(_)));
    if has_length {
        return Bytes::from(msg.to_string());
    }
    let mut msg = msg.clone();
    let len = msg.body().len() as u32;
    msg.headers_mut().push(Header::ContentLength(len.into()));
    Bytes::from(msg.to_string())
}

/// Cheap check on raw bytes: responses and requests carrying a To tag
pub fn looks_in_dialog(buf: &[u8]) -> bool {
    if buf.starts_with(b"SIP/") {
        return true;
    }
    let end = find_empty_line(buf).unwrap_or(buf.len());
    header_lines(&buf[..end])
        .filter(|(name, _)| header_is(name, "To"))
        .any(|(_, value)| value.to_ascii_lowercase().contains(";tag="))
}

/// Method token of a raw request, `None` for responses
pub fn request_method(buf: &[u8]) -> Option<&str> {
    if buf.starts_with(b"SIP/") {
        return None;
    }
    let end = buf.iter().position(|b| *b == b' ')?;
    std::str::from_utf8(&buf[..end]).ok()
}

#[derive(Debug, Clone)]
pub enum Frame {
    Message(SipMessage),
    KeepaliveRequest,
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Message(msg) => write!(f, "{}", msg),
            Frame::KeepaliveRequest => write!(f, "Keepalive Request"),
        }
    }
}

struct PendingMessage {
    headers: Bytes,
    body_len: usize,
}

/// Stateful stream framer
///
/// A header section that has been fully received is split off the buffer and
/// kept until its body arrives, so a message may span any number of reads.
pub struct SipCodec {
    max_size: usize,
    pending: Option<PendingMessage>,
}

impl SipCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            pending: None,
        }
    }

    /// True while a header section is waiting for its body
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn overflow(&self, size: usize) -> Error {
        Error::FramingError(format!("buffer overflow: {} > {}", size, self.max_size))
    }
}

impl Decoder for SipCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if let Some(pending) = &self.pending {
                if src.len() < pending.body_len {
                    return Ok(None);
                }
                let body = src.split_to(pending.body_len);
                let pending = match self.pending.take() {
                    Some(pending) => pending,
                    None => return Ok(None),
                };
                return parse_message(&pending.headers, &body).map(|m| Some(Frame::Message(m)));
            }

            let blank = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if blank > 0 {
                if src.starts_with(KEEPALIVE_REQUEST) {
                    src.advance(KEEPALIVE_REQUEST.len());
                    return Ok(Some(Frame::KeepaliveRequest));
                }
                if blank == src.len() && KEEPALIVE_REQUEST.starts_with(&src[..]) {
                    return Ok(None);
                }
                src.advance(1);
                continue;
            }

            let end = match find_empty_line(src) {
                Some(end) => end,
                None if src.len() > self.max_size => return Err(self.overflow(src.len())),
                None => return Ok(None),
            };
            if end > self.max_size {
                return Err(self.overflow(end));
            }
            let body_len = content_length(&src[..end])?;
            if end + body_len > self.max_size {
                return Err(self.overflow(end + body_len));
            }
            let headers = src.split_to(end).freeze();
            self.pending = Some(PendingMessage { headers, body_len });
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&serialize(&item));
        Ok(())
    }
}
