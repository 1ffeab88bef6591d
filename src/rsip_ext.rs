use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until},
    character::complete::{char, multispace0},
    combinator::{map, opt, rest},
    multi::separated_list0,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use rsip::{
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
};

/// Header lookups shared by requests and responses
pub trait RsipMessageExt {
    /// Value of the first non-standard header named `name`
    fn header_value(&self, name: &str) -> Option<&str>;
    /// Value of the first header named `name`, whether rsip types it or not
    fn header_text(&self, name: &str) -> Option<String>;
    fn content_type_value(&self) -> Option<String>;
    fn from_tag(&self) -> Option<String>;
    fn to_tag(&self) -> Option<String>;
    /// Target URI from the Contact header, tolerating malformed contacts
    fn contact_uri(&self) -> Result<rsip::Uri>;
}

impl<T: HasHeaders + HeadersExt> RsipMessageExt for T {
    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers().iter().find_map(|header| match header {
            rsip::Header::Other(key, value) if key.eq_ignore_ascii_case(name) => {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    fn header_text(&self, name: &str) -> Option<String> {
        self.headers().iter().find_map(|header| {
            let line = header.to_string();
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    fn content_type_value(&self) -> Option<String> {
        self.headers().iter().find_map(|header| match header {
            rsip::Header::ContentType(value) => Some(
                value
                    .value()
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase(),
            ),
            _ => None,
        })
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header()
            .ok()?
            .tag()
            .ok()
            .flatten()
            .map(|tag| tag.to_string())
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header()
            .ok()?
            .tag()
            .ok()
            .flatten()
            .map(|tag| tag.to_string())
    }

    fn contact_uri(&self) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        if let Ok(typed) = contact.typed() {
            return Ok(typed.uri);
        }
        let mut uri = extract_uri_from_contact(contact.value())?;
        uri.headers.clear();
        Ok(uri)
    }
}

pub trait RsipResponseExt {
    fn reason_phrase(&self) -> Option<&str>;
    /// Seconds announced by a `Flow-Timer` header
    fn flow_timer(&self) -> Option<u64>;
}

impl RsipResponseExt for rsip::Response {
    fn reason_phrase(&self) -> Option<&str> {
        self.header_value("reason")
    }

    fn flow_timer(&self) -> Option<u64> {
        self.header_value("flow-timer")?.trim().parse().ok()
    }
}

pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let tokenizer = ContactTokenizer::from_str(line)?;
    let mut uri = rsip::Uri::try_from(tokenizer.uri).map_err(Error::from)?;
    uri.params
        .retain(|p| !matches!(p, rsip::Param::Transport(rsip::Transport::Udp)));
    for (name, value) in tokenizer.params.iter().map(|p| (p.name, p.value)) {
        if name.eq_ignore_ascii_case("transport") {
            continue;
        }
        let value = value.map(|v| rsip::param::OtherParamValue::new(v.to_string()));
        let existing = uri.params.iter_mut().find_map(|param| match param {
            rsip::Param::Other(key, existing) if key.value().eq_ignore_ascii_case(name) => {
                Some(existing)
            }
            _ => None,
        });
        match existing {
            Some(existing) => *existing = value,
            None => uri
                .params
                .push(rsip::Param::Other(rsip::param::OtherParam::new(name), value)),
        }
    }
    Ok(uri)
}

#[derive(Debug)]
struct ContactTokenizer<'a> {
    uri: &'a str,
    params: Vec<ContactParam<'a>>,
}

#[derive(Debug)]
struct ContactParam<'a> {
    name: &'a str,
    value: Option<&'a str>,
}

impl<'a> ContactTokenizer<'a> {
    fn from_str(input: &'a str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::SipMessageError("empty contact header".into()));
        }
        match alt((contact_with_brackets, contact_without_brackets)).parse(trimmed) {
            Ok((_, tokenizer)) => Ok(tokenizer),
            Err(_) => Ok(Self {
                uri: trimmed,
                params: contact_params(trimmed),
            }),
        }
    }
}

fn contact_with_brackets(input: &str) -> IResult<&str, ContactTokenizer<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(take_until("<")).parse(input)?;
    let (input, _) = char('<').parse(input)?;
    let (input, uri) = take_until(">").parse(input)?;
    let (input, _) = char('>').parse(input)?;
    let uri = uri.trim();
    Ok((
        input,
        ContactTokenizer {
            uri,
            params: contact_params(uri),
        },
    ))
}

fn contact_without_brackets(input: &str) -> IResult<&str, ContactTokenizer<'_>> {
    let (input, uri) = map(rest, |s: &str| s.trim()).parse(input)?;
    Ok((
        input,
        ContactTokenizer {
            uri,
            params: contact_params(uri),
        },
    ))
}

fn contact_params(uri: &str) -> Vec<ContactParam<'_>> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    let params = match path.split_once(';') {
        Some((_, params)) if !params.is_empty() => params,
        _ => return Vec::new(),
    };
    match separated_list0(char(';'), contact_param).parse(params) {
        Ok((_, params)) => params.into_iter().filter(|p| !p.name.is_empty()).collect(),
        Err(_) => Vec::new(),
    }
}

fn contact_param(input: &str) -> IResult<&str, ContactParam<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, name) = map(is_not("=; \t\r\n?"), |v: &str| v.trim()).parse(input)?;
    let (input, value) = opt(preceded(
        char('='),
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            map(is_not("; \t\r\n?"), |v: &str| v.trim()),
        )),
    ))
    .parse(input)?;
    Ok((input, ContactParam { name, value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn response(extra: Vec<rsip::Header>) -> rsip::Response {
        let mut headers: Vec<rsip::Header> = vec![
            Via::new("SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK1").into(),
            From::new("<sip:alice@example.com>;tag=abc").into(),
            To::new("<sip:bob@example.com>;tag=xyz").into(),
            CallId::new("c1@example.com").into(),
            CSeq::new("1 INVITE").into(),
        ];
        headers.extend(extra);
        rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: Default::default(),
        }
    }

    #[test]
    fn test_tags_and_flow_timer() {
        let resp = response(vec![
            rsip::Header::Other("Flow-Timer".into(), " 90".into()),
            ContentType::new("application/SDP; charset=utf-8").into(),
        ]);
        assert_eq!(resp.from_tag().as_deref(), Some("abc"));
        assert_eq!(resp.to_tag().as_deref(), Some("xyz"));
        assert_eq!(resp.flow_timer(), Some(90));
        assert_eq!(resp.content_type_value().as_deref(), Some("application/sdp"));
        assert!(resp.header_value("x-missing").is_none());
        assert_eq!(resp.header_text("call-id").as_deref(), Some("c1@example.com"));
    }

    #[test]
    fn test_contact_uri() -> Result<()> {
        let resp = response(vec![
            Contact::new("\"Bob\" <sip:bob@192.168.1.10:5070;transport=tcp>").into(),
        ]);
        let uri = resp.contact_uri()?;
        assert_eq!(uri.host_with_port.to_string(), "192.168.1.10:5070");
        Ok(())
    }

    #[test]
    fn test_extract_uri_keeps_custom_params() -> Result<()> {
        let uri = extract_uri_from_contact("Bob <sip:bob@10.0.0.5:5060;ob>;expires=60")?;
        assert_eq!(uri.host_with_port.to_string(), "10.0.0.5:5060");
        Ok(())
    }
}
