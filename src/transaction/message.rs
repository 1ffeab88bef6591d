use super::make_via_branch;
use crate::{rsip_ext::RsipMessageExt, transport::SipAddr, Result};
use rsip::{
    headers::{ContentLength, Route},
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Request, Response, StatusCode,
};

/// Via for a request leaving through `local`, with a fresh branch
pub fn make_via(local: &SipAddr) -> rsip::typed::Via {
    rsip::typed::Via {
        version: rsip::Version::V2,
        transport: local.protocol(),
        uri: rsip::Uri {
            host_with_port: local.addr.clone(),
            ..Default::default()
        },
        params: vec![make_via_branch()],
    }
}

/// Builds a request carrying the mandatory headers
///
/// Headers are laid out Via, Call-ID, From, To, CSeq, Max-Forwards,
/// User-Agent; callers append Contact, Content-Type and body.
pub fn make_request(
    method: rsip::Method,
    uri: rsip::Uri,
    via: rsip::typed::Via,
    from: rsip::typed::From,
    to: rsip::typed::To,
    call_id: &str,
    seq: u32,
    user_agent: &str,
) -> Request {
    let headers = vec![
        Header::Via(via.into()),
        Header::CallId(call_id.to_string().into()),
        Header::From(from.into()),
        Header::To(to.into()),
        Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
        Header::MaxForwards(70.into()),
        Header::UserAgent(user_agent.to_string().into()),
    ];
    Request {
        method,
        uri,
        headers: headers.into(),
        body: vec![],
        version: rsip::Version::V2,
    }
}

/// Builds a response to `req`, adding `to_tag` when the request has none
///
/// Via, Call-ID, From, To and CSeq are copied; Content-Length matches the
/// body.
pub fn make_response(
    req: &Request,
    status_code: StatusCode,
    to_tag: Option<&str>,
    body: Option<Vec<u8>>,
    user_agent: &str,
) -> Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    if let (Some(tag), None) = (to_tag, req.to_tag()) {
        headers.iter_mut().for_each(|h| {
            if let Header::To(to) = h {
                if let Ok(typed) = to.typed() {
                    *to = typed.with_tag(Tag::new(tag)).into();
                }
            }
        });
    }
    headers.push(Header::ContentLength(
        body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
    ));
    headers.unique_push(Header::UserAgent(user_agent.to_string().into()));
    Response {
        status_code,
        version: req.version.clone(),
        headers,
        body: body.unwrap_or_default(),
    }
}

/// ACK for a 2xx final response to INVITE
///
/// Sent end to end: a new branch, the Contact of the response as
/// Request-URI and the reversed Record-Route set as Route.
pub fn make_ack(resp: &Response, user_agent: &str) -> Result<Request> {
    let uri = resp.contact_uri()?;
    let mut headers = resp.headers.clone();
    let mut route_set = resp
        .headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(record_route) => {
                Some(Header::Route(Route::from(record_route.value())))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    route_set.reverse();

    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
        )
    });
    let mut first_via = true;
    headers.iter_mut().for_each(|h| match h {
        Header::Via(via) if first_via => {
            first_via = false;
            if let Ok(mut typed) = via.typed() {
                typed.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
                typed.params.push(make_via_branch());
                *via = typed.into();
            }
        }
        Header::CSeq(cseq) => {
            cseq.mut_method(rsip::Method::Ack).ok();
        }
        _ => {}
    });
    headers.retain({
        let mut seen_via = false;
        move |h| match h {
            Header::Via(_) if seen_via => false,
            Header::Via(_) => {
                seen_via = true;
                true
            }
            _ => true,
        }
    });
    headers.extend(route_set);
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::ContentLength(ContentLength::default()));
    headers.unique_push(Header::UserAgent(user_agent.to_string().into()));
    Ok(Request {
        method: rsip::Method::Ack,
        uri,
        headers,
        body: vec![],
        version: rsip::Version::V2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn invite() -> Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@192.0.2.4").expect("uri"),
            headers: vec![
                Via::new("SIP/2.0/UDP 10.0.0.5:4000;branch=z9hG4bKa1").into(),
                From::new("<sip:alice@example.com>;tag=alice1").into(),
                To::new("<sip:bob@example.com>").into(),
                CallId::new("call-1@example.com").into(),
                CSeq::new("1 INVITE").into(),
                Contact::new("<sip:alice@10.0.0.5:4000>").into(),
                Header::Other("X-Custom".into(), "1".into()),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn test_response_adds_tag_and_strips_headers() {
        let req = invite();
        let resp = make_response(&req, StatusCode::OK, Some("local9"), Some(b"v=0".to_vec()), "ua");
        assert_eq!(resp.to_tag().as_deref(), Some("local9"));
        assert!(resp.header_value("x-custom").is_none());
        assert!(resp.contact_header().is_err());
        assert_eq!(resp.body, b"v=0".to_vec());
    }

    #[test]
    fn test_ack_targets_contact_with_new_branch() -> Result<()> {
        let req = invite();
        let mut resp = make_response(&req, StatusCode::OK, Some("bob1"), None, "ua");
        resp.headers.push(Contact::new("<sip:bob@198.51.100.7:5062>").into());
        resp.headers
            .push(RecordRoute::new("<sip:proxy1.example.com;lr>").into());

        let ack = make_ack(&resp, "ua")?;
        assert_eq!(ack.method, rsip::Method::Ack);
        assert_eq!(ack.uri.host_with_port.to_string(), "198.51.100.7:5062");
        assert_eq!(ack.cseq_header()?.method()?, rsip::Method::Ack);
        let branch = ack.via_header()?.typed()?.branch().map(|b| b.to_string());
        assert!(branch.is_some());
        assert_ne!(branch.as_deref(), Some("z9hG4bKa1"));
        assert!(ack
            .headers
            .iter()
            .any(|h| matches!(h, Header::Route(_))));
        Ok(())
    }
}
