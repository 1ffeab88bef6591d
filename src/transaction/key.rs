use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Method,
};
use std::fmt;

/// Identity of one transaction as the engine matches it
///
/// Requests carrying an RFC 3261 branch are keyed by branch; older peers
/// fall back to the sent-by address and the From tag. ACK maps onto the
/// INVITE it acknowledges.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    Branch {
        branch: String,
        method: String,
        cseq: u32,
        call_id: String,
    },
    Legacy {
        method: String,
        cseq: u32,
        call_id: String,
        from_tag: String,
        sent_by: String,
    },
    Invalid,
}

impl TransactionKey {
    fn build(msg: &rsip::Request) -> Result<Self> {
        let method = match msg.method {
            Method::Ack => Method::Invite,
            ref other => other.clone(),
        };
        let via = msg.via_header()?.typed()?;
        let cseq = msg.cseq_header()?.seq()?;
        let call_id = msg.call_id_header()?.value().to_string();
        if let Some(branch) = via.branch() {
            return Ok(TransactionKey::Branch {
                branch: branch.to_string(),
                method: method.to_string(),
                cseq,
                call_id,
            });
        }
        let from_tag = msg.from_header()?.tag()?.ok_or_else(|| {
            Error::TransactionError("from tag missing".to_string(), TransactionKey::Invalid)
        })?;
        Ok(TransactionKey::Legacy {
            method: method.to_string(),
            cseq,
            call_id,
            from_tag: from_tag.to_string(),
            sent_by: via.uri.host_with_port.to_string(),
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::Branch {
                branch,
                method,
                cseq,
                call_id,
            } => write!(f, "{} {}/{} ({})", call_id, method, cseq, branch),
            TransactionKey::Legacy {
                method,
                cseq,
                call_id,
                from_tag,
                sent_by,
            } => write!(f, "{} {}/{} {}[{}]", call_id, method, cseq, from_tag, sent_by),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TryFrom<&rsip::Request> for TransactionKey {
    type Error = Error;

    fn try_from(req: &rsip::Request) -> Result<Self> {
        Self::build(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::*;

    fn invite(via: &str, method: Method, cseq: &str) -> rsip::Request {
        rsip::Request {
            method,
            uri: rsip::Uri {
                scheme: Some(rsip::Scheme::Sip),
                host_with_port: rsip::Domain::from("example.com").into(),
                ..Default::default()
            },
            headers: vec![
                Via::new(via).into(),
                CSeq::new(cseq).into(),
                From::new("Alice <sip:alice@atlanta.example.com>;tag=1928301774").into(),
                To::new("Bob <sip:bob@biloxi.example.com>").into(),
                CallId::new("a84b4c76e66710@pc33.atlanta.example.com").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_branch_key_matches_ack() -> Result<()> {
        let req = invite(
            "SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds",
            Method::Invite,
            "314159 INVITE",
        );
        let key = TransactionKey::try_from(&req)?;
        assert_eq!(
            key,
            TransactionKey::Branch {
                branch: "z9hG4bK776asdhds".to_string(),
                method: "INVITE".to_string(),
                cseq: 314159,
                call_id: "a84b4c76e66710@pc33.atlanta.example.com".to_string(),
            }
        );

        let ack = invite(
            "SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds",
            Method::Ack,
            "314159 ACK",
        );
        assert_eq!(TransactionKey::try_from(&ack)?, key);
        Ok(())
    }

    #[test]
    fn test_legacy_key_uses_sent_by() -> Result<()> {
        let req = invite("SIP/2.0/UDP 10.0.0.5:5060", Method::Invite, "1 INVITE");
        match TransactionKey::try_from(&req)? {
            TransactionKey::Legacy {
                from_tag, sent_by, ..
            } => {
                assert_eq!(from_tag, "1928301774");
                assert_eq!(sent_by, "10.0.0.5:5060");
            }
            other => panic!("unexpected key {:?}", other),
        }
        Ok(())
    }
}
