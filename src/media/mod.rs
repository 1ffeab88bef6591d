//! Media description seam
//!
//! SDP parsing and building belong to an external codec ([`SdpCodec`]); the
//! session only needs the remote address and the ordered stream list, and
//! moves them through routing messages as flat parameters.
use crate::config::ForwardPolicy;
use std::{collections::BTreeMap, fmt, net::IpAddr};

pub mod nat;

pub use nat::{detect_nat, is_private};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    /// `audio`, `video`, ...
    pub kind: String,
    pub port: u16,
    pub formats: Vec<String>,
}

impl MediaStream {
    pub fn new(kind: &str, port: u16, formats: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            port,
            formats: formats.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Connection address plus the ordered media streams of one SDP body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub address: String,
    pub media: Vec<MediaStream>,
}

impl MediaDescription {
    pub fn new(address: &str, media: Vec<MediaStream>) -> Self {
        Self {
            address: address.to_string(),
            media,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }

    /// Writes this description as routing parameters
    ///
    /// Streams are numbered from 1 in SDP order (`media_1`, `rtp_port_1`,
    /// `formats_1`, ...); `media` lists their kinds.
    pub fn to_params(&self, params: &mut BTreeMap<String, String>) {
        params.insert("rtp_addr".to_string(), self.address.clone());
        let kinds = self
            .media
            .iter()
            .map(|m| m.kind.as_str())
            .collect::<Vec<_>>()
            .join(",");
        params.insert("media".to_string(), kinds);
        for (index, stream) in self.media.iter().enumerate() {
            let n = index + 1;
            params.insert(format!("media_{}", n), stream.kind.clone());
            params.insert(format!("rtp_port_{}", n), stream.port.to_string());
            params.insert(format!("formats_{}", n), stream.formats.join(","));
        }
    }

    /// Reads a description back from routing parameters
    ///
    /// Streams without a usable port are skipped.
    pub fn from_params(params: &BTreeMap<String, String>) -> Option<Self> {
        let address = params.get("rtp_addr")?.clone();
        let count = params
            .get("media")?
            .split(',')
            .filter(|kind| !kind.trim().is_empty())
            .count();
        let media = (1..=count)
            .filter_map(|n| {
                let kind = params.get(&format!("media_{}", n))?.trim().to_string();
                let port = params.get(&format!("rtp_port_{}", n))?.trim().parse().ok()?;
                let formats = params
                    .get(&format!("formats_{}", n))
                    .map(|f| {
                        f.split(',')
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(MediaStream {
                    kind,
                    port,
                    formats,
                })
            })
            .collect::<Vec<_>>();
        Some(Self { address, media })
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        for stream in &self.media {
            write!(f, " {}:{}", stream.kind, stream.port)?;
        }
        Ok(())
    }
}

/// SDP codec provided by the media layer
///
/// Both operations are pure.
pub trait SdpCodec: Send + Sync {
    fn parse(&self, body: &[u8]) -> Option<MediaDescription>;
    fn build(&self, media: &MediaDescription) -> Vec<u8>;
}

/// How a call's media flows through this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaMode {
    #[default]
    Unknown,
    /// Media flows directly between the peers of both call legs
    Forwarded,
    /// Media is terminated and relayed locally
    Proxied,
}

impl fmt::Display for MediaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaMode::Unknown => write!(f, "unknown"),
            MediaMode::Forwarded => write!(f, "forwarded"),
            MediaMode::Proxied => write!(f, "proxied"),
        }
    }
}

/// Picks the media mode once the peer leg answered the forwarding question
///
/// Returns `None` when forwarding is required but the peer refused it.
pub fn decide_media_mode(policy: ForwardPolicy, has_offer: bool, peer_accepts: bool) -> Option<MediaMode> {
    if !has_offer {
        return match policy {
            ForwardPolicy::Required => None,
            _ => Some(MediaMode::Unknown),
        };
    }
    match (policy, peer_accepts) {
        (ForwardPolicy::Never, _) => Some(MediaMode::Proxied),
        (ForwardPolicy::Allowed, true) | (ForwardPolicy::Required, true) => {
            Some(MediaMode::Forwarded)
        }
        (ForwardPolicy::Allowed, false) => Some(MediaMode::Proxied),
        (ForwardPolicy::Required, false) => None,
    }
}
