use super::MediaDescription;
use std::net::IpAddr;
use tracing::debug;

/// True for addresses that cannot be reached from the public network
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            // 100.64.0.0/10 is carrier-grade NAT space
            let shared = a == 100 && (64..128).contains(&b);
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || shared
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// A peer is behind NAT when it announces a private address but is seen
/// from a routable one
pub fn detect_nat(embedded: IpAddr, observed: IpAddr) -> bool {
    embedded != observed && is_private(embedded) && !is_private(observed)
}

/// Replaces the announced media address with the observed one when the
/// peer is behind NAT; returns true if the description changed
pub fn apply_nat(media: &mut MediaDescription, observed: IpAddr) -> bool {
    match media.ip() {
        Some(embedded) if detect_nat(embedded, observed) => {
            debug!(%embedded, %observed, "peer behind NAT, using observed media address");
            media.address = observed.to_string();
            true
        }
        _ => false,
    }
}
