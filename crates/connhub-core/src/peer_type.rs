//! Coarse transport classification of a peer, derived from its address.
//! Best-effort metadata only.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    /// Bluetooth
    Bt,
    Dht,
    Tunnel,
    /// `net:` transport to a private, loopback or link-local host.
    Lan,
    /// `net:` transport to anything else.
    Internet,
}

/// Classify `address`, falling back to `hint` (usually the transport's view
/// of the remote address) when the address itself is not classifiable.
pub fn infer_peer_type(address: &str, hint: Option<&str>) -> Option<PeerType> {
    classify(address).or_else(|| hint.and_then(classify))
}

fn classify(address: &str) -> Option<PeerType> {
    if address.starts_with("bt:") {
        Some(PeerType::Bt)
    } else if address.starts_with("dht:") {
        Some(PeerType::Dht)
    } else if address.starts_with("tunnel:") {
        Some(PeerType::Tunnel)
    } else if address.starts_with("net:") {
        let (host, _) = address::net_host_port(address)?;
        Some(if is_private(host) {
            PeerType::Lan
        } else {
            PeerType::Internet
        })
    } else {
        None
    }
}

/// Is `host` in a private, loopback or link-local range?
///
/// Hostnames other than `localhost` are not resolved and count as public.
pub fn is_private(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}
