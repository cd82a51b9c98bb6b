//! Multiserver address codec.
//!
//! An address is one or more `;`-separated alternatives. Each alternative is
//! a transport followed by zero or more transforms, joined by `~`; each part
//! is a protocol name followed by `:`-separated arguments:
//!
//!   net:10.0.0.4:8008~shs:<base64 key>
//!   dht:<seed>:<remote id>~noauth

use crate::error::HubError;
use crate::identity;

/// Prefix of addresses resolved through the DHT.
pub const DHT_PREFIX: &str = "dht:";

/// Syntax check. Does not resolve hosts or validate keys.
pub fn check(address: &str) -> bool {
    !address.is_empty() && address.split(';').all(check_alternative)
}

fn check_alternative(alt: &str) -> bool {
    !alt.is_empty() && alt.split('~').all(check_part)
}

fn check_part(part: &str) -> bool {
    let mut pieces = part.split(':');
    let name = pieces.next().unwrap_or_default();
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && pieces.all(|arg| !arg.is_empty() || part.starts_with("net:"))
}

/// Is this a DHT-form address?
///
/// The prefix match ignores case, unlike multiserver protocol names which are
/// case-sensitive. `DHT:...` is therefore routed here and rejected by
/// [`key_from_address`] instead of falling through to the `shs:` lookup as an
/// unknown protocol.
pub fn is_dht_address(address: &str) -> bool {
    address
        .get(..DHT_PREFIX.len())
        .map(|p| p.eq_ignore_ascii_case(DHT_PREFIX))
        .unwrap_or(false)
}

/// Infer the remote identity key from an address.
///
/// `Ok(None)` means the address carries no recognisable key. DHT addresses
/// (`dht:<seed>:<remoteId>`) must use the literal `dht` tag.
pub fn key_from_address(address: &str) -> Result<Option<String>, HubError> {
    if is_dht_address(address) {
        return key_from_dht_address(address).map(Some);
    }
    Ok(address
        .split(';')
        .flat_map(|alt| alt.split('~'))
        .find_map(|part| part.strip_prefix("shs:"))
        .and_then(|rest| rest.split(':').next())
        .and_then(identity::from_shs))
}

fn key_from_dht_address(address: &str) -> Result<String, HubError> {
    let transport = address.split('~').next().unwrap_or_default();
    let mut pieces = transport.split(':');
    let tag = pieces.next().unwrap_or_default();
    if tag != "dht" {
        return Err(HubError::InvalidAddress(format!("invalid DHT address {address}")));
    }
    let remote_id = pieces
        .nth(1)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HubError::InvalidAddress(format!("invalid DHT address {address}")))?;
    Ok(if remote_id.starts_with(identity::KEY_SIGIL) {
        remote_id.to_string()
    } else {
        format!("{}{remote_id}", identity::KEY_SIGIL)
    })
}

/// Host and port of the first `net:` transport in the address.
pub fn net_host_port(address: &str) -> Option<(&str, u16)> {
    let transport = address
        .split(';')
        .map(|alt| alt.split('~').next().unwrap_or_default())
        .find(|t| t.starts_with("net:"))?;
    let rest = &transport["net:".len()..];
    let (host, port) = rest.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Build a `net:` address with an `shs:` transform for the given identity.
pub fn net_address(host: &str, port: u16, key: &str) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    match identity::to_shs(key) {
        Some(raw) => format!("net:{host}:{port}~shs:{raw}"),
        None => format!("net:{host}:{port}"),
    }
}
