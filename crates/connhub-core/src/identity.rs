//! Peer identity keys.
//!
//! An identity is rendered as `@<base64 of 32 bytes>.ed25519`. Inside an
//! address the same key appears bare (no `@`, no suffix) in the `shs:`
//! transform.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

pub const KEY_SIGIL: char = '@';
pub const KEY_SUFFIX: &str = ".ed25519";

/// Generate a fresh random identity. Used by transports that have no real
/// keypair behind them (tests, the plaintext TCP transport).
pub fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{KEY_SIGIL}{}{KEY_SUFFIX}", STANDARD.encode(bytes))
}

/// Does `key` look like `@<32 bytes base64>.ed25519`?
pub fn is_valid(key: &str) -> bool {
    key.strip_prefix(KEY_SIGIL)
        .and_then(|k| k.strip_suffix(KEY_SUFFIX))
        .map(decodes_to_key)
        .unwrap_or(false)
}

/// Turn the bare base64 found in an `shs:` transform into an identity.
pub fn from_shs(raw: &str) -> Option<String> {
    if decodes_to_key(raw) {
        Some(format!("{KEY_SIGIL}{raw}{KEY_SUFFIX}"))
    } else {
        None
    }
}

/// The bare base64 form of an identity, as written after `shs:`.
pub fn to_shs(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_SIGIL)
        .and_then(|k| k.strip_suffix(KEY_SUFFIX))
}

fn decodes_to_key(raw: &str) -> bool {
    matches!(STANDARD.decode(raw), Ok(bytes) if bytes.len() == 32)
}
