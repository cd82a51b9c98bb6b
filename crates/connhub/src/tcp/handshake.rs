//! Plaintext identity exchange over TCP.
//!
//! Each side writes `connhub/1 <key>\n` and reads the peer's line. The dialler
//! checks the announced key against the one in the address it dialled. No
//! secrecy or authentication; this only tells each side who it is talking to.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use connhub_core::identity;
use connhub_core::TransportError;

const PROTOCOL: &str = "connhub/1";
const MSG_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE: usize = 256;

pub(crate) struct Handshaken {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub peer_key: String,
}

/// Run the exchange. `expected` is the key the dialler expects; responders
/// pass `None` and accept any valid key.
pub(crate) async fn exchange(
    stream: TcpStream,
    local_key: &str,
    expected: Option<&str>,
) -> Result<Handshaken, TransportError> {
    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);

    writer
        .write_all(format!("{PROTOCOL} {local_key}\n").as_bytes())
        .await?;

    let mut line = String::new();
    let read = timeout(MSG_TIMEOUT, (&mut reader).take(MAX_LINE as u64).read_line(&mut line))
        .await
        .map_err(|_| TransportError::Timeout(MSG_TIMEOUT))??;
    if read == 0 {
        return Err(TransportError::Handshake("peer hung up during handshake".into()));
    }

    let peer_key = parse_hello(line.trim_end())?;
    if let Some(expected) = expected {
        if peer_key != expected {
            return Err(TransportError::Handshake(format!(
                "expected {expected}, peer is {peer_key}"
            )));
        }
    }
    tracing::trace!(peer = %peer_key, "handshake complete");

    Ok(Handshaken {
        reader,
        writer,
        peer_key,
    })
}

fn parse_hello(line: &str) -> Result<String, TransportError> {
    let key = line
        .strip_prefix(PROTOCOL)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| TransportError::Handshake(format!("unexpected hello {line:?}")))?;
    if !identity::is_valid(key) {
        return Err(TransportError::Handshake(format!("invalid key {key:?}")));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_hello() {
        let key = identity::generate();
        assert_eq!(parse_hello(&format!("connhub/1 {key}")).unwrap(), key);
    }

    #[test]
    fn rejects_other_protocols_and_bad_keys() {
        let key = identity::generate();
        assert!(parse_hello(&format!("connhub/2 {key}")).is_err());
        assert!(parse_hello("connhub/1 @short.ed25519").is_err());
        assert!(parse_hello("").is_err());
    }
}
