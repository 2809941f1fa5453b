//! HTTP upgrade handshake, both roles.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WsError;

/// Fixed GUID every conforming endpoint appends to the client key
/// (RFC 6455 §1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header blocks larger than this are not a handshake we want to parse.
const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// Derives the `Sec-WebSocket-Accept` value for a client key: SHA-1 over
/// `key || GUID`, base64 of the 20-byte digest.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Reads from `stream` until a blank line terminates the header block.
async fn read_header_block<S>(stream: &mut S) -> Result<String, WsError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_HEADER_BLOCK {
            return Err(WsError::HandshakeFailed(
                "header block exceeds 16 KiB".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(WsError::UnexpectedEof);
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf)
        .map_err(|_| WsError::HandshakeFailed("header block is not UTF-8".to_string()))
}

fn header_value<'a>(block: &'a str, name: &str) -> Option<&'a str> {
    block.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Performs the server half of the upgrade on a freshly accepted socket.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_header_block(stream).await?;
    let key = header_value(&request, "Sec-WebSocket-Key")
        .ok_or_else(|| WsError::HandshakeFailed("missing Sec-WebSocket-Key".to_string()))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Performs the client half of the upgrade and verifies the `101` status.
pub async fn client_handshake<S>(stream: &mut S, host: &str) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 16] = rand::random();
    let key = STANDARD.encode(nonce);
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response = read_header_block(stream).await?;
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.contains(" 101 ") {
        return Err(WsError::HandshakeFailed(format!(
            "expected 101, got: {status_line}"
        )));
    }
    match header_value(&response, "Sec-WebSocket-Accept") {
        Some(got) if got == accept_key(&key) => Ok(()),
        Some(got) => Err(WsError::HandshakeFailed(format!(
            "bad accept key: {got}"
        ))),
        None => Err(WsError::HandshakeFailed(
            "missing Sec-WebSocket-Accept".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_sample() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let block = "GET / HTTP/1.1\r\nsec-websocket-key: abc\r\n\r\n";
        assert_eq!(header_value(block, "Sec-WebSocket-Key"), Some("abc"));
        assert_eq!(header_value(block, "Host"), None);
    }
}
