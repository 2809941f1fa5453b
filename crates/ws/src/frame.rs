//! Binary frame reader and writer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Role, WsError};

/// Per-frame payload cap (16 MiB), matching the inner protocol's.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;

/// Reads one frame and returns its unmasked payload, or `None` when the peer
/// sent a close frame. Masking is honoured whenever the mask bit is set,
/// regardless of role.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>, WsError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;
    let length_code = head[1] & 0x7F;

    let length = match length_code {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await?;
            u64::from(u16::from_be_bytes(ext))
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => u64::from(n),
    };
    if length > MAX_FRAME_PAYLOAD as u64 {
        return Err(WsError::PayloadTooLarge(length));
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    if opcode == OPCODE_CLOSE {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Writes one binary frame with FIN set. Client frames carry a random
/// masking key; server frames are unmasked.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8], role: Role) -> Result<(), WsError>
where
    S: AsyncWrite + Unpin,
{
    write_with_opcode(stream, OPCODE_BINARY, payload, role).await
}

/// Writes a close frame so the peer's reader observes an orderly shutdown.
pub async fn write_close<S>(stream: &mut S, role: Role) -> Result<(), WsError>
where
    S: AsyncWrite + Unpin,
{
    write_with_opcode(stream, OPCODE_CLOSE, &[], role).await
}

async fn write_with_opcode<S>(
    stream: &mut S,
    opcode: u8,
    payload: &[u8],
    role: Role,
) -> Result<(), WsError>
where
    S: AsyncWrite + Unpin,
{
    let masked = role == Role::Client;
    let mut header = Vec::with_capacity(14);
    header.push(0x80 | opcode);

    let mask_bit = if masked { 0x80 } else { 0x00 };
    match payload.len() {
        n if n < 126 => header.push(mask_bit | n as u8),
        n if n < 65536 => {
            header.push(mask_bit | 126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(mask_bit | 127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    if masked {
        let key: [u8; 4] = rand::random();
        header.extend_from_slice(&key);
        let mut body = payload.to_vec();
        for (i, byte) in body.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        stream.write_all(&header).await?;
        stream.write_all(&body).await?;
    } else {
        stream.write_all(&header).await?;
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}
