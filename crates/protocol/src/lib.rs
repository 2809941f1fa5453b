//! Control-plane wire protocol for the vmbox guest daemon.
//!
//! Every logical request or reply is one *inner frame* carried in a binary
//! WebSocket message:
//!
//! ```text
//! [type: u8] [payload_len: u32 LE] [payload: payload_len bytes]
//! ```
//!
//! Payloads are UTF-8 JSON objects whose schema is fixed per type; the
//! structs in [`messages`] mirror those schemas. Unknown type bytes are the
//! receiver's problem (the daemon ignores them), so [`Frame`] keeps the raw
//! tag and [`MessageType::from_u8`] is fallible.

mod frame;
pub mod messages;

pub use frame::{Frame, MAX_PAYLOAD, ProtocolError};

// ── Message types ────────────────────────────────────────────────────────────

/// Frame type tags. Requests sit in `0x01..=0x0C`, replies in `0x81..=0x89`,
/// keepalives in `0xF0`/`0xF1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Spawn = 0x01,
    Stdin = 0x02,
    Kill = 0x03,
    Resize = 0x04,
    Mount = 0x05,
    Unmount = 0x06,
    SessionCreate = 0x07,
    BinaryInstall = 0x08,
    FsRead = 0x09,
    LoadState = 0x0A,
    IsRunning = 0x0B,
    SessionDestroy = 0x0C,

    Spawned = 0x81,
    Stdout = 0x82,
    Stderr = 0x83,
    Exit = 0x84,
    Error = 0x85,
    Ok = 0x86,
    Data = 0x87,
    RunningStatus = 0x88,
    NetworkStatus = 0x89,

    Ping = 0xF0,
    Pong = 0xF1,
}

impl MessageType {
    /// Decodes a wire tag. Returns `None` for tags this protocol revision
    /// does not know, which receivers silently skip.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Spawn,
            0x02 => Self::Stdin,
            0x03 => Self::Kill,
            0x04 => Self::Resize,
            0x05 => Self::Mount,
            0x06 => Self::Unmount,
            0x07 => Self::SessionCreate,
            0x08 => Self::BinaryInstall,
            0x09 => Self::FsRead,
            0x0A => Self::LoadState,
            0x0B => Self::IsRunning,
            0x0C => Self::SessionDestroy,
            0x81 => Self::Spawned,
            0x82 => Self::Stdout,
            0x83 => Self::Stderr,
            0x84 => Self::Exit,
            0x85 => Self::Error,
            0x86 => Self::Ok,
            0x87 => Self::Data,
            0x88 => Self::RunningStatus,
            0x89 => Self::NetworkStatus,
            0xF0 => Self::Ping,
            0xF1 => Self::Pong,
            _ => return None,
        })
    }
}

// ── Error codes ──────────────────────────────────────────────────────────────

/// JSON-RPC-style numeric codes carried in `error` payloads.
pub mod error_code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SPAWN_FAILED: i32 = -32000;
    pub const PROCESS_NOT_FOUND: i32 = -32001;
    pub const MOUNT_FAILED: i32 = -32002;
    pub const USER_CREATE_FAILED: i32 = -32003;
    pub const INSTALL_FAILED: i32 = -32004;
}
