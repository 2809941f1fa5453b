//! Minimal RFC 6455 transport for the vmbox control channel.
//!
//! Binary frames only, no fragmentation, no extensions. The daemon side
//! performs the server half of the upgrade handshake and reads masked client
//! frames; the host client performs the mirror request and masks what it
//! sends. Both directions cap payloads at 16 MiB.

mod error;
mod frame;
mod handshake;

pub use error::WsError;
pub use frame::{MAX_FRAME_PAYLOAD, read_frame, write_close, write_frame};
pub use handshake::{accept_key, client_handshake, server_handshake};

/// Which side of the connection this endpoint is. Servers never mask,
/// clients always do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}
