//! Guest-side control daemon.
//!
//! `vmboxd` listens on a TCP port the hypervisor forwards into the VM,
//! terminates WebSocket connections, and dispatches framed control messages:
//! process spawn/supervision (pipe or PTY backed, normally jailed through
//! `sandbox-helper`), per-uid session accounts, virtio-fs mounts, binary
//! installation, and bounded file reads.
//!
//! Registries live for the daemon lifetime and are shared across
//! connections; every connection gets its own reader task and a single
//! writer task fed through an unbounded channel, so response frames from
//! concurrent workers never interleave mid-frame.

pub mod fsops;
pub mod server;
pub mod session;
pub mod supervisor;

use thiserror::Error;

use vmbox_protocol::error_code;

/// Typed failures a handler can report to the peer. Each maps onto one of
/// the wire error codes.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("no such process: {0}")]
    ProcessNotFound(String),
    #[error("mount failed: {0}")]
    MountFailed(String),
    #[error("session provisioning failed: {0}")]
    UserCreateFailed(String),
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn code(&self) -> i32 {
        match self {
            Self::SpawnFailed(_) => error_code::SPAWN_FAILED,
            Self::ProcessNotFound(_) => error_code::PROCESS_NOT_FOUND,
            Self::MountFailed(_) => error_code::MOUNT_FAILED,
            Self::UserCreateFailed(_) => error_code::USER_CREATE_FAILED,
            Self::InstallFailed(_) => error_code::INSTALL_FAILED,
            Self::InvalidParams(_) => error_code::INVALID_PARAMS,
            Self::Internal(_) => error_code::INTERNAL_ERROR,
        }
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
