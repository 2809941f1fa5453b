//! JSON payload schemas, one struct per frame type.
//!
//! Request fields the caller may omit carry `#[serde(default)]` so older
//! callers keep working; reply structs serialize every field they have and
//! skip absent options.

use serde::{Deserialize, Serialize};

fn default_seccomp_profile() -> String {
    "default".to_string()
}

// SIGTERM; this crate is pure data and does not pull in libc for one constant.
fn default_signal() -> i32 {
    15
}

fn default_true() -> bool {
    true
}

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub pty: bool,
    #[serde(default = "default_seccomp_profile")]
    pub seccomp_profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinRequest {
    pub id: u32,
    pub handle: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    pub id: u32,
    pub handle: String,
    #[serde(default = "default_signal")]
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub handle: String,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub tag: String,
    pub mount_point: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountRequest {
    pub mount_point: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDestroyRequest {
    pub uid: u32,
    #[serde(default)]
    pub delete_home: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryInstallRequest {
    pub name: String,
    /// Base64-encoded file contents.
    pub data: String,
    #[serde(default = "default_true")]
    pub executable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsReadRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsRunningRequest {
    pub handle: String,
}

// ── Replies ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spawned {
    pub id: u32,
    pub pid: u32,
    pub handle: String,
}

/// Payload of both `stdout` and `stderr` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub id: u32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exit {
    pub id: u32,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(default)]
    pub id: u32,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReply {
    /// Base64-encoded file contents.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningStatus {
    pub handle: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// `ok` payload of a successful `session_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: String,
}

/// Empty JSON object, used by `ping`/`pong` and bare `ok` replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_defaults_fill_in() {
        let req: SpawnRequest =
            serde_json::from_str(r#"{"id":1,"command":"/bin/true"}"#).expect("minimal spawn");
        assert!(req.args.is_empty());
        assert!(!req.network);
        assert!(!req.pty);
        assert_eq!(req.seccomp_profile, "default");
        assert!(req.cwd.is_none());
    }

    #[test]
    fn kill_signal_defaults_to_sigterm() {
        let req: KillRequest =
            serde_json::from_str(r#"{"handle":"proc-3"}"#).expect("minimal kill");
        assert_eq!(req.signal, 15);
    }

    #[test]
    fn exit_omits_absent_signal() {
        let json = serde_json::to_string(&Exit {
            id: 2,
            code: 0,
            signal: None,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"id":2,"code":0}"#);
    }

    #[test]
    fn binary_install_defaults_executable() {
        let req: BinaryInstallRequest =
            serde_json::from_str(r#"{"name":"tool","data":"AQID"}"#).expect("install");
        assert!(req.executable);
    }
}
