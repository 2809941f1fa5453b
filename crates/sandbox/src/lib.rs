//! Per-process jail construction for the vmbox guest.
//!
//! A [`SandboxSpec`] captures everything the daemon knows about one spawn:
//! namespaces, identity, mounts, environment policy, and the seccomp
//! profile. [`SandboxSpec::bwrap_args`] translates it into a bubblewrap
//! invocation; the `sandbox-helper` binary performs that translation and
//! execs `bwrap`, handing the compiled BPF program over on a memfd so the
//! filter lands after jail construction, right before the target exec.

pub mod seccomp;

use std::path::Path;

use thiserror::Error;

pub use seccomp::Profile;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unknown seccomp profile: {0}")]
    UnknownProfile(String),
    #[error("invalid bind mount spec: {0}")]
    BadBindSpec(String),
    #[error("seccomp setup failed: {0}")]
    SeccompSetupFailed(std::io::Error),
}

/// One bind mount, host path to jail path. `SRC[:DEST]` on the CLI; a bare
/// `SRC` binds to the same path inside the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src: String,
    pub dest: String,
}

impl BindMount {
    pub fn parse(spec: &str) -> Result<Self, SandboxError> {
        let (src, dest) = match spec.split_once(':') {
            Some((src, dest)) => (src, dest),
            None => (spec, spec),
        };
        if src.is_empty() || dest.is_empty() {
            return Err(SandboxError::BadBindSpec(spec.to_string()));
        }
        Ok(Self {
            src: src.to_string(),
            dest: dest.to_string(),
        })
    }
}

/// System paths mounted read-only into every jail when they exist on the
/// guest root.
const DEFAULT_RO_PATHS: &[&str] = &[
    "/usr",
    "/lib",
    "/lib64",
    "/bin",
    "/sbin",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/passwd",
    "/etc/group",
    "/etc/ssl",
    "/etc/ca-certificates",
];

/// tmpfs overlays every jail gets.
const DEFAULT_TMPFS: &[&str] = &["/tmp", "/run", "/var/tmp"];

/// Everything needed to build one jail.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub hostname: String,
    pub network: bool,
    pub new_session: bool,
    pub die_with_parent: bool,
    pub ro_binds: Vec<BindMount>,
    pub rw_binds: Vec<BindMount>,
    pub tmpfs: Vec<String>,
    pub unset_env: Vec<String>,
    pub set_env: Vec<(String, String)>,
    pub cwd: Option<String>,
    pub profile: Profile,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            hostname: "sandbox".to_string(),
            network: false,
            new_session: true,
            die_with_parent: true,
            ro_binds: Vec::new(),
            rw_binds: Vec::new(),
            tmpfs: Vec::new(),
            unset_env: Vec::new(),
            set_env: Vec::new(),
            cwd: None,
            profile: Profile::Default,
        }
    }
}

impl SandboxSpec {
    /// Translates the spec into bubblewrap arguments, up to but not
    /// including the `--` and target command. `path_exists` gates the
    /// default read-only overlay so tests can pin the visible root.
    pub fn bwrap_args_with<F>(&self, seccomp_fd: Option<i32>, path_exists: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| {
            args.extend(parts.iter().map(|s| s.to_string()));
        };

        push(&[
            "--unshare-user",
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-cgroup",
        ]);
        if !self.network {
            push(&["--unshare-net"]);
        }
        push(&["--hostname", &self.hostname]);
        if let Some(uid) = self.uid {
            push(&["--uid", &uid.to_string()]);
        }
        if let Some(gid) = self.gid {
            push(&["--gid", &gid.to_string()]);
        }

        for path in DEFAULT_RO_PATHS {
            if path_exists(path) {
                push(&["--ro-bind", path, path]);
            }
        }
        for bind in &self.ro_binds {
            push(&["--ro-bind", &bind.src, &bind.dest]);
        }
        for bind in &self.rw_binds {
            push(&["--bind", &bind.src, &bind.dest]);
        }

        for path in DEFAULT_TMPFS {
            push(&["--tmpfs", path]);
        }
        for path in &self.tmpfs {
            push(&["--tmpfs", path]);
        }

        push(&["--proc", "/proc", "--dev", "/dev"]);

        for name in &self.unset_env {
            push(&["--unsetenv", name]);
        }
        for (name, value) in &self.set_env {
            push(&["--setenv", name, value]);
        }
        push(&["--setenv", "PATH", "/usr/local/bin:/usr/bin:/bin"]);
        push(&["--setenv", "HOME", "/tmp"]);
        push(&["--setenv", "TERM", "xterm-256color"]);
        push(&["--setenv", "IS_SANDBOX", "yes"]);

        if self.new_session {
            push(&["--new-session"]);
        }
        if self.die_with_parent {
            push(&["--die-with-parent"]);
        }
        if let Some(cwd) = &self.cwd {
            push(&["--chdir", cwd]);
        }
        if let Some(fd) = seccomp_fd {
            push(&["--seccomp", &fd.to_string()]);
        }
        args
    }

    /// [`Self::bwrap_args_with`] against the real filesystem.
    pub fn bwrap_args(&self, seccomp_fd: Option<i32>) -> Vec<String> {
        self.bwrap_args_with(seccomp_fd, |p| Path::new(p).exists())
    }
}
