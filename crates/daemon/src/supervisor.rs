//! Process registry and lifecycle supervision.
//!
//! One [`Supervisor`] lives for the daemon lifetime. Each spawn mints an
//! opaque `proc-<n>` handle, wires the child's I/O (three pipes, or one PTY
//! master carrying all three streams), and starts the forwarding and reaping
//! tasks. Forwarders push `stdout`/`stderr` frames onto the spawning
//! connection's writer channel; the reaper waits for the child, drains the
//! forwarders, drops the record, and emits the final `exit` frame.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use vmbox_protocol::messages::{Exit, OutputChunk, SpawnRequest, Spawned};
use vmbox_protocol::{Frame, MessageType};
use vmbox_sandbox::Profile;

use crate::DaemonError;

/// Where the guest image installs the jail launcher.
const SANDBOX_HELPER: &str = "/usr/local/bin/sandbox-helper";

/// Read granularity for both pipe and PTY forwarders.
const FORWARD_BUF: usize = 4096;

/// Encoded inner frames bound for one connection's writer task.
pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// Write side of a child's stdin. PTY-backed children alias all three
/// standard streams onto the master, so the master appears here and in
/// [`ProcessRecord::pty`] as separate dup'd descriptors; each clone closes
/// exactly once on drop.
enum StdinSink {
    Pipe(ChildStdin),
    Pty(Arc<File>),
}

struct ProcessRecord {
    pid: u32,
    stdin: Arc<Mutex<StdinSink>>,
    /// PTY master clone used for resize and kept so the fd outlives any
    /// in-flight stdin write.
    pty: Option<Arc<File>>,
}

type Registry = Arc<Mutex<HashMap<String, ProcessRecord>>>;

#[derive(Default)]
pub struct Supervisor {
    procs: Registry,
    next_handle: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records; exits shrink it back.
    pub async fn len(&self) -> usize {
        self.procs.lock().await.len()
    }

    /// Spawns a child per `req` and emits `spawned` plus all subsequent
    /// output and exit frames on `out`. The `spawned` frame is queued before
    /// the forwarders start, so it always precedes the child's output.
    pub async fn spawn(
        &self,
        req: SpawnRequest,
        out: FrameSender,
    ) -> Result<Spawned, DaemonError> {
        // An unknown profile would otherwise surface later as a confusing
        // helper exit; reject it while we can still name the problem.
        let _: Profile = req
            .seccomp_profile
            .parse()
            .map_err(|_| DaemonError::SpawnFailed(format!(
                "unknown seccomp profile: {}",
                req.seccomp_profile
            )))?;

        let seq = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = format!("proc-{seq}");

        let argv = build_argv(&req);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        cmd.env("HOME", "/tmp");
        cmd.env("IS_SANDBOX", "yes");
        if req.pty {
            cmd.env("TERM", "xterm-256color");
        }

        if req.network {
            // No jail wrapper: the child drops credentials itself before exec.
            if let Some(gid) = req.gid.or(req.uid) {
                cmd.gid(gid);
            }
            if let Some(uid) = req.uid {
                cmd.uid(uid);
            }
            if let Some(cwd) = &req.cwd {
                let dir = CString::new(cwd.as_str())
                    .map_err(|_| DaemonError::InvalidParams("cwd contains NUL".to_string()))?;
                // SAFETY: the closure only calls async-signal-safe chdir.
                unsafe {
                    cmd.pre_exec(move || {
                        // A missing directory is not fatal for the child.
                        let _ = libc::chdir(dir.as_ptr());
                        Ok(())
                    });
                }
            }
        }

        let (child, stdin, stdout_src, pty_master) = if req.pty {
            let (master, slave) = open_pty_pair()
                .map_err(|err| DaemonError::SpawnFailed(format!("openpty: {err}")))?;
            cmd.stdin(Stdio::from(slave.try_clone().map_err(io_spawn)?));
            cmd.stdout(Stdio::from(slave.try_clone().map_err(io_spawn)?));
            cmd.stderr(Stdio::from(slave));
            // SAFETY: setsid and ioctl are async-signal-safe; fd 0 is the
            // slave after the stdio dups.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            let child = cmd.spawn().map_err(io_spawn)?;
            let master = Arc::new(master);
            let reader = master
                .try_clone()
                .map_err(io_spawn)?;
            (
                child,
                StdinSink::Pty(master.clone()),
                OutputSource::Pty(reader),
                Some(master),
            )
        } else {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            let mut child = cmd.spawn().map_err(io_spawn)?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| DaemonError::SpawnFailed("child stdin missing".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| DaemonError::SpawnFailed("child stdout missing".to_string()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| DaemonError::SpawnFailed("child stderr missing".to_string()))?;
            (
                child,
                StdinSink::Pipe(stdin),
                OutputSource::Pipes { stdout, stderr },
                None,
            )
        };

        let pid = child
            .id()
            .ok_or_else(|| DaemonError::SpawnFailed("child exited before registration".to_string()))?;

        let record = ProcessRecord {
            pid,
            stdin: Arc::new(Mutex::new(stdin)),
            pty: pty_master,
        };
        self.procs.lock().await.insert(handle.clone(), record);

        let spawned = Spawned {
            id: req.id,
            pid,
            handle: handle.clone(),
        };
        send_json(&out, MessageType::Spawned, &spawned);
        info!(handle = %handle, pid, command = %req.command, pty = req.pty, network = req.network, "spawned child");

        let forwarders = start_forwarders(req.id, stdout_src, out.clone());
        start_reaper(
            self.procs.clone(),
            handle.clone(),
            req.id,
            child,
            forwarders,
            out,
        );

        Ok(spawned)
    }

    /// Writes `data` into the child's stdin. Unknown handles are ignored,
    /// matching the wire contract.
    pub async fn write_stdin(&self, handle: &str, data: &[u8]) {
        let sink = match self.procs.lock().await.get(handle) {
            Some(record) => record.stdin.clone(),
            None => {
                debug!(handle, "stdin for unknown handle dropped");
                return;
            }
        };
        let mut sink = sink.lock().await;
        match &mut *sink {
            StdinSink::Pipe(stdin) => {
                if let Err(err) = stdin.write_all(data).await {
                    warn!(handle, ?err, "stdin write failed");
                }
            }
            StdinSink::Pty(master) => {
                let master = master.clone();
                let data = data.to_vec();
                let result = tokio::task::spawn_blocking(move || {
                    use std::io::Write;
                    (&*master).write_all(&data)
                })
                .await;
                if let Ok(Err(err)) = result {
                    warn!(handle, ?err, "pty write failed");
                }
            }
        }
    }

    /// Delivers `signal` to the child. Unknown handles are ignored.
    pub async fn kill(&self, handle: &str, signal: i32) {
        let pid = match self.procs.lock().await.get(handle) {
            Some(record) => record.pid,
            None => {
                debug!(handle, "kill for unknown handle dropped");
                return;
            }
        };
        // SAFETY: plain kill(2) on a pid we spawned.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            warn!(handle, pid, signal, "kill failed: {}", std::io::Error::last_os_error());
        }
    }

    /// Updates the PTY window size. A no-op for pipe-backed children.
    pub async fn resize(&self, handle: &str, rows: u16, cols: u16) {
        let master = match self.procs.lock().await.get(handle) {
            Some(record) => record.pty.clone(),
            None => {
                debug!(handle, "resize for unknown handle dropped");
                return;
            }
        };
        let Some(master) = master else { return };
        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ with a valid winsize on an open master fd.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc != 0 {
            warn!(handle, rows, cols, "resize failed: {}", std::io::Error::last_os_error());
        }
    }

    /// Liveness probe: signal 0 tells whether the pid still exists.
    pub async fn status(&self, handle: &str) -> (bool, Option<u32>) {
        let pid = match self.procs.lock().await.get(handle) {
            Some(record) => record.pid,
            None => return (false, None),
        };
        // SAFETY: kill with signal 0 only checks deliverability.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        (alive, Some(pid))
    }
}

/// Waits for the child, drains the forwarders so buffered output is flushed,
/// removes the record, and emits the `exit` frame last. Removal-before-emit
/// means `is_running` can never report a handle the peer already saw exit.
fn start_reaper(
    procs: Registry,
    handle: String,
    id: u32,
    mut child: Child,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
    out: FrameSender,
) {
    tokio::spawn(async move {
        let status = child.wait().await;
        for task in forwarders {
            let _ = task.await;
        }

        let (code, signal) = match status {
            Ok(status) => exit_code_of(status),
            Err(err) => {
                warn!(handle = %handle, ?err, "wait on child failed");
                (-1, None)
            }
        };

        procs.lock().await.remove(&handle);
        info!(handle = %handle, code, "child exited");
        send_json(&out, MessageType::Exit, &Exit { id, code, signal });
    });
}

enum OutputSource {
    Pipes {
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
    },
    /// Master carries stdout and stderr folded together.
    Pty(File),
}

/// Starts one forwarding task per output stream. Each stops on EOF or I/O
/// error; the reaper joins them before announcing the exit.
fn start_forwarders(
    id: u32,
    source: OutputSource,
    out: FrameSender,
) -> Vec<tokio::task::JoinHandle<()>> {
    match source {
        OutputSource::Pipes { stdout, stderr } => vec![
            tokio::spawn(forward_pipe(id, stdout, MessageType::Stdout, out.clone())),
            tokio::spawn(forward_pipe(id, stderr, MessageType::Stderr, out)),
        ],
        OutputSource::Pty(master) => vec![tokio::task::spawn_blocking(move || {
            forward_pty(id, master, out)
        })],
    }
}

async fn forward_pipe<R>(id: u32, mut reader: R, ty: MessageType, out: FrameSender)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; FORWARD_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    id,
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                send_json(&out, ty, &chunk);
            }
        }
    }
}

/// Blocking PTY read loop; the master returns EIO once the last slave
/// descriptor is gone, which ends the forwarder.
fn forward_pty(id: u32, mut master: File, out: FrameSender) {
    let mut buf = [0u8; FORWARD_BUF];
    loop {
        match master.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    id,
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                send_json(&out, MessageType::Stdout, &chunk);
            }
        }
    }
}

/// Builds the final argv: the jail wrapper plus flags for sandboxed spawns,
/// the bare command otherwise.
fn build_argv(req: &SpawnRequest) -> Vec<String> {
    let mut argv = Vec::with_capacity(req.args.len() + 8);
    if !req.network {
        argv.push(SANDBOX_HELPER.to_string());
        if let Some(uid) = req.uid {
            argv.push(format!("--uid={uid}"));
        }
        if let Some(gid) = req.gid {
            argv.push(format!("--gid={gid}"));
        }
        argv.push("--no-network".to_string());
        argv.push(format!("--seccomp={}", req.seccomp_profile));
        if let Some(cwd) = &req.cwd {
            argv.push(format!("--cwd={cwd}"));
        }
        argv.push("--".to_string());
    }
    argv.push(req.command.clone());
    argv.extend(req.args.iter().cloned());
    argv
}

/// Standard status decoding: the exit code when the child exited, -1 plus
/// the signal number when it was killed.
fn exit_code_of(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => (code, None),
        None => (-1, status.signal()),
    }
}

fn io_spawn(err: std::io::Error) -> DaemonError {
    DaemonError::SpawnFailed(err.to_string())
}

fn send_json<T: serde::Serialize>(out: &FrameSender, ty: MessageType, body: &T) {
    match Frame::json(ty, body) {
        Ok(frame) => {
            let _ = out.send(frame.encode());
        }
        Err(err) => warn!(?err, "response frame serialization failed"),
    }
}

/// Opens a master/slave PTY pair with the slave ready for a child to adopt
/// as its controlling terminal.
fn open_pty_pair() -> std::io::Result<(File, File)> {
    // SAFETY: each syscall's result is checked before the fd is used; the
    // raw fds are wrapped in Files exactly once.
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        if master < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::grantpt(master) != 0 || libc::unlockpt(master) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(master);
            return Err(err);
        }
        let mut name = [0 as libc::c_char; 128];
        if libc::ptsname_r(master, name.as_mut_ptr(), name.len()) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(master);
            return Err(err);
        }
        let slave = libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
        if slave < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(master);
            return Err(err);
        }
        Ok((File::from_raw_fd(master), File::from_raw_fd(slave)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_request(command: &str, args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            id: 1,
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            uid: None,
            gid: None,
            network: true,
            pty: false,
            seccomp_profile: "default".to_string(),
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> anyhow::Result<Frame> {
        let bytes = timeout(Duration::from_secs(10), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("frame channel closed"))?;
        Ok(Frame::decode(&bytes)?)
    }

    /// Collects frames until the exit frame arrives, inclusive.
    async fn frames_until_exit(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> anyhow::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(rx).await?;
            let done = frame.tag == MessageType::Exit as u8;
            frames.push(frame);
            if done {
                return Ok(frames);
            }
        }
    }

    #[test]
    fn sandboxed_argv_wraps_command() {
        let mut req = spawn_request("/bin/echo", &["hi"]);
        req.network = false;
        req.uid = Some(2001);
        req.seccomp_profile = "minimal".to_string();
        let argv = build_argv(&req);
        assert_eq!(
            argv,
            vec![
                SANDBOX_HELPER.to_string(),
                "--uid=2001".to_string(),
                "--no-network".to_string(),
                "--seccomp=minimal".to_string(),
                "--".to_string(),
                "/bin/echo".to_string(),
                "hi".to_string(),
            ]
        );
    }

    #[test]
    fn raw_argv_is_bare() {
        let argv = build_argv(&spawn_request("/bin/sh", &["-c", "exit 7"]));
        assert_eq!(argv, vec!["/bin/sh", "-c", "exit 7"]);
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected_before_fork() {
        let supervisor = Supervisor::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut req = spawn_request("/bin/true", &[]);
        req.network = false;
        req.seccomp_profile = "chrome".to_string();
        let err = supervisor.spawn(req, tx).await.expect_err("bad profile");
        assert!(matches!(err, DaemonError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn echo_emits_spawned_stdout_exit_in_order() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = supervisor
            .spawn(spawn_request("/bin/echo", &["hi"]), tx)
            .await?;
        assert_eq!(spawned.handle, "proc-0");

        let frames = frames_until_exit(&mut rx).await?;
        assert_eq!(frames[0].tag, MessageType::Spawned as u8);
        let stdout: String = frames
            .iter()
            .filter(|f| f.tag == MessageType::Stdout as u8)
            .map(|f| f.parse::<OutputChunk>().expect("stdout chunk").data)
            .collect();
        assert_eq!(stdout, "hi\n");
        let exit: Exit = frames.last().expect("exit frame").parse()?;
        assert_eq!(exit.code, 0);
        assert_eq!(exit.signal, None);
        assert_eq!(supervisor.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn raw_exit_code_is_preserved() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        supervisor
            .spawn(spawn_request("/bin/sh", &["-c", "exit 7"]), tx)
            .await?;
        let frames = frames_until_exit(&mut rx).await?;
        let exit: Exit = frames.last().expect("exit frame").parse()?;
        assert_eq!(exit.code, 7);
        Ok(())
    }

    #[tokio::test]
    async fn stdin_reaches_cat_and_kill_terminates_it() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = supervisor
            .spawn(spawn_request("/bin/cat", &[]), tx)
            .await?;

        let first = next_frame(&mut rx).await?;
        assert_eq!(first.tag, MessageType::Spawned as u8);

        supervisor.write_stdin(&spawned.handle, b"abc").await;
        let echoed = next_frame(&mut rx).await?;
        assert_eq!(echoed.tag, MessageType::Stdout as u8);
        assert_eq!(echoed.parse::<OutputChunk>()?.data, "abc");

        supervisor.kill(&spawned.handle, libc::SIGKILL).await;
        let frames = frames_until_exit(&mut rx).await?;
        let exit: Exit = frames.last().expect("exit frame").parse()?;
        assert_eq!(exit.code, -1);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        Ok(())
    }

    #[tokio::test]
    async fn status_tracks_the_lifecycle() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawned = supervisor
            .spawn(spawn_request("/bin/sleep", &["60"]), tx)
            .await?;

        let (running, pid) = supervisor.status(&spawned.handle).await;
        assert!(running);
        assert_eq!(pid, Some(spawned.pid));

        supervisor.kill(&spawned.handle, libc::SIGKILL).await;
        frames_until_exit(&mut rx).await?;

        let (running, pid) = supervisor.status(&spawned.handle).await;
        assert!(!running);
        assert_eq!(pid, None);
        Ok(())
    }

    #[tokio::test]
    async fn pty_spawn_folds_output_onto_stdout() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut req = spawn_request("/bin/echo", &["tty-check"]);
        req.pty = true;
        supervisor.spawn(req, tx).await?;

        let frames = frames_until_exit(&mut rx).await?;
        let stdout: String = frames
            .iter()
            .filter(|f| f.tag == MessageType::Stdout as u8)
            .map(|f| f.parse::<OutputChunk>().expect("stdout chunk").data)
            .collect();
        // The line discipline turns the trailing newline into CRLF.
        assert!(stdout.contains("tty-check"), "got: {stdout:?}");
        assert!(
            frames.iter().all(|f| f.tag != MessageType::Stderr as u8),
            "pty children have no separate stderr stream"
        );
        Ok(())
    }

    #[tokio::test]
    async fn handles_are_minted_sequentially() -> anyhow::Result<()> {
        let supervisor = Supervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = supervisor
            .spawn(spawn_request("/bin/true", &[]), tx.clone())
            .await?;
        let second = supervisor.spawn(spawn_request("/bin/true", &[]), tx).await?;
        assert_eq!(first.handle, "proc-0");
        assert_eq!(second.handle, "proc-1");
        frames_until_exit(&mut rx).await?;
        frames_until_exit(&mut rx).await?;
        Ok(())
    }
}
