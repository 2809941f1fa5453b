//! QEMU launch and boot probing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tracing::{debug, info};

/// Host ports tried for the control-channel forward.
const PORT_RANGE: std::ops::Range<u16> = 8080..8180;

/// Boot probe budget: 500 ms attempts for up to 60 s.
const BOOT_ATTEMPTS: u32 = 120;
const BOOT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(500);

/// Guest-side port the daemon listens on; the host forward targets it.
const GUEST_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub rootfs: PathBuf,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// (host path, mount tag) pairs exported over virtio-9p.
    pub shares: Vec<(String, String)>,
}

pub fn pidfile_path(port: u16) -> PathBuf {
    PathBuf::from(format!("/tmp/vmbox-{port}.pid"))
}

/// Builds the full QEMU argv for `cfg` with the control port forwarded from
/// `host_port`.
pub fn qemu_args(cfg: &VmConfig, host_port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-enable-kvm".into(),
        "-m".into(),
        "2048".into(),
        "-smp".into(),
        "2".into(),
        "-drive".into(),
        format!("file={},format=raw,if=virtio", cfg.rootfs.display()),
        "-netdev".into(),
        format!("user,id=net0,hostfwd=tcp:127.0.0.1:{host_port}-:{GUEST_PORT}"),
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
        "-display".into(),
        "none".into(),
        "-daemonize".into(),
        "-pidfile".into(),
        pidfile_path(host_port).display().to_string(),
    ];

    if let Some(kernel) = &cfg.kernel {
        args.push("-kernel".into());
        args.push(kernel.display().to_string());
        args.push("-append".into());
        args.push("console=ttyS0 root=/dev/vda rw".into());
    }
    if let Some(initrd) = &cfg.initrd {
        args.push("-initrd".into());
        args.push(initrd.display().to_string());
    }

    for (i, (host_path, tag)) in cfg.shares.iter().enumerate() {
        args.push("-fsdev".into());
        args.push(format!("local,id=fs{i},path={host_path},security_model=none"));
        args.push("-device".into());
        args.push(format!("virtio-9p-pci,fsdev=fs{i},mount_tag={tag}"));
    }

    args
}

/// First bindable port in the range; binding then dropping proves it free.
pub async fn find_free_port() -> Result<u16> {
    for port in PORT_RANGE {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
    }
    bail!("no free control port in {PORT_RANGE:?}")
}

/// Launches QEMU and waits for the guest daemon to accept connections.
/// Returns the forwarded host port.
pub async fn start(cfg: &VmConfig) -> Result<u16> {
    if !cfg.rootfs.is_file() {
        bail!("rootfs image not found: {}", cfg.rootfs.display());
    }

    let port = find_free_port().await?;
    let args = qemu_args(cfg, port);
    debug!(?args, "launching qemu");

    let output = Command::new("qemu-system-x86_64")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("launch qemu-system-x86_64")?;
    if !output.status.success() {
        bail!(
            "qemu failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!(port, "qemu launched, probing control port");
    if !probe(port).await {
        bail!("guest daemon did not come up on port {port} within 60s");
    }
    Ok(port)
}

/// Repeated connect attempts until the daemon answers or the budget runs out.
pub async fn probe(port: u16) -> bool {
    for attempt in 0..BOOT_ATTEMPTS {
        match tokio::time::timeout(
            BOOT_ATTEMPT_INTERVAL,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        {
            Ok(Ok(_)) => {
                debug!(port, attempt, "control port is up");
                return true;
            }
            _ => tokio::time::sleep(BOOT_ATTEMPT_INTERVAL).await,
        }
    }
    false
}

/// Terminates the QEMU process recorded in the pidfile. Returns false when
/// no pidfile exists.
pub fn stop_by_pidfile(port: u16) -> Result<bool> {
    let pidfile = pidfile_path(port);
    let raw = match std::fs::read_to_string(&pidfile) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).context(format!("read {}", pidfile.display())),
    };
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("pidfile {} is not a pid: {raw:?}", pidfile.display()))?;

    // SAFETY: plain kill(2) with SIGTERM on the recorded hypervisor pid.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone counts as stopped.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context(format!("kill {pid}"));
        }
    }
    let _ = std::fs::remove_file(&pidfile);
    info!(port, pid, "qemu stopped");
    Ok(true)
}
