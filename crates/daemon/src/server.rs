//! Accept loop and per-connection dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vmbox_protocol::messages::{
    BinaryInstallRequest, DataReply, Empty, ErrorReply, FsReadRequest, IsRunningRequest,
    KillRequest, MountRequest, ResizeRequest, RunningStatus, SessionCreateRequest,
    SessionDestroyRequest, SpawnRequest, StdinRequest, UnmountRequest,
};
use vmbox_protocol::{Frame, MessageType};
use vmbox_ws::{Role, read_frame, server_handshake, write_close, write_frame};

use crate::session::{SessionManager, ShellAccounts, SystemAccounts};
use crate::supervisor::{FrameSender, Supervisor};
use crate::{DaemonError, fsops};

/// Daemon-lifetime state shared by every connection.
pub struct Daemon {
    supervisor: Supervisor,
    sessions: SessionManager,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    pub fn new() -> Self {
        Self::with_accounts(Arc::new(ShellAccounts))
    }

    pub fn with_accounts(accounts: Arc<dyn SystemAccounts>) -> Self {
        Self {
            supervisor: Supervisor::new(),
            sessions: SessionManager::new(accounts),
        }
    }

    /// Test seam: sessions rooted somewhere other than `/home`.
    pub fn with_accounts_and_home_root(
        accounts: Arc<dyn SystemAccounts>,
        home_root: std::path::PathBuf,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(),
            sessions: SessionManager::with_home_root(accounts, home_root),
        }
    }

    /// Runs the accept loop forever. Each connection gets its own task; a
    /// connection failure never takes the daemon down.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let daemon = Arc::new(self);
        loop {
            let (stream, peer) = listener.accept().await?;
            let daemon = daemon.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(daemon, stream, peer).await {
                    warn!(%peer, ?err, "connection handler failed");
                }
            });
        }
    }
}

async fn handle_connection(
    daemon: Arc<Daemon>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    server_handshake(&mut stream).await?;
    info!(%peer, "control connection established");

    let (mut read_half, mut write_half) = stream.into_split();

    // Single writer task; handlers and per-process workers queue encoded
    // inner frames and never touch the socket themselves.
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut write_half, &frame, Role::Server)
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = write_close(&mut write_half, Role::Server).await;
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(payload)) => match Frame::decode(&payload) {
                Ok(frame) => dispatch(&daemon, frame, &tx).await,
                Err(err) => debug!(%peer, ?err, "undecodable frame skipped"),
            },
            Ok(None) => {
                info!(%peer, "peer closed the connection");
                break;
            }
            Err(err) => {
                debug!(%peer, ?err, "read failed, closing");
                break;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// One message in, zero or more frames out. Handler failures become typed
/// `error` frames; they never end the dispatch loop.
async fn dispatch(daemon: &Arc<Daemon>, frame: Frame, out: &FrameSender) {
    let Some(ty) = frame.message_type() else {
        debug!(tag = frame.tag, "unknown message type ignored");
        return;
    };

    match ty {
        MessageType::Ping => send(out, MessageType::Pong, &Empty {}),
        MessageType::Spawn => {
            let req: SpawnRequest = match parse(&frame, out) {
                Some(req) => req,
                None => return,
            };
            let id = req.id;
            // The supervisor emits `spawned` itself so it lands ahead of any
            // child output; only the failure path replies here.
            if let Err(err) = daemon.supervisor.spawn(req, out.clone()).await {
                error!(id, %err, "spawn failed");
                send_error(out, id, &err);
            }
        }
        MessageType::Stdin => {
            if let Some(req) = parse::<StdinRequest>(&frame, out) {
                daemon
                    .supervisor
                    .write_stdin(&req.handle, req.data.as_bytes())
                    .await;
            }
        }
        MessageType::Kill => {
            if let Some(req) = parse::<KillRequest>(&frame, out) {
                daemon.supervisor.kill(&req.handle, req.signal).await;
            }
        }
        MessageType::Resize => {
            if let Some(req) = parse::<ResizeRequest>(&frame, out) {
                daemon.supervisor.resize(&req.handle, req.rows, req.cols).await;
            }
        }
        MessageType::Mount => {
            if let Some(req) = parse::<MountRequest>(&frame, out) {
                reply_ok_or_error(
                    out,
                    fsops::mount_virtiofs(&req.tag, &req.mount_point, req.read_only).await,
                );
            }
        }
        MessageType::Unmount => {
            if let Some(req) = parse::<UnmountRequest>(&frame, out) {
                reply_ok_or_error(out, fsops::unmount(&req.mount_point).await);
            }
        }
        MessageType::SessionCreate => {
            if let Some(req) = parse::<SessionCreateRequest>(&frame, out) {
                match daemon.sessions.create(req.uid, req.username).await {
                    Ok(info) => send(out, MessageType::Ok, &info),
                    Err(err) => send_error(out, 0, &err),
                }
            }
        }
        MessageType::SessionDestroy => {
            if let Some(req) = parse::<SessionDestroyRequest>(&frame, out) {
                reply_ok_or_error(
                    out,
                    daemon.sessions.destroy(req.uid, req.delete_home).await,
                );
            }
        }
        MessageType::BinaryInstall => {
            if let Some(req) = parse::<BinaryInstallRequest>(&frame, out) {
                reply_ok_or_error(
                    out,
                    fsops::install_binary(&req.name, &req.data, req.executable)
                        .await
                        .map(|_| ()),
                );
            }
        }
        MessageType::FsRead | MessageType::LoadState => {
            if let Some(req) = parse::<FsReadRequest>(&frame, out) {
                match fsops::read_file(&req.path).await {
                    Ok(bytes) => send(
                        out,
                        MessageType::Data,
                        &DataReply {
                            data: STANDARD.encode(bytes),
                        },
                    ),
                    Err(err) => send_error(out, 0, &err),
                }
            }
        }
        MessageType::IsRunning => {
            if let Some(req) = parse::<IsRunningRequest>(&frame, out) {
                let (running, pid) = daemon.supervisor.status(&req.handle).await;
                send(
                    out,
                    MessageType::RunningStatus,
                    &RunningStatus {
                        handle: req.handle,
                        running,
                        pid,
                    },
                );
            }
        }
        // Reply and keepalive frames arriving at the daemon are peer bugs;
        // skip them the same way unknown tags are skipped.
        MessageType::Spawned
        | MessageType::Stdout
        | MessageType::Stderr
        | MessageType::Exit
        | MessageType::Error
        | MessageType::Ok
        | MessageType::Data
        | MessageType::RunningStatus
        | MessageType::NetworkStatus
        | MessageType::Pong => {
            debug!(tag = frame.tag, "reply-typed frame ignored");
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame, out: &FrameSender) -> Option<T> {
    match frame.parse() {
        Ok(req) => Some(req),
        Err(err) => {
            send_error(out, 0, &DaemonError::InvalidParams(err.to_string()));
            None
        }
    }
}

fn reply_ok_or_error(out: &FrameSender, result: Result<(), DaemonError>) {
    match result {
        Ok(()) => send(out, MessageType::Ok, &Empty {}),
        Err(err) => send_error(out, 0, &err),
    }
}

fn send<T: serde::Serialize>(out: &FrameSender, ty: MessageType, body: &T) {
    match Frame::json(ty, body) {
        Ok(frame) => {
            let _ = out.send(frame.encode());
        }
        Err(err) => warn!(?err, "reply serialization failed"),
    }
}

fn send_error(out: &FrameSender, id: u32, err: &DaemonError) {
    send(
        out,
        MessageType::Error,
        &ErrorReply {
            id,
            code: err.code(),
            message: err.to_string(),
        },
    );
}
