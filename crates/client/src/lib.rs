//! Host-side client for the vmbox guest daemon.
//!
//! One [`VmClient`] owns one WebSocket. A background reader correlates
//! `spawned`/`error` replies with their originating `spawn` call through
//! per-id oneshot channels, pairs serial request/acknowledge exchanges
//! through a FIFO of waiters, and surfaces everything else (child output,
//! exits, unsolicited errors) as a typed [`ClientEvent`] stream the caller
//! consumes at its own pace.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use vmbox_protocol::messages::{
    BinaryInstallRequest, DataReply, Empty, ErrorReply, FsReadRequest, IsRunningRequest,
    KillRequest, MountRequest, ResizeRequest, RunningStatus, SessionCreateRequest,
    SessionDestroyRequest, SessionInfo, SpawnRequest, Spawned, StdinRequest, UnmountRequest,
};
use vmbox_protocol::{Frame, MessageType, ProtocolError};
use vmbox_ws::{Role, WsError, client_handshake, read_frame, write_close, write_frame};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("daemon error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("connection closed")]
    Closed,
    #[error("reply had an unexpected shape: {0}")]
    UnexpectedReply(String),
}

impl From<ErrorReply> for ClientError {
    fn from(reply: ErrorReply) -> Self {
        Self::Remote {
            code: reply.code,
            message: reply.message,
        }
    }
}

/// Everything the daemon pushes that is not a direct reply to an in-flight
/// request.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Stdout { id: u32, data: String },
    Stderr { id: u32, data: String },
    Exit { id: u32, code: i32, signal: Option<i32> },
    Error { id: u32, code: i32, message: String },
    /// The transport went away; no further events will arrive.
    Closed,
}

/// Spawn parameters beyond command and args.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub network: bool,
    pub pty: bool,
    pub seccomp_profile: String,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            uid: None,
            gid: None,
            network: false,
            pty: false,
            seccomp_profile: "default".to_string(),
        }
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Replies that answer exactly one request on an otherwise serial channel.
enum AckReply {
    Ok(serde_json::Value),
    Data(DataReply),
    Running(RunningStatus),
    Error(ErrorReply),
}

#[derive(Default)]
struct Shared {
    pending_spawns: Mutex<HashMap<u32, oneshot::Sender<Result<Spawned, ErrorReply>>>>,
    pending_acks: Mutex<VecDeque<oneshot::Sender<AckReply>>>,
    pong_waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

pub struct VmClient {
    out: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
    next_id: AtomicU32,
}

impl VmClient {
    /// Connects, completes the upgrade handshake, and starts the reader and
    /// writer tasks. Returns the client plus its event stream.
    pub async fn connect(
        host: &str,
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        client_handshake(&mut stream, &format!("{host}:{port}")).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (out, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                let result = match item {
                    Outgoing::Frame(frame) => {
                        write_frame(&mut write_half, &frame, Role::Client).await
                    }
                    Outgoing::Close => {
                        let _ = write_close(&mut write_half, Role::Client).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::new(Shared::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(Some(payload)) => {
                            if let Err(err) = route_frame(&shared, &events, &payload).await {
                                debug!(?err, "undecodable frame skipped");
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                // Dropping the waiters wakes every blocked caller with
                // `Closed`; the event stream gets a final marker.
                shared.pending_spawns.lock().await.clear();
                shared.pending_acks.lock().await.clear();
                shared.pong_waiters.lock().await.clear();
                let _ = events.send(ClientEvent::Closed);
            });
        }

        Ok((
            Self {
                out,
                shared,
                next_id: AtomicU32::new(1),
            },
            events_rx,
        ))
    }

    /// Spawns a jailed, network-less child.
    pub async fn spawn(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Spawned, ClientError> {
        self.spawn_with(SpawnOptions::new(command, args)).await
    }

    /// Spawns with host network and no jail wrapper.
    pub async fn spawn_raw(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Spawned, ClientError> {
        let mut opts = SpawnOptions::new(command, args);
        opts.network = true;
        self.spawn_with(opts).await
    }

    /// Sends a `spawn` and blocks until its `spawned` or `error` reply.
    pub async fn spawn_with(&self, opts: SpawnOptions) -> Result<Spawned, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending_spawns.lock().await.insert(id, reply_tx);

        let request = SpawnRequest {
            id,
            command: opts.command,
            args: opts.args,
            cwd: opts.cwd,
            uid: opts.uid,
            gid: opts.gid,
            network: opts.network,
            pty: opts.pty,
            seccomp_profile: opts.seccomp_profile,
        };
        if let Err(err) = self.send(MessageType::Spawn, &request) {
            self.shared.pending_spawns.lock().await.remove(&id);
            return Err(err);
        }

        match reply_rx.await {
            Ok(Ok(spawned)) => Ok(spawned),
            Ok(Err(reply)) => Err(reply.into()),
            Err(_) => Err(ClientError::Closed),
        }
    }

    pub async fn send_stdin(
        &self,
        id: u32,
        handle: &str,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(
            MessageType::Stdin,
            &StdinRequest {
                id,
                handle: handle.to_string(),
                data: data.into(),
            },
        )
    }

    pub async fn kill(&self, handle: &str, signal: i32) -> Result<(), ClientError> {
        self.send(
            MessageType::Kill,
            &KillRequest {
                id: 0,
                handle: handle.to_string(),
                signal,
            },
        )
    }

    pub async fn resize(&self, handle: &str, rows: u16, cols: u16) -> Result<(), ClientError> {
        self.send(
            MessageType::Resize,
            &ResizeRequest {
                handle: handle.to_string(),
                rows,
                cols,
            },
        )
    }

    /// Round-trips a keepalive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pong_waiters.lock().await.push_back(tx);
        self.send(MessageType::Ping, &Empty {})?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn mount(
        &self,
        tag: &str,
        mount_point: &str,
        read_only: bool,
    ) -> Result<(), ClientError> {
        let reply = self
            .request_ack(
                MessageType::Mount,
                &MountRequest {
                    tag: tag.to_string(),
                    mount_point: mount_point.to_string(),
                    read_only,
                },
            )
            .await?;
        expect_ok(reply).map(|_| ())
    }

    pub async fn unmount(&self, mount_point: &str) -> Result<(), ClientError> {
        let reply = self
            .request_ack(
                MessageType::Unmount,
                &UnmountRequest {
                    mount_point: mount_point.to_string(),
                },
            )
            .await?;
        expect_ok(reply).map(|_| ())
    }

    pub async fn create_session(
        &self,
        uid: u32,
        username: Option<String>,
    ) -> Result<SessionInfo, ClientError> {
        let reply = self
            .request_ack(MessageType::SessionCreate, &SessionCreateRequest { uid, username })
            .await?;
        let value = expect_ok(reply)?;
        serde_json::from_value(value).map_err(|err| ClientError::UnexpectedReply(err.to_string()))
    }

    pub async fn destroy_session(&self, uid: u32, delete_home: bool) -> Result<(), ClientError> {
        let reply = self
            .request_ack(
                MessageType::SessionDestroy,
                &SessionDestroyRequest { uid, delete_home },
            )
            .await?;
        expect_ok(reply).map(|_| ())
    }

    /// Uploads `bytes` as `/usr/local/bin/<name>` in the guest.
    pub async fn install_binary(
        &self,
        name: &str,
        bytes: &[u8],
        executable: bool,
    ) -> Result<(), ClientError> {
        let reply = self
            .request_ack(
                MessageType::BinaryInstall,
                &BinaryInstallRequest {
                    name: name.to_string(),
                    data: STANDARD.encode(bytes),
                    executable,
                },
            )
            .await?;
        expect_ok(reply).map(|_| ())
    }

    /// Fetches up to 100 MiB from an absolute guest path.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let reply = self
            .request_ack(
                MessageType::FsRead,
                &FsReadRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        match reply {
            AckReply::Data(data) => STANDARD
                .decode(data.data)
                .map_err(|err| ClientError::UnexpectedReply(format!("bad base64: {err}"))),
            AckReply::Error(reply) => Err(reply.into()),
            AckReply::Ok(_) | AckReply::Running(_) => {
                Err(ClientError::UnexpectedReply("wanted data frame".to_string()))
            }
        }
    }

    pub async fn is_running(&self, handle: &str) -> Result<RunningStatus, ClientError> {
        let reply = self
            .request_ack(
                MessageType::IsRunning,
                &IsRunningRequest {
                    handle: handle.to_string(),
                },
            )
            .await?;
        match reply {
            AckReply::Running(status) => Ok(status),
            AckReply::Error(reply) => Err(reply.into()),
            AckReply::Ok(_) | AckReply::Data(_) => Err(ClientError::UnexpectedReply(
                "wanted running_status frame".to_string(),
            )),
        }
    }

    /// Sends a close frame; the daemon tears the connection down.
    pub fn close(&self) {
        let _ = self.out.send(Outgoing::Close);
    }

    fn send<T: serde::Serialize>(&self, ty: MessageType, body: &T) -> Result<(), ClientError> {
        let frame = Frame::json(ty, body)?;
        self.out
            .send(Outgoing::Frame(frame.encode()))
            .map_err(|_| ClientError::Closed)
    }

    async fn request_ack<T: serde::Serialize>(
        &self,
        ty: MessageType,
        body: &T,
    ) -> Result<AckReply, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending_acks.lock().await.push_back(tx);
        self.send(ty, body)?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

fn expect_ok(reply: AckReply) -> Result<serde_json::Value, ClientError> {
    match reply {
        AckReply::Ok(value) => Ok(value),
        AckReply::Error(reply) => Err(reply.into()),
        AckReply::Data(_) | AckReply::Running(_) => {
            Err(ClientError::UnexpectedReply("wanted ok frame".to_string()))
        }
    }
}

/// Routes one inner frame: in-flight spawn replies first, then the serial
/// ack queue, then the event stream.
async fn route_frame(
    shared: &Shared,
    events: &mpsc::UnboundedSender<ClientEvent>,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let frame = Frame::decode(payload)?;
    let Some(ty) = frame.message_type() else {
        debug!(tag = frame.tag, "unknown frame tag ignored");
        return Ok(());
    };

    match ty {
        MessageType::Spawned => {
            let spawned: Spawned = frame.parse()?;
            match shared.pending_spawns.lock().await.remove(&spawned.id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(spawned));
                }
                None => debug!(id = spawned.id, "spawned reply without a waiter"),
            }
        }
        MessageType::Error => {
            let reply: ErrorReply = frame.parse()?;
            if let Some(waiter) = shared.pending_spawns.lock().await.remove(&reply.id) {
                let _ = waiter.send(Err(reply));
            } else if let Some(waiter) = shared.pending_acks.lock().await.pop_front() {
                let _ = waiter.send(AckReply::Error(reply));
            } else {
                let _ = events.send(ClientEvent::Error {
                    id: reply.id,
                    code: reply.code,
                    message: reply.message,
                });
            }
        }
        MessageType::Ok => {
            let value: serde_json::Value = frame.parse()?;
            match shared.pending_acks.lock().await.pop_front() {
                Some(waiter) => {
                    let _ = waiter.send(AckReply::Ok(value));
                }
                None => debug!("ok frame without a waiter"),
            }
        }
        MessageType::Data => {
            let data: DataReply = frame.parse()?;
            match shared.pending_acks.lock().await.pop_front() {
                Some(waiter) => {
                    let _ = waiter.send(AckReply::Data(data));
                }
                None => debug!("data frame without a waiter"),
            }
        }
        MessageType::RunningStatus => {
            let status: RunningStatus = frame.parse()?;
            match shared.pending_acks.lock().await.pop_front() {
                Some(waiter) => {
                    let _ = waiter.send(AckReply::Running(status));
                }
                None => debug!("running_status frame without a waiter"),
            }
        }
        MessageType::Pong => {
            if let Some(waiter) = shared.pong_waiters.lock().await.pop_front() {
                let _ = waiter.send(());
            }
        }
        MessageType::Stdout | MessageType::Stderr => {
            let chunk: vmbox_protocol::messages::OutputChunk = frame.parse()?;
            let event = if ty == MessageType::Stdout {
                ClientEvent::Stdout {
                    id: chunk.id,
                    data: chunk.data,
                }
            } else {
                ClientEvent::Stderr {
                    id: chunk.id,
                    data: chunk.data,
                }
            };
            let _ = events.send(event);
        }
        MessageType::Exit => {
            let exit: vmbox_protocol::messages::Exit = frame.parse()?;
            let _ = events.send(ClientEvent::Exit {
                id: exit.id,
                code: exit.code,
                signal: exit.signal,
            });
        }
        other => {
            warn!(?other, "request-typed frame from daemon ignored");
        }
    }
    Ok(())
}
