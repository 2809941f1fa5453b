//! `vmctl`: host-side controller for vmbox guests.

mod vm;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use vmbox_client::{ClientEvent, SpawnOptions, VmClient};

#[derive(Debug, Parser)]
#[command(name = "vmctl", version, about = "Control vmbox virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch a VM from a root filesystem image and wait for the guest
    /// daemon to come up.
    Start {
        /// Path to the raw rootfs disk image.
        rootfs: PathBuf,
        #[arg(long)]
        kernel: Option<PathBuf>,
        #[arg(long)]
        initrd: Option<PathBuf>,
        /// Export HOST_PATH into the guest under TAG (virtio-9p). Repeatable.
        #[arg(long, num_args = 2, value_names = ["HOST", "TAG"])]
        share: Vec<String>,
    },
    /// Run a command in the guest; exits with the command's exit code.
    Exec {
        /// Forwarded control port of the target VM.
        port: u16,
        /// Skip the sandbox and keep the guest network.
        #[arg(long)]
        raw: bool,
        /// Allocate a guest PTY for the child.
        #[arg(long)]
        pty: bool,
        /// Command and arguments, after `--`.
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Upload a local file to /usr/local/bin in the guest.
    Install {
        port: u16,
        file: PathBuf,
    },
    /// Serve the browser terminal for a running VM.
    Web {
        port: u16,
        #[arg(default_value_t = 8000)]
        http_port: u16,
    },
    /// Stop the VM behind a forwarded port.
    Stop {
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            rootfs,
            kernel,
            initrd,
            share,
        } => {
            let shares = share
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            let cfg = vm::VmConfig {
                rootfs,
                kernel,
                initrd,
                shares,
            };
            let port = vm::start(&cfg).await?;
            println!("{port}");
            Ok(())
        }
        Commands::Exec {
            port,
            raw,
            pty,
            command,
        } => exec(port, raw, pty, command).await,
        Commands::Install { port, file } => install(port, &file).await,
        Commands::Web { port, http_port } => web::serve(port, http_port).await,
        Commands::Stop { port } => stop(port).await,
    }
}

async fn exec(port: u16, raw: bool, pty: bool, command: Vec<String>) -> Result<()> {
    let (client, mut events) = VmClient::connect("127.0.0.1", port)
        .await
        .with_context(|| format!("connect to guest daemon on port {port}"))?;
    let client = Arc::new(client);

    let (cmd, args) = command.split_first().expect("clap enforces a command");
    let mut opts = SpawnOptions::new(cmd.clone(), args.to_vec());
    opts.network = raw;
    opts.pty = pty;
    let spawned = client.spawn_with(opts).await?;

    // Forward local stdin until EOF; the task dies with the process.
    {
        let client = client.clone();
        let spawn_id = spawned.id;
        let handle = spawned.handle.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if client.send_stdin(spawn_id, &handle, data).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let code = loop {
        match events.recv().await {
            Some(ClientEvent::Stdout { data, .. }) => {
                use std::io::Write;
                let mut out = std::io::stdout();
                let _ = out.write_all(data.as_bytes());
                let _ = out.flush();
            }
            Some(ClientEvent::Stderr { data, .. }) => {
                use std::io::Write;
                let mut err = std::io::stderr();
                let _ = err.write_all(data.as_bytes());
                let _ = err.flush();
            }
            Some(ClientEvent::Exit { code, .. }) => break code,
            Some(ClientEvent::Error { code, message, .. }) => {
                eprintln!("guest error {code}: {message}");
            }
            Some(ClientEvent::Closed) | None => {
                bail!("connection closed before the child exited");
            }
        }
    };
    client.close();

    // Signal deaths come back as -1; map them onto a conventional shell
    // failure status instead of wrapping around.
    std::process::exit(if code >= 0 { code } else { 1 });
}

async fn install(port: u16, file: &PathBuf) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no usable file name in {}", file.display()))?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("read {}", file.display()))?;

    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;
    client.install_binary(name, &bytes, true).await?;
    client.close();
    println!("installed /usr/local/bin/{name}");
    Ok(())
}

async fn stop(port: u16) -> Result<()> {
    if vm::stop_by_pidfile(port)? {
        return Ok(());
    }
    // No pidfile: this VM was not started by us. Ask the guest to power off.
    let (client, _events) = VmClient::connect("127.0.0.1", port)
        .await
        .context("no pidfile and the guest daemon is unreachable")?;
    client.spawn_raw("poweroff", vec![]).await?;
    client.close();
    Ok(())
}
