//! End-to-end exchanges over a real TCP loopback: daemon on an ephemeral
//! port, host client speaking the full WebSocket + frame stack.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vmbox_client::{ClientEvent, SpawnOptions, VmClient};
use vmbox_daemon::server::Daemon;
use vmbox_daemon::session::MemoryAccounts;

async fn start_daemon() -> anyhow::Result<(u16, tempfile::TempDir)> {
    let homes = tempfile::tempdir()?;
    let daemon = Daemon::with_accounts_and_home_root(
        Arc::new(MemoryAccounts::default()),
        homes.path().to_path_buf(),
    );
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let _ = daemon.serve(listener).await;
    });
    Ok((port, homes))
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<ClientEvent> {
    timeout(Duration::from_secs(10), events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event stream ended"))
}

/// Raw spawns keep the child on the host-visible root, so the suite does not
/// depend on an installed sandbox-helper.
fn raw(command: &str, args: &[&str]) -> SpawnOptions {
    let mut opts = SpawnOptions::new(command, args.iter().map(|s| s.to_string()).collect());
    opts.network = true;
    opts
}

#[tokio::test]
async fn ping_pong() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;
    client.ping().await?;
    client.close();
    Ok(())
}

#[tokio::test]
async fn echo_round_trip() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, mut events) = VmClient::connect("127.0.0.1", port).await?;

    let spawned = client.spawn_with(raw("/bin/echo", &["hi"])).await?;
    assert_eq!(spawned.handle, "proc-0");
    assert!(spawned.pid > 0);

    let mut stdout = String::new();
    loop {
        match next_event(&mut events).await? {
            ClientEvent::Stdout { id, data } => {
                assert_eq!(id, spawned.id);
                stdout.push_str(&data);
            }
            ClientEvent::Exit { id, code, .. } => {
                assert_eq!(id, spawned.id);
                assert_eq!(code, 0);
                break;
            }
            other => anyhow::bail!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(stdout, "hi\n");
    Ok(())
}

#[tokio::test]
async fn raw_exit_code_propagates() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, mut events) = VmClient::connect("127.0.0.1", port).await?;

    let spawned = client
        .spawn_with(raw("/bin/sh", &["-c", "exit 7"]))
        .await?;
    loop {
        if let ClientEvent::Exit { id, code, .. } = next_event(&mut events).await? {
            assert_eq!(id, spawned.id);
            assert_eq!(code, 7);
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn stdin_routes_to_cat_and_kill_ends_it() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, mut events) = VmClient::connect("127.0.0.1", port).await?;

    let spawned = client.spawn_with(raw("/bin/cat", &[])).await?;
    client.send_stdin(spawned.id, &spawned.handle, "abc").await?;

    match next_event(&mut events).await? {
        ClientEvent::Stdout { data, .. } => assert_eq!(data, "abc"),
        other => anyhow::bail!("unexpected event: {other:?}"),
    }

    client.kill(&spawned.handle, libc::SIGKILL).await?;
    loop {
        if let ClientEvent::Exit { code, signal, .. } = next_event(&mut events).await? {
            assert_eq!(code, -1);
            assert_eq!(signal, Some(libc::SIGKILL));
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn fs_read_returns_base64_decoded_bytes() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;

    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("x");
    tokio::fs::write(&path, [0x01u8, 0x02, 0x03]).await?;

    let bytes = client
        .read_file(path.to_str().expect("utf8 path"))
        .await?;
    assert_eq!(bytes, vec![0x01, 0x02, 0x03]);
    Ok(())
}

#[tokio::test]
async fn fs_read_of_missing_path_is_a_remote_error() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;

    let err = client
        .read_file("/no/such/file")
        .await
        .expect_err("missing file");
    assert!(matches!(err, vmbox_client::ClientError::Remote { .. }));
    Ok(())
}

#[tokio::test]
async fn is_running_follows_the_lifecycle() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, mut events) = VmClient::connect("127.0.0.1", port).await?;

    let spawned = client.spawn_with(raw("/bin/sleep", &["60"])).await?;
    let status = client.is_running(&spawned.handle).await?;
    assert!(status.running);
    assert_eq!(status.pid, Some(spawned.pid));

    client.kill(&spawned.handle, libc::SIGKILL).await?;
    loop {
        if let ClientEvent::Exit { .. } = next_event(&mut events).await? {
            break;
        }
    }

    let status = client.is_running(&spawned.handle).await?;
    assert!(!status.running);
    assert_eq!(status.pid, None);
    Ok(())
}

#[tokio::test]
async fn sessions_are_idempotent_over_the_wire() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;

    let first = client.create_session(2001, None).await?;
    let second = client.create_session(2001, None).await?;
    assert_eq!(first.uid, 2001);
    assert_eq!(first.gid, 2001);
    assert_eq!(first.username, second.username);
    assert_eq!(first.home_dir, second.home_dir);

    client.destroy_session(2001, true).await?;
    Ok(())
}

#[tokio::test]
async fn install_binary_lands_with_mode_bits() -> anyhow::Result<()> {
    // install_binary writes to /usr/local/bin, which tests cannot assume is
    // writable; exercise the failure surface instead when it is not.
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;

    let result = client
        .install_binary("vmbox-loopback-probe", b"#!/bin/sh\nexit 0\n", true)
        .await;
    match result {
        Ok(()) => {
            let installed = tokio::fs::read("/usr/local/bin/vmbox-loopback-probe").await?;
            assert_eq!(installed, b"#!/bin/sh\nexit 0\n");
            tokio::fs::remove_file("/usr/local/bin/vmbox-loopback-probe").await?;
        }
        Err(vmbox_client::ClientError::Remote { code, .. }) => {
            assert_eq!(code, vmbox_protocol::error_code::INSTALL_FAILED);
        }
        Err(other) => anyhow::bail!("unexpected failure: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn spawn_of_missing_binary_reports_spawn_failed() -> anyhow::Result<()> {
    let (port, _homes) = start_daemon().await?;
    let (client, _events) = VmClient::connect("127.0.0.1", port).await?;

    let err = client
        .spawn_with(raw("/no/such/binary", &[]))
        .await
        .expect_err("missing binary");
    match err {
        vmbox_client::ClientError::Remote { code, .. } => {
            assert_eq!(code, vmbox_protocol::error_code::SPAWN_FAILED);
        }
        other => anyhow::bail!("unexpected failure: {other}"),
    }
    Ok(())
}
