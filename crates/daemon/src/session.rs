//! Per-uid session accounts.
//!
//! A session ties a caller-chosen uid to a real system account and a home
//! directory with `mnt/` and `tmp/` subtrees. Creation is idempotent for
//! the daemon lifetime; teardown is best effort. The actual account
//! mutations sit behind [`SystemAccounts`] so tests can swap the shell-out
//! implementation for an in-memory fake.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vmbox_protocol::messages::SessionInfo;

use crate::DaemonError;

/// `useradd` reports an already-existing account with this status.
const USERADD_EXISTS: i32 = 9;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to run {command}: {source}")]
    Exec {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// The system-account mutations a session needs. The default implementation
/// shells out to the usual binaries.
#[async_trait]
pub trait SystemAccounts: Send + Sync {
    async fn ensure_group(&self, gid: u32, name: &str) -> Result<(), ProvisionError>;
    async fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        shell: &str,
    ) -> Result<(), ProvisionError>;
    async fn delete_user(&self, name: &str) -> Result<(), ProvisionError>;
    async fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError>;
}

// ── Shell-out provisioner ────────────────────────────────────────────────────

/// Default provisioner: `groupadd`, `useradd`, `userdel`, `chown -R`.
pub struct ShellAccounts;

async fn run(command: &str, args: &[String]) -> Result<Output, ProvisionError> {
    Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|source| ProvisionError::Exec {
            command: command.to_string(),
            source,
        })
}

fn check(command: &str, output: Output, tolerated: &[i32]) -> Result<(), ProvisionError> {
    let status = output.status.code().unwrap_or(-1);
    if output.status.success() || tolerated.contains(&status) {
        return Ok(());
    }
    Err(ProvisionError::Failed {
        command: command.to_string(),
        status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl SystemAccounts for ShellAccounts {
    async fn ensure_group(&self, gid: u32, name: &str) -> Result<(), ProvisionError> {
        let args = vec![
            "--gid".to_string(),
            gid.to_string(),
            "--force".to_string(),
            name.to_string(),
        ];
        check("groupadd", run("groupadd", &args).await?, &[])
    }

    async fn ensure_user(
        &self,
        uid: u32,
        gid: u32,
        name: &str,
        home: &Path,
        shell: &str,
    ) -> Result<(), ProvisionError> {
        let args = vec![
            "--uid".to_string(),
            uid.to_string(),
            "--gid".to_string(),
            gid.to_string(),
            "--home-dir".to_string(),
            home.display().to_string(),
            "--create-home".to_string(),
            "--shell".to_string(),
            shell.to_string(),
            name.to_string(),
        ];
        check("useradd", run("useradd", &args).await?, &[USERADD_EXISTS])
    }

    async fn delete_user(&self, name: &str) -> Result<(), ProvisionError> {
        check("userdel", run("userdel", &[name.to_string()]).await?, &[])
    }

    async fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError> {
        let args = vec![
            "-R".to_string(),
            format!("{uid}:{gid}"),
            path.display().to_string(),
        ];
        check("chown", run("chown", &args).await?, &[])
    }
}

// ── In-memory provisioner ────────────────────────────────────────────────────

/// Records calls instead of touching the system. Used by tests and by
/// deployments that pre-bake accounts into the image.
#[derive(Default)]
pub struct MemoryAccounts {
    pub groups: Mutex<Vec<(u32, String)>>,
    pub users: Mutex<Vec<(u32, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub chowns: Mutex<Vec<(PathBuf, u32, u32)>>,
}

#[async_trait]
impl SystemAccounts for MemoryAccounts {
    async fn ensure_group(&self, gid: u32, name: &str) -> Result<(), ProvisionError> {
        self.groups.lock().await.push((gid, name.to_string()));
        Ok(())
    }

    async fn ensure_user(
        &self,
        uid: u32,
        _gid: u32,
        name: &str,
        _home: &Path,
        _shell: &str,
    ) -> Result<(), ProvisionError> {
        self.users.lock().await.push((uid, name.to_string()));
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), ProvisionError> {
        self.deleted.lock().await.push(name.to_string());
        Ok(())
    }

    async fn recursive_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), ProvisionError> {
        self.chowns.lock().await.push((path.to_path_buf(), uid, gid));
        Ok(())
    }
}

// ── Session registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Session {
    uid: u32,
    gid: u32,
    username: String,
    home_dir: PathBuf,
}

pub struct SessionManager {
    accounts: Arc<dyn SystemAccounts>,
    sessions: Mutex<HashMap<u32, Session>>,
    /// Root under which per-uid homes are created; `/home` in production.
    home_root: PathBuf,
}

impl SessionManager {
    pub fn new(accounts: Arc<dyn SystemAccounts>) -> Self {
        Self::with_home_root(accounts, PathBuf::from("/home"))
    }

    pub fn with_home_root(accounts: Arc<dyn SystemAccounts>, home_root: PathBuf) -> Self {
        Self {
            accounts,
            sessions: Mutex::new(HashMap::new()),
            home_root,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Creates (or returns) the session for `uid`. Repeated calls with the
    /// same uid hand back the identical record.
    pub async fn create(
        &self,
        uid: u32,
        username: Option<String>,
    ) -> Result<SessionInfo, DaemonError> {
        if let Some(existing) = self.sessions.lock().await.get(&uid) {
            return Ok(info_of(existing));
        }

        let gid = uid;
        let username = username.unwrap_or_else(|| format!("session{uid}"));
        let home_dir = self.home_root.join(uid.to_string());

        self.accounts
            .ensure_group(gid, &username)
            .await
            .map_err(user_create)?;
        self.accounts
            .ensure_user(uid, gid, &username, &home_dir, "/bin/bash")
            .await
            .map_err(user_create)?;

        for dir in [home_dir.clone(), home_dir.join("mnt"), home_dir.join("tmp")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| DaemonError::UserCreateFailed(format!(
                    "mkdir {}: {err}",
                    dir.display()
                )))?;
        }
        self.accounts
            .recursive_chown(&home_dir, uid, gid)
            .await
            .map_err(user_create)?;

        let session = Session {
            uid,
            gid,
            username,
            home_dir,
        };
        let info = info_of(&session);
        self.sessions.lock().await.insert(uid, session);
        info!(uid, username = %info.username, "session created");
        Ok(info)
    }

    /// Drops the session for `uid`. Home removal and account deletion are
    /// best effort; the registry entry goes away regardless.
    pub async fn destroy(&self, uid: u32, delete_home: bool) -> Result<(), DaemonError> {
        let Some(session) = self.sessions.lock().await.remove(&uid) else {
            return Ok(());
        };

        if delete_home {
            if let Err(err) = tokio::fs::remove_dir_all(&session.home_dir).await {
                warn!(uid, ?err, "session home removal failed");
            }
        }
        if let Err(err) = self.accounts.delete_user(&session.username).await {
            warn!(uid, ?err, "userdel failed");
        }
        info!(uid, "session destroyed");
        Ok(())
    }
}

fn info_of(session: &Session) -> SessionInfo {
    SessionInfo {
        uid: session.uid,
        gid: session.gid,
        username: session.username.clone(),
        home_dir: session.home_dir.display().to_string(),
    }
}

fn user_create(err: ProvisionError) -> DaemonError {
    DaemonError::UserCreateFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path) -> (Arc<MemoryAccounts>, SessionManager) {
        let accounts = Arc::new(MemoryAccounts::default());
        let manager =
            SessionManager::with_home_root(accounts.clone(), dir.to_path_buf());
        (accounts, manager)
    }

    #[tokio::test]
    async fn create_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (accounts, manager) = manager_in(tmp.path());

        let first = manager.create(2001, None).await?;
        let second = manager.create(2001, None).await?;
        assert_eq!(first.uid, second.uid);
        assert_eq!(first.gid, 2001);
        assert_eq!(first.username, "session2001");
        assert_eq!(first.home_dir, second.home_dir);
        assert_eq!(manager.len().await, 1);

        // The provisioner ran once, not once per call.
        assert_eq!(accounts.users.lock().await.len(), 1);
        assert_eq!(accounts.groups.lock().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn home_tree_is_created_and_chowned() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (accounts, manager) = manager_in(tmp.path());

        let info = manager.create(2002, Some("alice".to_string())).await?;
        assert_eq!(info.username, "alice");
        let home = PathBuf::from(&info.home_dir);
        assert!(home.is_dir());
        assert!(home.join("mnt").is_dir());
        assert!(home.join("tmp").is_dir());

        let chowns = accounts.chowns.lock().await;
        assert_eq!(chowns.as_slice(), &[(home, 2002, 2002)]);
        Ok(())
    }

    #[tokio::test]
    async fn destroy_removes_registry_and_optionally_home() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (accounts, manager) = manager_in(tmp.path());

        let info = manager.create(2003, None).await?;
        manager.destroy(2003, true).await?;
        assert_eq!(manager.len().await, 0);
        assert!(!Path::new(&info.home_dir).exists());
        assert_eq!(
            accounts.deleted.lock().await.as_slice(),
            &["session2003".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn destroy_of_unknown_uid_is_a_no_op() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (accounts, manager) = manager_in(tmp.path());
        manager.destroy(9999, true).await?;
        assert!(accounts.deleted.lock().await.is_empty());
        Ok(())
    }
}
