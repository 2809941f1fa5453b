//! Guest filesystem operations: virtio-fs mounts, binary installation, and
//! bounded file reads.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::process::Command;
use tracing::info;

use crate::DaemonError;

/// Installed binaries land here.
const INSTALL_DIR: &str = "/usr/local/bin";

/// `fs_read` refuses files larger than this (100 MiB).
pub const MAX_READ_BYTES: u64 = 100 * 1024 * 1024;

/// Mounts a virtio-fs share by tag. The mount point is created first.
pub async fn mount_virtiofs(
    tag: &str,
    mount_point: &str,
    read_only: bool,
) -> Result<(), DaemonError> {
    tokio::fs::create_dir_all(mount_point)
        .await
        .map_err(|err| DaemonError::MountFailed(format!("mkdir {mount_point}: {err}")))?;

    let mut cmd = Command::new("mount");
    cmd.args(["-t", "virtiofs"]);
    if read_only {
        cmd.args(["-o", "ro"]);
    }
    cmd.arg(tag).arg(mount_point);

    let output = cmd
        .output()
        .await
        .map_err(|err| DaemonError::MountFailed(err.to_string()))?;
    if !output.status.success() {
        return Err(DaemonError::MountFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    info!(tag, mount_point, read_only, "virtiofs mounted");
    Ok(())
}

pub async fn unmount(mount_point: &str) -> Result<(), DaemonError> {
    let output = Command::new("umount")
        .arg(mount_point)
        .output()
        .await
        .map_err(|err| DaemonError::MountFailed(err.to_string()))?;
    if !output.status.success() {
        return Err(DaemonError::MountFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    info!(mount_point, "unmounted");
    Ok(())
}

/// Decodes `data` and writes it under the install directory, mode 0755 when
/// executable, 0644 otherwise. Existing files are truncated.
pub async fn install_binary(
    name: &str,
    data: &str,
    executable: bool,
) -> Result<PathBuf, DaemonError> {
    install_binary_in(Path::new(INSTALL_DIR), name, data, executable).await
}

pub async fn install_binary_in(
    dir: &Path,
    name: &str,
    data: &str,
    executable: bool,
) -> Result<PathBuf, DaemonError> {
    if name.is_empty() || name.contains('/') {
        return Err(DaemonError::InstallFailed(format!(
            "invalid binary name: {name:?}"
        )));
    }
    let bytes = STANDARD
        .decode(data)
        .map_err(|err| DaemonError::InstallFailed(format!("base64: {err}")))?;

    let path = dir.join(name);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|err| DaemonError::InstallFailed(format!("write {}: {err}", path.display())))?;

    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| DaemonError::InstallFailed(format!("chmod {}: {err}", path.display())))?;

    info!(path = %path.display(), bytes = bytes.len(), executable, "binary installed");
    Ok(path)
}

/// Reads an absolute path in full, refusing anything above the size cap.
pub async fn read_file(path: &str) -> Result<Vec<u8>, DaemonError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|err| DaemonError::Internal(format!("stat {path}: {err}")))?;
    if meta.len() > MAX_READ_BYTES {
        return Err(DaemonError::InvalidParams(format!(
            "{path} is {} bytes, cap is {MAX_READ_BYTES}",
            meta.len()
        )));
    }
    tokio::fs::read(path)
        .await
        .map_err(|err| DaemonError::Internal(format!("read {path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_writes_executable() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let encoded = STANDARD.encode(b"#!/bin/sh\nexit 0\n");
        let path = install_binary_in(tmp.path(), "probe", &encoded, true).await?;
        assert_eq!(tokio::fs::read(&path).await?, b"#!/bin/sh\nexit 0\n");
        let mode = tokio::fs::metadata(&path).await?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        Ok(())
    }

    #[tokio::test]
    async fn install_plain_file_is_not_executable() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let encoded = STANDARD.encode(b"config");
        let path = install_binary_in(tmp.path(), "settings", &encoded, false).await?;
        let mode = tokio::fs::metadata(&path).await?.permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        Ok(())
    }

    #[tokio::test]
    async fn install_rejects_bad_base64_and_path_tricks() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let err = install_binary_in(tmp.path(), "x", "!!not-base64!!", true)
            .await
            .expect_err("bad encoding");
        assert!(matches!(err, DaemonError::InstallFailed(_)));

        let err = install_binary_in(tmp.path(), "../escape", "AQID", true)
            .await
            .expect_err("path separator");
        assert!(matches!(err, DaemonError::InstallFailed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn read_file_returns_contents() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("x");
        tokio::fs::write(&path, [0x01u8, 0x02, 0x03]).await?;
        let bytes = read_file(path.to_str().expect("utf8 path")).await?;
        assert_eq!(bytes, vec![0x01, 0x02, 0x03]);
        assert_eq!(STANDARD.encode(&bytes), "AQID");
        Ok(())
    }

    #[tokio::test]
    async fn read_file_refuses_oversize() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("huge");
        // Sparse file: the cap check reads metadata, not content.
        let file = std::fs::File::create(&path)?;
        file.set_len(MAX_READ_BYTES + 1)?;
        let err = read_file(path.to_str().expect("utf8 path"))
            .await
            .expect_err("oversize");
        assert!(matches!(err, DaemonError::InvalidParams(_)));
        Ok(())
    }

    #[tokio::test]
    async fn read_file_missing_path_errors() {
        let err = read_file("/definitely/not/here")
            .await
            .expect_err("missing file");
        assert!(matches!(err, DaemonError::Internal(_)));
    }
}
