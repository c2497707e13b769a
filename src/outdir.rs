use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

const PROBE_FILE: &str = ".restream-write-probe";

/// Make sure `dir` exists and is writable by us and by the distribution
/// server that shares it.
///
/// Creates the directory if needed and proves write access with a probe
/// file. On failure the directory is opened up to mode 0777 once and the
/// probe retried; a second failure is `FilesystemUnavailable`.
pub fn ensure_output_dir(dir: &Path) -> Result<PathBuf, SupervisorError> {
    let unavailable = |source: io::Error| SupervisorError::FilesystemUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(unavailable)?;

    if let Err(first) = probe_write(dir) {
        tracing::warn!(
            dir = %dir.display(),
            error = %first,
            "Output directory not writable, repairing permissions"
        );
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
            .map_err(unavailable)?;
        probe_write(dir).map_err(unavailable)?;
    }

    let canonical = std::fs::canonicalize(dir).map_err(unavailable)?;
    tracing::debug!(dir = %canonical.display(), "Output directory ready");
    Ok(canonical)
}

/// The form of `dir` that workers were spawned with, without creating or
/// probing anything. A directory that does not exist is made absolute only.
pub fn resolve_output_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir)
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

fn probe_write(dir: &Path) -> io::Result<()> {
    let probe = dir.join(PROBE_FILE);
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("hls/nested");
        let ready = ensure_output_dir(&dir).unwrap();
        assert!(ready.is_dir());
        assert!(!dir.join(PROBE_FILE).exists());
    }

    #[test]
    fn repairs_read_only_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("hls");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Root bypasses the mode bits, so only the end state is asserted.
        ensure_output_dir(&dir).unwrap();
        std::fs::write(dir.join("7.m3u8"), b"x").unwrap();
    }

    #[test]
    fn path_under_a_file_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let err = ensure_output_dir(&file.join("hls")).unwrap_err();
        assert!(matches!(err, SupervisorError::FilesystemUnavailable { .. }));
    }

    #[test]
    fn resolves_to_the_path_workers_are_given() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("hls");
        let ready = ensure_output_dir(&dir).unwrap();

        assert_eq!(resolve_output_dir(&tmp.path().join("hls/../hls")), ready);
        assert_eq!(
            resolve_output_dir(Path::new(".")),
            std::env::current_dir().unwrap().canonicalize().unwrap()
        );
        let missing = resolve_output_dir(Path::new("not-created-yet"));
        assert!(missing.is_absolute());
        assert!(missing.ends_with("not-created-yet"));
    }
}
