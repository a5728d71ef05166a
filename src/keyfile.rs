//! Persisted key material and other secret files.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::Zeroizing;

/// Mode applied to every secret written by this crate
pub const SECRET_FILE_MODE: u32 = 0o400;

#[derive(Error, Debug)]
pub enum KeyFileError {
    #[error("key material not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

pub type Result<T, E = KeyFileError> = core::result::Result<T, E>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> KeyFileError + '_ {
    move |source| match source.kind() {
        io::ErrorKind::NotFound => KeyFileError::NotFound(path.to_path_buf()),
        _ => KeyFileError::Io {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Reads the whole file into a buffer that is wiped on drop.
pub fn read_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let len = file.metadata().map_err(io_error(path))?.len();
    // Size up front so the buffer never reallocates and leaves copies behind
    let mut contents = Zeroizing::new(Vec::with_capacity(len as usize + 1));
    file.read_to_end(&mut contents).map_err(io_error(path))?;
    Ok(contents)
}

/// Atomically replaces `path` with `secret`, readable by the owner only.
pub fn write_secret(path: &Path, secret: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_error(parent))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(io_error(parent))?;
    let write = |temp: &mut NamedTempFile| -> io::Result<()> {
        temp.as_file_mut().write_all(secret)?;
        temp.as_file_mut().flush()?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(SECRET_FILE_MODE))?;
        temp.as_file().sync_all()
    };
    write(&mut temp).map_err(io_error(path))?;
    temp.persist(path)
        .map_err(|err| KeyFileError::Io {
            path: path.to_path_buf(),
            source: err.error,
        })?;
    log::debug!("wrote {} bytes to {}", secret.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use tempfile::tempdir;

    #[test]
    fn write_then_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("boot.key");
        write_secret(&path, b"s3cr3t")?;
        assert_eq!(&read_secret(&path)?[..], b"s3cr3t");
        let mode = fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, SECRET_FILE_MODE);
        Ok(())
    }

    #[test]
    fn write_replaces_read_only_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("root.key");
        write_secret(&path, b"old")?;
        write_secret(&path, b"new")?;
        assert_eq!(&read_secret(&path)?[..], b"new");
        Ok(())
    }

    #[test]
    fn write_creates_parent() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("key");
        write_secret(&path, b"")?;
        assert!(read_secret(&path)?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_file_is_not_found() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("absent");
        match read_secret(&path) {
            Err(KeyFileError::NotFound(p)) => assert_eq!(p, path),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }
}
