//! Random-access reads from the source file.
//!
//! The file is opened read-only once and shared by every worker.  Each
//! [`ChunkReader::read_range`] call is an independent positioned read on a
//! blocking thread, so there is no shared seek cursor and no buffering
//! beyond the requested range.

use bytes::Bytes;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::UploadError;

/// Shared, read-only handle to an upload source.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
}

impl ChunkReader {
    /// Open `path` for positioned reads.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let (file, len) = tokio::task::spawn_blocking(move || -> io::Result<(File, u64)> {
            let file = File::open(&opened)?;
            let len = file.metadata()?.len();
            Ok((file, len))
        })
        .await
        .map_err(|e| UploadError::Internal(anyhow::anyhow!("open task failed: {e}")))??;

        Ok(Self {
            file: Arc::new(file),
            path,
            len,
        })
    }

    /// Size of the source in bytes, as observed when it was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path the reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `length` bytes starting at `offset`.
    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, UploadError> {
        let end = offset.checked_add(length).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "range overflows u64")
        })?;
        if end > self.len {
            return Err(UploadError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "range {offset}..{end} is past the end of {} ({} bytes)",
                    self.path.display(),
                    self.len
                ),
            )));
        }
        let length = usize::try_from(length).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "range too large for memory")
        })?;

        let file = Arc::clone(&self.file);
        let buf = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; length];
            read_exact_at(&file, &mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| UploadError::Internal(anyhow::anyhow!("read task failed: {e}")))??;

        Ok(Bytes::from(buf))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// -- Tests -------------------------------------------------------------------
