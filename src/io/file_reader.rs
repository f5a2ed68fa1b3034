use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::RangeReader;
use crate::error::IoError;

/// Local-file implementation of RangeReader.
///
/// Positional reads run on tokio's blocking pool so async callers never stall
/// a runtime worker on disk I/O. The file size is captured once on open.
#[derive(Clone)]
pub struct LocalFileReader {
    file: Arc<std::fs::File>,
    path: PathBuf,
    size: u64,
    identifier: String,
}

impl LocalFileReader {
    /// Open `path` for positional reads.
    ///
    /// Returns `IoError::NotFound` if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let identifier = format!("file://{}", path.display());

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IoError::NotFound(path.display().to_string())
            } else {
                IoError::Read(e.to_string())
            }
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| IoError::Read(e.to_string()))?
            .len();

        Ok(Self {
            file: Arc::new(file.into_std().await),
            path,
            size,
            identifier,
        })
    }

    /// Get the path this reader was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RangeReader for LocalFileReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset + len as u64 > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_at(&file, &mut buf, offset).map_err(|e| IoError::Read(e.to_string()))?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| IoError::Read(format!("read task failed: {}", e)))?
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
