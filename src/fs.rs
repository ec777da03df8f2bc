//! Filesystem collaborator traits and the tokio-backed implementation

use std::io::{self, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Positioned file I/O used by transfer slots.
#[async_trait]
pub trait FileAccess: Send {
    /// Writes `buf` at absolute offset `pos`, flushing to the filesystem
    /// layer before returning.
    async fn fwrite(&mut self, buf: &[u8], pos: u64) -> io::Result<()>;

    /// Reads exactly `len` bytes at offset `pos`, then appends `pad` zero
    /// bytes (cipher-block padding for the final chunk).
    async fn fread(&mut self, len: usize, pad: usize, pos: u64) -> io::Result<BytesMut>;

    async fn size(&mut self) -> io::Result<u64>;
}

/// Opens files for transfer slots.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// `write` selects write access; `existing` forbids creation.
    async fn open(&self, path: &Path, write: bool, existing: bool)
    -> io::Result<Box<dyn FileAccess>>;
}

/// tokio::fs implementation used in production.
pub struct TokioFs;

pub struct TokioFileAccess {
    file: tokio::fs::File,
}

#[async_trait]
impl FileSystem for TokioFs {
    async fn open(
        &self,
        path: &Path,
        write: bool,
        existing: bool,
    ) -> io::Result<Box<dyn FileAccess>> {
        let mut options = OpenOptions::new();
        options.read(true);
        if write {
            options.write(true);
            if !existing {
                options.create(true);
            }
        }
        let file = options.open(path).await?;
        Ok(Box::new(TokioFileAccess { file }))
    }
}

#[async_trait]
impl FileAccess for TokioFileAccess {
    async fn fwrite(&mut self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).await?;
        self.file.write_all(buf).await?;
        self.file.flush().await
    }

    async fn fread(&mut self, len: usize, pad: usize, pos: u64) -> io::Result<BytesMut> {
        self.file.seek(SeekFrom::Start(pos)).await?;
        let mut buf = BytesMut::zeroed(len + pad);
        self.file.read_exact(&mut buf[..len]).await?;
        Ok(buf)
    }

    async fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }
}

/// Outcome of a spawned write or read, reported back to the slot together
/// with the moved-out file handle.
pub struct AsyncIoResult {
    pub conn: usize,
    /// Write completion (GET) as opposed to a read completion (PUT)
    pub write: bool,
    pub pos: u64,
    pub len: u64,
    pub failed: bool,
    /// A failed operation worth retrying (transient OS error)
    pub retry: bool,
    /// The written plaintext (returned for MAC folding) or the bytes read
    pub buf: Option<BytesMut>,
    pub file: Box<dyn FileAccess>,
}

/// Whether an I/O error is worth retrying on the same handle.
pub fn is_retryable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positioned_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let fs = TokioFs;

        let mut fa = fs.open(&path, true, false).await.unwrap();
        fa.fwrite(b"0123456789", 0).await.unwrap();
        fa.fwrite(b"XY", 4).await.unwrap();

        let read = fa.fread(10, 0, 0).await.unwrap();
        assert_eq!(&read[..], b"0123XY6789");
        assert_eq!(fa.size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn fread_pads_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pad.bin");
        let fs = TokioFs;

        let mut fa = fs.open(&path, true, false).await.unwrap();
        fa.fwrite(b"abc", 0).await.unwrap();
        let read = fa.fread(3, 13, 0).await.unwrap();
        assert_eq!(read.len(), 16);
        assert_eq!(&read[..3], b"abc");
        assert!(read[3..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn open_existing_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.bin");
        assert!(TokioFs.open(&missing, true, true).await.is_err());
    }
}
