use super::ReadAt;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Local file reader with random access support
///
/// Positional reads run on the blocking pool so a slow disk never stalls the
/// runtime threads. The size is fixed when the file is opened; a file that
/// grows afterwards is served up to that size.
pub struct LocalFileReader {
    file: Arc<File>,
    size: u64,
    modified: Option<SystemTime>,
}

impl LocalFileReader {
    /// Open `path` for reading. Fails with `InvalidInput` if it is a directory.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "is a directory",
            ));
        }
        let file = file.into_std().await;
        Ok(Self::from_parts(file, &metadata))
    }

    fn from_parts(file: File, metadata: &Metadata) -> Self {
        Self {
            file: Arc::new(file),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }

    /// Modification time captured at open, if the platform reports one.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Weak handle on the open file; it dies once every reader clone and
    /// in-flight read is gone.
    #[cfg(test)]
    pub(crate) fn handle(&self) -> std::sync::Weak<File> {
        Arc::downgrade(&self.file)
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        if len == 0 || offset >= self.size {
            return Ok(Bytes::new());
        }
        let len = len.min((self.size - offset) as usize);
        let file = Arc::clone(&self.file);

        tokio::task::spawn_blocking(move || {
            let mut buf = BytesMut::zeroed(len);
            let mut filled = 0;
            // Positional reads may come back short; keep going until the
            // chunk is full or the file ends.
            while filled < len {
                let n = pread(&file, &mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf.freeze())
        })
        .await
        .map_err(io::Error::other)?
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    // seek_read moves the cursor, which nothing else relies on.
    file.seek_read(buf, offset)
}

#[cfg(not(any(unix, windows)))]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_chunks_and_stops_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&path, &data).unwrap();

        let reader = LocalFileReader::open(&path).await.unwrap();
        assert_eq!(reader.size(), 1000);

        let chunk = reader.read_at(100, 100).await.unwrap();
        assert_eq!(&chunk[..], &data[100..200]);

        let tail = reader.read_at(950, 100).await.unwrap();
        assert_eq!(&tail[..], &data[950..]);

        assert!(reader.read_at(1000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = match LocalFileReader::open(dir.path()).await {
            Ok(_) => panic!("directory opened as a file"),
            Err(err) => err,
        };
        // Some platforms refuse the open itself.
        assert!(matches!(
            err.kind(),
            io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied | io::ErrorKind::IsADirectory
        ));
    }
}
