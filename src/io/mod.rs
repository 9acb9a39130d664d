mod local;

pub use local::LocalFileReader;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at end of data; an empty chunk means `offset`
    /// is at or past the end.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;

    /// Get the total size of the data source
    fn size(&self) -> u64;
}
