//! Incremental ZIP encoder.
//!
//! [`ZipStreamWriter`] never touches I/O itself: every call returns the bytes
//! to put on the wire next, and the writer only remembers the running offset
//! and one central directory record per finished member. Members are written
//! with a trailing data descriptor, so neither the CRC nor the compressed
//! size has to be known before the data goes out.

use bytes::Bytes;
use flate2::Compression;
use flate2::Crc;
use flate2::write::DeflateEncoder;
use std::io::{self, Write};

use super::structures::*;

/// State of the member currently being written
struct OpenEntry {
    header: EntryHeader,
    lfh_offset: u64,
    crc: Crc,
    encoder: Option<DeflateEncoder<Vec<u8>>>,
    compressed_size: u64,
    uncompressed_size: u64,
}

/// Streaming ZIP archive encoder
pub struct ZipStreamWriter {
    method: CompressionMethod,
    offset: u64,
    entries: Vec<CentralDirectoryEntry>,
    current: Option<OpenEntry>,
}

impl ZipStreamWriter {
    pub fn new(method: CompressionMethod) -> Self {
        Self {
            method,
            offset: 0,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Bytes emitted so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of members written so far.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Emit a directory member. `name` gets a trailing `/` if missing.
    pub fn add_directory(&mut self, name: &str, modified: DosTimestamp) -> io::Result<Bytes> {
        self.ensure_idle()?;
        let mut file_name = name.to_string();
        if !file_name.ends_with('/') {
            file_name.push('/');
        }
        let header = EntryHeader {
            file_name,
            compression_method: CompressionMethod::Stored,
            modified,
            is_directory: true,
            streamed: false,
            zip64: false,
        };

        let mut out = Vec::with_capacity(LFH_SIZE + header.file_name.len());
        header.write_local(&mut out)?;
        self.entries.push(CentralDirectoryEntry {
            header,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            lfh_offset: self.offset,
        });
        Ok(self.emit(out))
    }

    /// Start a file member and return its local header.
    ///
    /// `size_hint` is the expected uncompressed size; it decides up front
    /// whether the member needs 64-bit size fields.
    pub fn begin_file(
        &mut self,
        name: &str,
        modified: DosTimestamp,
        size_hint: u64,
    ) -> io::Result<Bytes> {
        self.ensure_idle()?;
        let header = EntryHeader {
            file_name: name.to_string(),
            compression_method: self.method,
            modified,
            is_directory: false,
            streamed: true,
            zip64: needs_zip64(self.method, size_hint),
        };
        let encoder = match self.method {
            CompressionMethod::Stored => None,
            CompressionMethod::Deflate => Some(DeflateEncoder::new(Vec::new(), Compression::fast())),
        };

        let mut out = Vec::with_capacity(LFH_SIZE + name.len() + 20);
        header.write_local(&mut out)?;
        self.current = Some(OpenEntry {
            header,
            lfh_offset: self.offset,
            crc: Crc::new(),
            encoder,
            compressed_size: 0,
            uncompressed_size: 0,
        });
        Ok(self.emit(out))
    }

    /// Feed member data; returns the bytes to send (possibly empty while
    /// the deflate encoder is buffering).
    pub fn write_data(&mut self, data: Bytes) -> io::Result<Bytes> {
        let entry = self.current.as_mut().ok_or_else(no_open_entry)?;
        entry.crc.update(&data);
        entry.uncompressed_size += data.len() as u64;

        let out = match entry.encoder.as_mut() {
            None => data,
            Some(encoder) => {
                encoder.write_all(&data)?;
                Bytes::from(std::mem::take(encoder.get_mut()))
            }
        };
        entry.compressed_size += out.len() as u64;
        self.offset += out.len() as u64;
        Ok(out)
    }

    /// Close the open member: flush the encoder and append the descriptor.
    pub fn end_file(&mut self) -> io::Result<Bytes> {
        let mut entry = self.current.take().ok_or_else(no_open_entry)?;

        let mut out = match entry.encoder.take() {
            None => Vec::new(),
            Some(encoder) => encoder.finish()?,
        };
        entry.compressed_size += out.len() as u64;

        let uncompressed_size = entry.uncompressed_size;
        let crc32 = entry.crc.sum();
        if !entry.header.zip64
            && (uncompressed_size >= ZIP64_LIMIT || entry.compressed_size >= ZIP64_LIMIT)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} grew past its declared size", entry.header.file_name),
            ));
        }

        DataDescriptor {
            crc32,
            compressed_size: entry.compressed_size,
            uncompressed_size,
            zip64: entry.header.zip64,
        }
        .write_to(&mut out)?;

        self.entries.push(CentralDirectoryEntry {
            header: entry.header,
            crc32,
            compressed_size: entry.compressed_size,
            uncompressed_size,
            lfh_offset: entry.lfh_offset,
        });
        Ok(self.emit(out))
    }

    /// Emit the central directory and end records. The writer is spent.
    pub fn finish(mut self) -> io::Result<Bytes> {
        self.ensure_idle()?;
        let cd_offset = self.offset;
        let mut out = Vec::with_capacity(self.entries.len() * (CDFH_MIN_SIZE + 32) + 128);
        for entry in &self.entries {
            entry.write_to(&mut out)?;
        }
        let cd_size = out.len() as u64;

        EndOfCentralDirectory {
            total_entries: self.entries.len() as u64,
            cd_size,
            cd_offset,
        }
        .write_to(&mut out)?;
        Ok(self.emit(out))
    }

    fn ensure_idle(&self) -> io::Result<()> {
        match &self.current {
            Some(entry) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("member {} is still open", entry.header.file_name),
            )),
            None => Ok(()),
        }
    }

    fn emit(&mut self, out: Vec<u8>) -> Bytes {
        self.offset += out.len() as u64;
        Bytes::from(out)
    }
}

/// Whether a member of `size` bytes needs 64-bit size fields.
///
/// Deflate can expand incompressible input slightly, so it switches over
/// with some headroom.
fn needs_zip64(method: CompressionMethod, size: u64) -> bool {
    match method {
        CompressionMethod::Stored => size >= ZIP64_LIMIT,
        CompressionMethod::Deflate => size.saturating_add(size / 256 + 1024) >= ZIP64_LIMIT,
    }
}

fn no_open_entry() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "no member is open")
}
