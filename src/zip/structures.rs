use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::io::{Result, Write};
use std::time::SystemTime;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
}

impl CompressionMethod {
    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }

    /// Minimum "version needed to extract" for this method.
    pub fn version_needed(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 10,
            CompressionMethod::Deflate => 20,
        }
    }
}

/// Data descriptor follows the member data (general purpose bit 3).
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// File names are UTF-8 (general purpose bit 11).
pub const FLAG_UTF8: u16 = 1 << 11;

/// Version needed once any ZIP64 record is involved.
pub const VERSION_ZIP64: u16 = 45;
/// Made by: Unix (3), format version 4.5.
pub const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;

/// Largest value a 32-bit field can hold before ZIP64 takes over.
pub const ZIP64_LIMIT: u64 = 0xFFFF_FFFF;
/// Largest entry count the classic EOCD can hold.
pub const ZIP64_ENTRY_LIMIT: u64 = 0xFFFF;

const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Unix mode bits stored in the high half of the external attributes.
const UNIX_FILE_MODE: u32 = 0o100644;
const UNIX_DIR_MODE: u32 = 0o040755;
/// MS-DOS directory attribute.
const DOS_DIR_ATTR: u32 = 0x10;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Data descriptor signature (optional by the format, always written here)
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// MS-DOS date and time as stored in ZIP headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTimestamp {
    pub time: u16,
    pub date: u16,
}

impl DosTimestamp {
    /// 1980-01-01 00:00, the earliest representable moment.
    pub const EPOCH: DosTimestamp = DosTimestamp {
        time: 0,
        date: (1 << 5) | 1,
    };

    /// Convert to local time and pack into DOS fields.
    ///
    /// Times outside 1980..=2107 clamp to the nearest end of the range;
    /// seconds are stored at two-second resolution.
    pub fn from_system_time(time: SystemTime) -> Self {
        let local: DateTime<Local> = time.into();
        let year = local.year();
        if year < 1980 {
            return Self::EPOCH;
        }
        if year > 2107 {
            return Self {
                time: (23 << 11) | (59 << 5) | 29,
                date: (127 << 9) | (12 << 5) | 31,
            };
        }

        let date = (((year - 1980) as u16) << 9) | ((local.month() as u16) << 5) | local.day() as u16;
        let time = ((local.hour() as u16) << 11)
            | ((local.minute() as u16) << 5)
            | (local.second() as u16 / 2);
        Self { time, date }
    }
}

/// Per-member fields shared by the local and central headers
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub file_name: String,
    pub compression_method: CompressionMethod,
    pub modified: DosTimestamp,
    pub is_directory: bool,
    /// Sizes and CRC are deferred to a data descriptor.
    pub streamed: bool,
    /// Data descriptor and local extra field use 64-bit sizes.
    pub zip64: bool,
}

impl EntryHeader {
    pub fn flags(&self) -> u16 {
        if self.streamed {
            FLAG_UTF8 | FLAG_DATA_DESCRIPTOR
        } else {
            FLAG_UTF8
        }
    }

    pub fn version_needed(&self, central_zip64: bool) -> u16 {
        if self.zip64 || central_zip64 {
            VERSION_ZIP64
        } else {
            self.compression_method.version_needed()
        }
    }

    fn external_attrs(&self) -> u32 {
        if self.is_directory {
            (UNIX_DIR_MODE << 16) | DOS_DIR_ATTR
        } else {
            UNIX_FILE_MODE << 16
        }
    }

    /// Encode the local file header.
    ///
    /// Streamed members carry zero CRC and sizes here; the real values
    /// follow the data in a descriptor.
    pub fn write_local<W: Write>(&self, out: &mut W) -> Result<()> {
        let name = self.file_name.as_bytes();
        let (size_field, extra_len) = if self.zip64 {
            (ZIP64_LIMIT as u32, 20u16)
        } else {
            (0u32, 0u16)
        };

        out.write_all(LFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(self.version_needed(false))?;
        out.write_u16::<LittleEndian>(self.flags())?;
        out.write_u16::<LittleEndian>(self.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.modified.time)?;
        out.write_u16::<LittleEndian>(self.modified.date)?;
        out.write_u32::<LittleEndian>(0)?; // crc32
        out.write_u32::<LittleEndian>(size_field)?; // compressed size
        out.write_u32::<LittleEndian>(size_field)?; // uncompressed size
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra_len)?;
        out.write_all(name)?;

        if self.zip64 {
            out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            out.write_u16::<LittleEndian>(16)?;
            out.write_u64::<LittleEndian>(0)?;
            out.write_u64::<LittleEndian>(0)?;
        }
        Ok(())
    }
}

/// Data descriptor written after a streamed member's data
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub zip64: bool,
}

impl DataDescriptor {
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(DATA_DESCRIPTOR_SIGNATURE)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        if self.zip64 {
            out.write_u64::<LittleEndian>(self.compressed_size)?;
            out.write_u64::<LittleEndian>(self.uncompressed_size)?;
        } else {
            out.write_u32::<LittleEndian>(self.compressed_size as u32)?;
            out.write_u32::<LittleEndian>(self.uncompressed_size as u32)?;
        }
        Ok(())
    }
}

/// A finished member, as recorded in the central directory
#[derive(Debug, Clone)]
pub struct CentralDirectoryEntry {
    pub header: EntryHeader,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub lfh_offset: u64,
}

impl CentralDirectoryEntry {
    /// Encode the central directory file header.
    ///
    /// Any 32-bit field that overflows is set to 0xFFFFFFFF and its value
    /// moved into a ZIP64 extra field, in the order the format prescribes.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let name = self.header.file_name.as_bytes();

        let mut zip64_fields = Vec::new();
        let uncompressed = self.overflow(self.uncompressed_size, &mut zip64_fields);
        let compressed = self.overflow(self.compressed_size, &mut zip64_fields);
        let offset = self.overflow(self.lfh_offset, &mut zip64_fields);
        let extra_len = if zip64_fields.is_empty() {
            0
        } else {
            4 + 8 * zip64_fields.len() as u16
        };

        out.write_all(CDFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        out.write_u16::<LittleEndian>(self.header.version_needed(!zip64_fields.is_empty()))?;
        out.write_u16::<LittleEndian>(self.header.flags())?;
        out.write_u16::<LittleEndian>(self.header.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.header.modified.time)?;
        out.write_u16::<LittleEndian>(self.header.modified.date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(compressed)?;
        out.write_u32::<LittleEndian>(uncompressed)?;
        out.write_u16::<LittleEndian>(name.len() as u16)?;
        out.write_u16::<LittleEndian>(extra_len)?;
        out.write_u16::<LittleEndian>(0)?; // file comment length
        out.write_u16::<LittleEndian>(0)?; // disk number start
        out.write_u16::<LittleEndian>(0)?; // internal attributes
        out.write_u32::<LittleEndian>(self.header.external_attrs())?;
        out.write_u32::<LittleEndian>(offset)?;
        out.write_all(name)?;

        if !zip64_fields.is_empty() {
            out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            out.write_u16::<LittleEndian>(8 * zip64_fields.len() as u16)?;
            for value in zip64_fields {
                out.write_u64::<LittleEndian>(value)?;
            }
        }
        Ok(())
    }

    fn overflow(&self, value: u64, zip64_fields: &mut Vec<u64>) -> u32 {
        if value >= ZIP64_LIMIT {
            zip64_fields.push(value);
            ZIP64_LIMIT as u32
        } else {
            value as u32
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn is_zip64(&self) -> bool {
        self.total_entries >= ZIP64_ENTRY_LIMIT
            || self.cd_size >= ZIP64_LIMIT
            || self.cd_offset >= ZIP64_LIMIT
    }

    /// Encode the trailer, preceded by the ZIP64 EOCD and its locator when
    /// any classic field would overflow.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.is_zip64() {
            let eocd64_offset = self.cd_offset + self.cd_size;
            Zip64EOCD {
                total_entries: self.total_entries,
                cd_size: self.cd_size,
                cd_offset: self.cd_offset,
            }
            .write_to(out)?;
            Zip64EOCDLocator { eocd64_offset }.write_to(out)?;
        }

        let entries = self.total_entries.min(ZIP64_ENTRY_LIMIT) as u16;
        out.write_all(Self::SIGNATURE)?;
        out.write_u16::<LittleEndian>(0)?; // disk number
        out.write_u16::<LittleEndian>(0)?; // disk with central directory
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u32::<LittleEndian>(self.cd_size.min(ZIP64_LIMIT) as u32)?;
        out.write_u32::<LittleEndian>(self.cd_offset.min(ZIP64_LIMIT) as u32)?;
        out.write_u16::<LittleEndian>(0)?; // comment length
        Ok(())
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub eocd64_offset: u64,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u32::<LittleEndian>(0)?; // disk with ZIP64 EOCD
        out.write_u64::<LittleEndian>(self.eocd64_offset)?;
        out.write_u32::<LittleEndian>(1)?; // total disks
        Ok(())
    }
}

/// ZIP64 End of Central Directory - 56 bytes
pub struct Zip64EOCD {
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const SIZE: usize = 56;

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(Self::SIGNATURE)?;
        // Size of the remaining record, excluding signature and this field.
        out.write_u64::<LittleEndian>(Self::SIZE as u64 - 12)?;
        out.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u32::<LittleEndian>(0)?; // disk number
        out.write_u32::<LittleEndian>(0)?; // disk with central directory
        out.write_u64::<LittleEndian>(self.total_entries)?;
        out.write_u64::<LittleEndian>(self.total_entries)?;
        out.write_u64::<LittleEndian>(self.cd_size)?;
        out.write_u64::<LittleEndian>(self.cd_offset)?;
        Ok(())
    }
}
