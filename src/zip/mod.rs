//! ZIP archive encoding for streamed downloads.
//!
//! ## Architecture
//!
//! - [`structures`]: ZIP record layouts (local header, data descriptor,
//!   central directory, EOCD and its ZIP64 variants) and their encoders
//! - [`writer`]: the incremental encoder that turns member data into wire bytes
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! Because the Central Directory comes last, an archive can be produced front
//! to back in one pass: each member is announced with a local header, its
//! data streamed, and its CRC and sizes trailed in a data descriptor. Only
//! the Central Directory records are kept until the end.
//!
//! ## Supported Features
//!
//! - STORED (no compression) and DEFLATE (fast level) members
//! - ZIP64 extensions for members and archives past 4 GiB or 65535 entries
//! - UTF-8 member names
//!
//! ## Limitations
//!
//! - No encryption
//! - No archive or member comments

mod structures;
mod writer;

pub use structures::*;
pub use writer::ZipStreamWriter;
