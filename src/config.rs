use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default read-buffer size for file and archive streams (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// How archive members are stored.
///
/// LAN transfers are usually disk- or link-bound, so members are stored
/// uncompressed unless fast deflate is asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveCompression {
    #[default]
    Stored,
    /// DEFLATE at the fastest level.
    Deflate,
}

/// Runtime settings for a server session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to; the port comes from `start()`.
    pub bind_ip: IpAddr,
    /// Upper bound on bytes read from disk per chunk.
    pub chunk_size: usize,
    pub compression: ArchiveCompression,
    /// Include dot-entries in listings and archive walks.
    pub show_hidden: bool,
    /// Upper bound on how long `stop()` waits for the serve task.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: ArchiveCompression::Stored,
            show_hidden: false,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn is_visible(&self, name: &str) -> bool {
        self.show_hidden || !name.starts_with('.')
    }
}
