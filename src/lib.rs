//! # lanshare
//!
//! Share local files and folders with any browser on the same network.
//!
//! This library is the serving core of a LAN file-sharing app: a registry of
//! shared roots, an HTTP server that lists directories, streams files with
//! byte-range support, and builds ZIP archives on the fly, plus the
//! start/stop control surface an outer shell drives.
//!
//! ## Features
//!
//! - Strict path containment: every request target is symlink-resolved and
//!   must lie inside a shared root
//! - Single-range file downloads (`206 Partial Content`)
//! - Directory listings as HTML or JSON
//! - Streamed ZIP downloads of a folder or a multi-selection, with ZIP64
//!   for large archives and bounded memory per transfer
//! - Shared paths can be added or removed while the server runs
//!
//! ## Example
//!
//! ```no_run
//! use lanshare::{ServerConfig, ServerLifecycle, list_local_addresses};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ServerLifecycle::new(ServerConfig::default());
//!     let addr = server.start(8080, ["/home/me/Pictures"]).await?;
//!
//!     for ip in list_local_addresses() {
//!         println!("http://{}:{}/", ip, addr.port());
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod io;
pub mod lifecycle;
pub mod network;
pub mod registry;
pub mod zip;

pub use cli::Cli;
pub use config::{ArchiveCompression, ServerConfig};
pub use error::{Error, Result};
pub use io::{LocalFileReader, ReadAt};
pub use lifecycle::{ServerLifecycle, ServerState};
pub use network::list_local_addresses;
pub use registry::{EntryKind, PathRegistry, ResolvedTarget, SharedPath};
pub use zip::ZipStreamWriter;
