use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{ArchiveCompression, DEFAULT_CHUNK_SIZE, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "lanshare")]
#[command(version)]
#[command(about = "Share files and folders with browsers on your local network", long_about = None)]
#[command(after_help = "Examples:\n  \
  lanshare ~/Pictures notes.txt      share a folder and a file on port 8080\n  \
  lanshare -p 9000 --deflate ~/docs  serve on port 9000, compress archives\n  \
  RUST_LOG=lanshare=debug lanshare . log every request")]
pub struct Cli {
    /// Files or folders to share
    #[arg(value_name = "PATHS", required = true, num_args = 1.., env = "LANSHARE_PATHS", value_delimiter = ',')]
    pub paths: Vec<PathBuf>,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 8080, env = "LANSHARE_PORT",
          value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Address to bind
    #[arg(long, value_name = "IP", default_value = "0.0.0.0", env = "LANSHARE_BIND")]
    pub bind: IpAddr,

    /// Read buffer size in bytes for downloads
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE,
          env = "LANSHARE_CHUNK_SIZE", value_parser = parse_chunk_size)]
    pub chunk_size: usize,

    /// Compress archive members with fast deflate instead of storing them
    #[arg(long, env = "LANSHARE_DEFLATE")]
    pub deflate: bool,

    /// Include dot-files in listings and archives
    #[arg(long, env = "LANSHARE_SHOW_HIDDEN")]
    pub show_hidden: bool,

    /// More log output (-vv => trace)
    #[arg(short = 'v', action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Less log output
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_ip: self.bind,
            chunk_size: self.chunk_size,
            compression: if self.deflate {
                ArchiveCompression::Deflate
            } else {
                ArchiveCompression::Stored
            },
            show_hidden: self.show_hidden,
            ..ServerConfig::default()
        }
    }

    /// Shared paths made absolute against the working directory.
    pub fn shared_roots(&self) -> std::io::Result<Vec<PathBuf>> {
        self.paths.iter().map(std::path::absolute).collect()
    }

    /// Default log directive when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match (self.verbose, self.quiet) {
            (0, 0) => "lanshare=info",
            (1, _) => "lanshare=debug,tower_http=debug",
            (v, _) if v > 1 => "lanshare=trace,tower_http=trace",
            _ => "lanshare=warn",
        }
    }
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("chunk size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["lanshare", "/srv/share"]).unwrap();
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.log_filter(), "lanshare=info");
        let config = cli.server_config();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.compression, ArchiveCompression::Stored);
        assert!(!config.show_hidden);
    }

    #[test]
    fn flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "lanshare", "-p", "9000", "--deflate", "--show-hidden", "--chunk-size", "4096", "-vv",
            "a", "b",
        ])
        .unwrap();
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.paths.len(), 2);
        assert_eq!(cli.log_filter(), "lanshare=trace,tower_http=trace");
        let config = cli.server_config();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.compression, ArchiveCompression::Deflate);
        assert!(config.show_hidden);
        assert!(cli.shared_roots().unwrap().iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["lanshare", "-p", "0", "a"]).is_err());
        assert!(Cli::try_parse_from(["lanshare", "--chunk-size", "0", "a"]).is_err());
        assert!(Cli::try_parse_from(["lanshare", "-v", "-q", "a"]).is_err());
    }
}
