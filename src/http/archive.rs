//! Streamed ZIP responses for a directory or a multi-selection.
//!
//! The archive is produced lazily: every poll of the response body advances
//! the walk just far enough to yield the next chunk, so a slow client
//! throttles the filesystem walk and at most one read chunk is in flight.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, stream};
use tracing::{debug, warn};

use super::AppContext;
use super::file::attachment;
use super::stream::{Transfer, until_cancelled};
use crate::config::{ArchiveCompression, ServerConfig};
use crate::error::Result;
use crate::io::{LocalFileReader, ReadAt};
use crate::registry::{EntryKind, PathRegistry, ResolvedTarget, disambiguate};
use crate::zip::{CompressionMethod, DosTimestamp, ZipStreamWriter};

/// Download name of a multi-selection archive.
pub const SELECTION_ARCHIVE_NAME: &str = "download.zip";

/// Pending step of the archive walk
#[derive(Debug, Clone, PartialEq, Eq)]
enum Work {
    /// Emit the directory member, then queue its children. `ancestors`
    /// holds the canonical directories above this one in the current
    /// descent; meeting one of them again is a link loop.
    Dir {
        path: PathBuf,
        name: String,
        ancestors: Arc<Vec<PathBuf>>,
    },
    File { path: PathBuf, name: String },
}

impl Work {
    fn for_target(target: &ResolvedTarget, name: String) -> Self {
        match target.kind {
            EntryKind::Directory => Work::Dir {
                path: target.path.clone(),
                name,
                ancestors: Arc::default(),
            },
            EntryKind::File => Work::File {
                path: target.path.clone(),
                name,
            },
        }
    }
}

/// Member currently being copied into the archive
struct OpenFile {
    name: String,
    reader: LocalFileReader,
    offset: u64,
}

/// Everything needed to produce one archive response
struct ArchiveJob {
    registry: Arc<PathRegistry>,
    config: Arc<ServerConfig>,
    writer: Option<ZipStreamWriter>,
    pending: Vec<Work>,
    open: Option<OpenFile>,
    transfer: Transfer,
}

impl ArchiveJob {
    fn new(ctx: &AppContext, label: String, mut roots: Vec<Work>) -> Self {
        let method = match ctx.config.compression {
            ArchiveCompression::Stored => CompressionMethod::Stored,
            ArchiveCompression::Deflate => CompressionMethod::Deflate,
        };
        roots.reverse();
        Self {
            registry: Arc::clone(&ctx.registry),
            config: Arc::clone(&ctx.config),
            writer: Some(ZipStreamWriter::new(method)),
            pending: roots,
            open: None,
            transfer: Transfer::new(label, None),
        }
    }

    /// Produce the next non-empty chunk of the archive, or `None` once the
    /// end records have been emitted.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let Some(writer) = self.writer.as_mut() else {
                return Ok(None);
            };

            if let Some(open) = self.open.as_mut() {
                let remaining = open.reader.size() - open.offset;
                if remaining == 0 {
                    self.open = None;
                    return writer.end_file().map(Some);
                }
                let want = remaining.min(self.config.chunk_size.max(1) as u64) as usize;
                let chunk = open.reader.read_at(open.offset, want).await?;
                if chunk.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} shrank while archiving", open.name),
                    ));
                }
                open.offset += chunk.len() as u64;
                let out = writer.write_data(chunk)?;
                if out.is_empty() {
                    // The deflate encoder is still buffering.
                    continue;
                }
                return Ok(Some(out));
            }

            match self.pending.pop() {
                Some(Work::Dir {
                    path,
                    name,
                    ancestors,
                }) => {
                    if ancestors.contains(&path) {
                        warn!(member = %name, "skipping directory link loop");
                        continue;
                    }
                    let modified = modified_at(&path).await;
                    let header = writer.add_directory(&name, modified)?;
                    let mut chain = Vec::with_capacity(ancestors.len() + 1);
                    chain.extend(ancestors.iter().cloned());
                    chain.push(path.clone());
                    self.queue_children(&path, &name, Arc::new(chain)).await;
                    return Ok(Some(header));
                }
                Some(Work::File { path, name }) => {
                    let reader = match LocalFileReader::open(&path).await {
                        Ok(reader) => reader,
                        Err(e) => {
                            warn!(member = %name, error = %e, "skipping unreadable file");
                            continue;
                        }
                    };
                    let modified = reader
                        .modified()
                        .map_or(DosTimestamp::EPOCH, DosTimestamp::from_system_time);
                    let header = writer.begin_file(&name, modified, reader.size())?;
                    self.open = Some(OpenFile {
                        name,
                        reader,
                        offset: 0,
                    });
                    return Ok(Some(header));
                }
                None => {
                    let Some(writer) = self.writer.take() else {
                        return Ok(None);
                    };
                    let count = writer.entry_count();
                    let tail = writer.finish()?;
                    debug!(members = count, "archive complete");
                    return Ok(Some(tail));
                }
            }
        }
    }

    /// Push the children of `dir` so they come off the stack in name order.
    /// Subdirectories inherit `ancestors`, the descent down to `dir`.
    async fn queue_children(&mut self, dir: &Path, prefix: &str, ancestors: Arc<Vec<PathBuf>>) {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!(member = %prefix, error = %e, "skipping unreadable directory");
                return;
            }
        };

        let mut children = Vec::new();
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(member = %prefix, error = %e, "directory listing cut short");
                    break;
                }
            };
            let Ok(file_name) = entry.file_name().into_string() else {
                warn!(member = %prefix, "skipping entry with non UTF-8 name");
                continue;
            };
            if !self.config.is_visible(&file_name) {
                continue;
            }

            let name = format!("{prefix}/{file_name}");
            let path = match tokio::fs::canonicalize(entry.path()).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(member = %name, error = %e, "skipping broken link");
                    continue;
                }
            };
            if !self.registry.contains(&path).await {
                warn!(member = %name, "skipping link that leaves the shared roots");
                continue;
            }
            let kind = match tokio::fs::metadata(&path).await {
                Ok(metadata) => EntryKind::from_metadata(&metadata),
                Err(_) => None,
            };
            match kind {
                Some(EntryKind::Directory) => children.push(Work::Dir {
                    path,
                    name,
                    ancestors: Arc::clone(&ancestors),
                }),
                Some(EntryKind::File) => children.push(Work::File { path, name }),
                None => debug!(member = %name, "skipping special file"),
            }
        }

        children.sort_by(|a, b| work_name(a).cmp(work_name(b)));
        self.pending.extend(children.into_iter().rev());
    }
}

fn work_name(work: &Work) -> &str {
    match work {
        Work::Dir { name, .. } | Work::File { name, .. } => name,
    }
}

async fn modified_at(path: &Path) -> DosTimestamp {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map_or(DosTimestamp::EPOCH, DosTimestamp::from_system_time)
}

/// Top-level members for a multi-selection, in request order.
///
/// Each selection keeps its display name at the archive root; a name that
/// is already taken gets `-2`, `-3`, ... before its extension. The same
/// location selected twice is archived once.
fn plan_selection(targets: &[ResolvedTarget]) -> Vec<Work> {
    let mut seen_paths = HashSet::new();
    let mut taken = HashSet::new();
    let mut plan = Vec::with_capacity(targets.len());
    for target in targets {
        if !seen_paths.insert(target.path.clone()) {
            continue;
        }
        let base = target.display_name().to_string();
        let mut name = base.clone();
        let mut n = 2;
        while taken.contains(&name) {
            name = disambiguate(&base, n);
            n += 1;
        }
        taken.insert(name.clone());
        plan.push(Work::for_target(target, name));
    }
    plan
}

fn archive_chunks(job: ArchiveJob) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::try_unfold(job, |mut job| async move {
        match job.next_chunk().await {
            Ok(Some(chunk)) => {
                job.transfer.record(chunk.len());
                Ok(Some((chunk, job)))
            }
            Ok(None) => {
                job.transfer.finish();
                Ok(None)
            }
            Err(err) => {
                job.transfer.fail(&err);
                Err(err)
            }
        }
    })
}

fn respond(ctx: &AppContext, job: ArchiveJob, download_name: &str) -> Response {
    let body = until_cancelled(archive_chunks(job), ctx.shutdown.clone());
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    if let Ok(value) = attachment(download_name) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// Stream `target` (a directory) as `<name>.zip`, members under `<name>/`.
pub fn directory(ctx: &AppContext, target: &ResolvedTarget) -> Result<Response> {
    let name = target.display_name().to_string();
    debug!(path = %target.relative, "streaming directory archive");
    let job = ArchiveJob::new(
        ctx,
        format!("{}?archive", target.relative),
        vec![Work::for_target(target, name.clone())],
    );
    Ok(respond(ctx, job, &format!("{name}.zip")))
}

/// Stream an explicit selection of resolved targets as `download.zip`.
pub fn selection(ctx: &AppContext, targets: &[ResolvedTarget]) -> Result<Response> {
    let plan = plan_selection(targets);
    debug!(members = plan.len(), "streaming selection archive");
    let job = ArchiveJob::new(ctx, SELECTION_ARCHIVE_NAME.to_string(), plan);
    Ok(respond(ctx, job, SELECTION_ARCHIVE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use std::fs;
    use std::io::{Cursor, Read};
    use tokio_util::sync::CancellationToken;

    async fn context(base: &Path, config: ServerConfig) -> AppContext {
        let registry = Arc::new(PathRegistry::new());
        registry.add(base.join("docs")).await.unwrap();
        registry.add(base.join("notes.txt")).await.unwrap();
        AppContext {
            registry,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("docs/sub/empty")).unwrap();
        fs::write(base.join("docs/a.txt"), b"alpha").unwrap();
        fs::write(base.join("docs/b.txt"), b"bravo").unwrap();
        fs::write(base.join("docs/.hidden"), b"shh").unwrap();
        let big: Vec<u8> = (0..=255u8).cycle().take(300_000).collect();
        fs::write(base.join("docs/sub/big.bin"), big).unwrap();
        fs::write(base.join("notes.txt"), b"hello world!").unwrap();
        fs::write(base.join("secret.txt"), b"secret").unwrap();
        (dir, base)
    }

    async fn collect(job: ArchiveJob) -> Vec<Vec<u8>> {
        archive_chunks(job)
            .map_ok(|chunk| chunk.to_vec())
            .try_collect()
            .await
            .unwrap()
    }

    fn names(archive: &[u8]) -> Vec<String> {
        let zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        zip.file_names().map(str::to_string).collect::<Vec<_>>()
    }

    fn member(archive: &[u8], name: &str) -> Vec<u8> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut file = zip.by_name(name).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        data
    }

    #[tokio::test]
    async fn directory_archive_round_trips() {
        let (_dir, base) = fixture();
        let ctx = context(&base, ServerConfig::default()).await;
        let target = ctx.registry.resolve("docs").await.unwrap();

        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "docs".into())]);
        let archive = collect(job).await.concat();

        let mut listed = names(&archive);
        listed.sort();
        assert_eq!(
            listed,
            [
                "docs/",
                "docs/a.txt",
                "docs/b.txt",
                "docs/sub/",
                "docs/sub/big.bin",
                "docs/sub/empty/",
            ]
        );
        assert_eq!(member(&archive, "docs/a.txt"), b"alpha");
        assert_eq!(
            member(&archive, "docs/sub/big.bin"),
            fs::read(base.join("docs/sub/big.bin")).unwrap()
        );
    }

    #[tokio::test]
    async fn chunks_stay_within_the_read_buffer() {
        let (_dir, base) = fixture();
        let config = ServerConfig {
            chunk_size: 4096,
            ..ServerConfig::default()
        };
        let ctx = context(&base, config).await;
        let target = ctx.registry.resolve("docs/sub").await.unwrap();

        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "sub".into())]);
        let chunks = collect(job).await;
        let (last, body) = chunks.split_last().unwrap();
        assert!(body.iter().all(|c| c.len() <= 4096 + 256), "oversized chunk");
        // Only the central directory may be larger, and it is tiny here.
        assert!(last.len() < 4096);
    }

    #[tokio::test]
    async fn deflate_archive_round_trips() {
        let (_dir, base) = fixture();
        let config = ServerConfig {
            compression: ArchiveCompression::Deflate,
            ..ServerConfig::default()
        };
        let ctx = context(&base, config).await;
        let target = ctx.registry.resolve("docs/sub").await.unwrap();

        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "sub".into())]);
        let archive = collect(job).await.concat();
        assert!(archive.len() < 300_000);
        assert_eq!(
            member(&archive, "sub/big.bin"),
            fs::read(base.join("docs/sub/big.bin")).unwrap()
        );
    }

    #[tokio::test]
    async fn selection_members_are_siblings() {
        let (_dir, base) = fixture();
        let ctx = context(&base, ServerConfig::default()).await;
        let targets = vec![
            ctx.registry.resolve("notes.txt").await.unwrap(),
            ctx.registry.resolve("docs").await.unwrap(),
        ];

        let job = ArchiveJob::new(&ctx, "t".into(), plan_selection(&targets));
        let archive = collect(job).await.concat();
        let listed = names(&archive);
        assert!(listed.contains(&"notes.txt".to_string()));
        assert!(listed.contains(&"docs/a.txt".to_string()));
        assert!(listed.contains(&"docs/b.txt".to_string()));
        assert!(!listed.iter().any(|n| n.contains(".hidden")));
        assert_eq!(member(&archive, "notes.txt"), b"hello world!");
    }

    #[tokio::test]
    async fn colliding_selection_names_are_suffixed() {
        let (_dir, base) = fixture();
        fs::create_dir_all(base.join("docs/sub/x")).unwrap();
        fs::write(base.join("docs/sub/x/a.txt"), b"other").unwrap();
        let ctx = context(&base, ServerConfig::default()).await;
        let targets = vec![
            ctx.registry.resolve("docs/a.txt").await.unwrap(),
            ctx.registry.resolve("docs/sub/x/a.txt").await.unwrap(),
            ctx.registry.resolve("docs/a.txt").await.unwrap(),
        ];

        let plan = plan_selection(&targets);
        let planned: Vec<_> = plan.iter().map(work_name).collect();
        assert_eq!(planned, ["a.txt", "a-2.txt"]);
    }

    #[tokio::test]
    async fn hidden_entries_follow_config() {
        let (_dir, base) = fixture();
        let config = ServerConfig {
            show_hidden: true,
            ..ServerConfig::default()
        };
        let ctx = context(&base, config).await;
        let target = ctx.registry.resolve("docs").await.unwrap();
        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "docs".into())]);
        let archive = collect(job).await.concat();
        assert_eq!(member(&archive, "docs/.hidden"), b"shh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn escaping_and_looping_links_are_skipped() {
        let (_dir, base) = fixture();
        std::os::unix::fs::symlink(base.join("secret.txt"), base.join("docs/leak.txt")).unwrap();
        std::os::unix::fs::symlink(base.join("docs"), base.join("docs/sub/loop")).unwrap();
        std::os::unix::fs::symlink(base.join("gone"), base.join("docs/broken")).unwrap();
        let ctx = context(&base, ServerConfig::default()).await;
        let target = ctx.registry.resolve("docs").await.unwrap();

        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "docs".into())]);
        let archive = collect(job).await.concat();
        let listed = names(&archive);
        assert!(!listed.iter().any(|n| n.contains("leak") || n.contains("broken")));
        assert!(!listed.iter().any(|n| n.starts_with("docs/sub/loop")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_link_to_a_directory_is_archived_in_full() {
        let (_dir, base) = fixture();
        // Sorts before `sub` and points at it.
        std::os::unix::fs::symlink(base.join("docs/sub"), base.join("docs/alias")).unwrap();
        let ctx = context(&base, ServerConfig::default()).await;
        let target = ctx.registry.resolve("docs").await.unwrap();

        let job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "docs".into())]);
        let archive = collect(job).await.concat();
        let listed = names(&archive);
        for name in [
            "docs/alias/",
            "docs/alias/big.bin",
            "docs/alias/empty/",
            "docs/sub/",
            "docs/sub/big.bin",
            "docs/sub/empty/",
        ] {
            assert!(listed.contains(&name.to_string()), "missing {name}: {listed:?}");
        }
        assert_eq!(
            member(&archive, "docs/sub/big.bin"),
            member(&archive, "docs/alias/big.bin")
        );
    }

    #[tokio::test]
    async fn selected_parent_after_child_keeps_the_child() {
        let (_dir, base) = fixture();
        let ctx = context(&base, ServerConfig::default()).await;
        let targets = vec![
            ctx.registry.resolve("docs/sub").await.unwrap(),
            ctx.registry.resolve("docs").await.unwrap(),
        ];

        let job = ArchiveJob::new(&ctx, "t".into(), plan_selection(&targets));
        let archive = collect(job).await.concat();
        let listed = names(&archive);
        for name in ["sub/", "sub/big.bin", "docs/", "docs/sub/", "docs/sub/big.bin", "docs/sub/empty/"] {
            assert!(listed.contains(&name.to_string()), "missing {name}: {listed:?}");
        }
    }

    #[tokio::test]
    async fn dropped_archive_releases_the_open_member() {
        use futures_util::StreamExt;

        let (_dir, base) = fixture();
        let config = ServerConfig {
            chunk_size: 4096,
            ..ServerConfig::default()
        };
        let ctx = context(&base, config).await;
        let target = ctx.registry.resolve("docs/sub").await.unwrap();

        let mut job = ArchiveJob::new(&ctx, "t".into(), vec![Work::for_target(&target, "sub".into())]);
        // `sub/` then the `sub/big.bin` header.
        while job.open.is_none() {
            job.next_chunk().await.unwrap().unwrap();
        }
        let handle = job.open.as_ref().unwrap().reader.handle();

        let mut body = Box::pin(until_cancelled(archive_chunks(job), ctx.shutdown.clone()));
        let first = body.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        assert!(handle.upgrade().is_some());

        drop(body);
        assert!(handle.upgrade().is_none());
    }
}
