//! Registry of shared filesystem roots and request path resolution.
//!
//! Every servable location is reached through [`PathRegistry::resolve`],
//! which enforces the containment rule: the fully symlink-resolved target
//! must lie inside the canonical location of a registered root.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Kind of a filesystem entry as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Kind of whatever `metadata` describes; `None` for sockets, fifos and
    /// other special files, which are never served.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        if metadata.is_dir() {
            Some(EntryKind::Directory)
        } else if metadata.is_file() {
            Some(EntryKind::File)
        } else {
            None
        }
    }
}

/// A registered shared root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPath {
    /// Canonical absolute location; the identity of the entry.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// First URL segment under which the root is served.
    pub name: String,
}

impl SharedPath {
    /// Whether the canonical `path` lies inside this root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// Outcome of resolving a request path
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub root: SharedPath,
    /// Canonical filesystem location.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Normalized request path (`root-name/seg/...`), without leading slash.
    pub relative: String,
}

impl ResolvedTarget {
    /// Final component of the request path, used for download names.
    pub fn display_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }
}

#[derive(Debug, Default)]
struct SharedRegistry {
    entries: Vec<SharedPath>,
    version: u64,
}

/// Ordered set of shared roots.
///
/// Request tasks only ever take the read side, and only long enough to
/// copy out the root they need. The lock is tokio's fair `RwLock`: a
/// queued writer is served before readers that arrive after it, so control
/// mutations are never starved by request traffic.
#[derive(Debug, Default)]
pub struct PathRegistry {
    inner: RwLock<SharedRegistry>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` as a shared root.
    ///
    /// Returns the registered entry. Adding a location that is already
    /// present (by canonical path) returns the existing entry unchanged.
    pub async fn add(&self, path: impl AsRef<Path>) -> Result<SharedPath> {
        let path = path.as_ref();
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| Error::from_fs(e, &path.display().to_string()))?;
        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| Error::from_fs(e, &path.display().to_string()))?;
        let kind = EntryKind::from_metadata(&metadata).ok_or_else(|| {
            Error::Forbidden(format!("{} is not a file or directory", path.display()))
        })?;

        let mut registry = self.inner.write().await;
        if let Some(existing) = registry.entries.iter().find(|e| e.path == canonical) {
            debug!(path = %canonical.display(), "shared path already registered");
            return Ok(existing.clone());
        }

        let base = base_name(&canonical);
        let mut name = base.clone();
        let mut n = 2;
        while registry.entries.iter().any(|e| e.name == name) {
            name = disambiguate(&base, n);
            n += 1;
        }

        let entry = SharedPath {
            path: canonical,
            kind,
            name,
        };
        registry.entries.push(entry.clone());
        registry.version += 1;
        info!(
            name = %entry.name,
            path = %entry.path.display(),
            version = registry.version,
            "shared path added"
        );
        Ok(entry)
    }

    /// Unregister the root whose canonical path matches `path`.
    ///
    /// Returns whether an entry was removed. A root that has vanished from
    /// disk can still be removed by the path it was registered under.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let canonical = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());

        let mut registry = self.inner.write().await;
        let before = registry.entries.len();
        registry.entries.retain(|e| e.path != canonical);
        if registry.entries.len() == before {
            return false;
        }
        registry.version += 1;
        info!(
            path = %canonical.display(),
            version = registry.version,
            "shared path removed"
        );
        true
    }

    /// Snapshot of the registered roots in insertion order.
    pub async fn list(&self) -> Vec<SharedPath> {
        self.inner.read().await.entries.clone()
    }

    /// Snapshot of the roots together with the version they belong to.
    pub async fn snapshot(&self) -> (u64, Vec<SharedPath>) {
        let registry = self.inner.read().await;
        (registry.version, registry.entries.clone())
    }

    /// Bumped on every add and remove.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the canonical `path` lies inside any registered root.
    pub async fn contains(&self, path: &Path) -> bool {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .any(|e| e.contains(path))
    }

    /// Map a URL-decoded request path to a shared location.
    ///
    /// The first segment names the root; the rest is walked beneath it.
    /// Fails with `Forbidden` when the target escapes every root (through
    /// `..`, an absolute or drive-prefixed segment, or a symlink), and with
    /// `NotFound` when the root is unknown or the target does not exist.
    pub async fn resolve(&self, request_path: &str) -> Result<ResolvedTarget> {
        let segments = split_request_path(request_path)?;
        let (root_name, rest) = segments
            .split_first()
            .ok_or_else(|| Error::Forbidden("the server root is not a shared location".into()))?;

        let root = {
            let registry = self.inner.read().await;
            registry
                .entries
                .iter()
                .find(|e| e.name == *root_name)
                .cloned()
        }
        .ok_or_else(|| Error::NotFound(request_path.to_string()))?;

        let mut candidate = root.path.clone();
        for segment in rest {
            candidate.push(segment);
        }

        let escapes = || Error::Forbidden(format!("{request_path} resolves outside every shared root"));
        let canonical = match tokio::fs::canonicalize(&candidate).await {
            Ok(canonical) => canonical,
            Err(e) => {
                // A missing target behind an escaping link must look the
                // same as an existing one.
                if let Some(existing) = nearest_existing(&candidate).await {
                    if !root.contains(&existing) && !self.contains(&existing).await {
                        return Err(escapes());
                    }
                }
                return Err(Error::from_fs(e, request_path));
            }
        };
        if !root.contains(&canonical) && !self.contains(&canonical).await {
            return Err(escapes());
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| Error::from_fs(e, request_path))?;
        let kind = EntryKind::from_metadata(&metadata)
            .ok_or_else(|| Error::Forbidden(format!("{request_path} is not a file or directory")))?;

        Ok(ResolvedTarget {
            root,
            path: canonical,
            kind,
            relative: segments.join("/"),
        })
    }
}

/// Canonical location of the deepest entry on the way to `path` that exists.
///
/// Dangling links are followed through their target text, so the result is
/// where the walk actually leaves the filesystem. `None` when nothing on the
/// way resolves or the links do not settle.
async fn nearest_existing(path: &Path) -> Option<PathBuf> {
    const MAX_LINK_HOPS: usize = 40;

    let mut path = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let mut found = None;
        for ancestor in path.ancestors() {
            if let Ok(metadata) = tokio::fs::symlink_metadata(ancestor).await {
                found = Some((ancestor.to_path_buf(), metadata.file_type().is_symlink()));
                break;
            }
        }
        let (entry, is_link) = found?;
        match tokio::fs::canonicalize(&entry).await {
            Ok(canonical) => return Some(canonical),
            Err(_) if is_link => {
                let target = tokio::fs::read_link(&entry).await.ok()?;
                path = match entry.parent() {
                    Some(parent) => parent.join(target),
                    None => target,
                };
            }
            Err(_) => return None,
        }
    }
    None
}

/// Split a decoded request path into normalized segments.
///
/// Empty and `.` segments are dropped and `..` pops the previous segment.
/// A `..` that would climb above the first segment, or any segment that is
/// not a plain name on this platform (root, drive prefix, embedded
/// separator or NUL), is a containment violation.
pub fn split_request_path(request_path: &str) -> Result<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::Forbidden(format!(
                        "{request_path} climbs above the shared roots"
                    )));
                }
            }
            name => {
                if name.contains(['\\', '\0']) || !is_plain_name(name) {
                    return Err(Error::Forbidden(format!(
                        "{request_path} contains an absolute or invalid segment"
                    )));
                }
                segments.push(name.to_string());
            }
        }
    }
    Ok(segments)
}

fn is_plain_name(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Final component of a canonical path, as served in URLs.
fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// `name` with `-n` inserted before the extension: `a.txt` → `a-2.txt`,
/// `docs` → `docs-2`. Dot-files keep their leading dot.
pub fn disambiguate(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{name}-{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("docs/sub")).unwrap();
        fs::write(base.join("docs/a.txt"), b"a").unwrap();
        fs::write(base.join("docs/sub/b.txt"), b"b").unwrap();
        fs::write(base.join("notes.txt"), b"hello world!").unwrap();
        fs::write(base.join("secret.txt"), b"secret").unwrap();
        (dir, base)
    }

    #[tokio::test]
    async fn add_is_idempotent_on_canonical_path() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();

        registry.add(base.join("docs")).await.unwrap();
        registry.add(base.join("docs/sub/..")).await.unwrap();
        registry.add(base.join("docs/")).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.version().await, 1);
    }

    #[tokio::test]
    async fn add_missing_path_is_not_found() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        let err = registry.add(base.join("nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(registry.is_empty().await);
        assert_eq!(registry.version().await, 0);
    }

    #[tokio::test]
    async fn keeps_insertion_order_and_bumps_version() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        registry.add(base.join("notes.txt")).await.unwrap();
        registry.add(base.join("docs")).await.unwrap();

        let (version, entries) = registry.snapshot().await;
        assert_eq!(version, 2);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["notes.txt", "docs"]);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].kind, EntryKind::Directory);

        assert!(!registry.remove(base.join("secret.txt")).await);
        assert_eq!(registry.version().await, 2);

        assert!(registry.remove(base.join("notes.txt")).await);
        assert_eq!(registry.version().await, 3);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();
        let before = registry.list().await;
        registry.add(base.join("notes.txt")).await.unwrap();
        assert_eq!(before.len(), 1);
    }

    #[tokio::test]
    async fn colliding_names_are_disambiguated() {
        let (_dir, base) = fixture();
        fs::create_dir_all(base.join("other/docs")).unwrap();
        let registry = PathRegistry::new();

        let first = registry.add(base.join("docs")).await.unwrap();
        let second = registry.add(base.join("other/docs")).await.unwrap();
        assert_eq!(first.name, "docs");
        assert_eq!(second.name, "docs-2");

        let target = registry.resolve("docs-2").await.unwrap();
        assert_eq!(target.path, base.join("other/docs"));
    }

    #[tokio::test]
    async fn resolves_files_and_directories() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();
        registry.add(base.join("notes.txt")).await.unwrap();

        let target = registry.resolve("docs/sub/b.txt").await.unwrap();
        assert_eq!(target.kind, EntryKind::File);
        assert_eq!(target.path, base.join("docs/sub/b.txt"));
        assert_eq!(target.relative, "docs/sub/b.txt");
        assert_eq!(target.display_name(), "b.txt");

        let target = registry.resolve("/docs/./sub/../").await.unwrap();
        assert_eq!(target.kind, EntryKind::Directory);
        assert_eq!(target.relative, "docs");

        let target = registry.resolve("notes.txt").await.unwrap();
        assert_eq!(target.kind, EntryKind::File);
    }

    #[tokio::test]
    async fn traversal_outside_roots_is_forbidden() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();

        for path in [
            "../secret.txt",
            "docs/../../secret.txt",
            "docs/../..",
            "docs/sub/../../../notes.txt",
            "docs\\..\\..\\secret.txt",
        ] {
            let err = registry.resolve(path).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)), "{path}: {err:?}");
        }
        assert!(matches!(
            registry.resolve("").await.unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn missing_targets_are_not_found() {
        let (_dir, base) = fixture();
        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();
        registry.add(base.join("notes.txt")).await.unwrap();

        for path in ["docs/missing.txt", "unshared/a.txt", "notes.txt/inner", "secret.txt"] {
            let err = registry.resolve(path).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)), "{path}: {err:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_forbidden() {
        let (_dir, base) = fixture();
        std::os::unix::fs::symlink(base.join("secret.txt"), base.join("docs/leak.txt")).unwrap();
        std::os::unix::fs::symlink(&base, base.join("docs/up")).unwrap();

        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();

        for path in ["docs/leak.txt", "docs/up/secret.txt", "docs/up"] {
            let err = registry.resolve(path).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)), "{path}: {err:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_targets_behind_escaping_links_are_forbidden() {
        let (_dir, base) = fixture();
        std::os::unix::fs::symlink("..", base.join("docs/up")).unwrap();
        std::os::unix::fs::symlink(base.join("gone/deeper"), base.join("docs/dangling")).unwrap();
        std::os::unix::fs::symlink("nowhere", base.join("docs/inside")).unwrap();

        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();

        // Existing and missing files outside the roots answer alike.
        for path in ["docs/up/secret.txt", "docs/up/missing.txt", "docs/up/gone/x", "docs/dangling"] {
            let err = registry.resolve(path).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)), "{path}: {err:?}");
        }
        for path in ["docs/missing.txt", "docs/sub/missing/x", "docs/inside"] {
            let err = registry.resolve(path).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)), "{path}: {err:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_into_another_root_is_allowed() {
        let (_dir, base) = fixture();
        std::os::unix::fs::symlink(base.join("notes.txt"), base.join("docs/notes-link")).unwrap();

        let registry = PathRegistry::new();
        registry.add(base.join("docs")).await.unwrap();
        registry.add(base.join("notes.txt")).await.unwrap();

        let target = registry.resolve("docs/notes-link").await.unwrap();
        assert_eq!(target.path, base.join("notes.txt"));
    }

    #[test]
    fn disambiguated_names_keep_extension() {
        assert_eq!(disambiguate("a.txt", 2), "a-2.txt");
        assert_eq!(disambiguate("docs", 3), "docs-3");
        assert_eq!(disambiguate(".env", 2), ".env-2");
        assert_eq!(disambiguate("archive.tar.gz", 2), "archive.tar-2.gz");
    }
}
