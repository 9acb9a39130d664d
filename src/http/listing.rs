//! Directory listings, as JSON for programs and HTML for browsers.

use std::cmp::Ordering;

use axum::Json;
use axum::response::{Html, IntoResponse, Response};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Serialize;
use tracing::debug;

use super::AppContext;
use crate::error::{Error, Result};
use crate::registry::{EntryKind, ResolvedTarget};

/// One child of a listed directory
#[derive(Debug, Clone, Serialize)]
pub struct ListingEntry {
    pub name: String,
    /// Request path of the entry, without leading slash.
    pub path: String,
    pub kind: EntryKind,
    /// Byte size, for files only.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    /// Request path of the listed directory; empty for the root index.
    pub path: String,
    /// Registry version the listing was produced under.
    pub version: u64,
    pub entries: Vec<ListingEntry>,
}

/// Directories first, then case-insensitive by name, ties broken by the
/// exact name.
pub fn sort_entries(entries: &mut [ListingEntry]) {
    entries.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Directory, EntryKind::File) => Ordering::Less,
        (EntryKind::File, EntryKind::Directory) => Ordering::Greater,
        _ => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
    });
}

/// List the immediate children of a resolved directory.
///
/// Entries that cannot be addressed through the registry are left out:
/// names that are not UTF-8, hidden names (unless configured), broken
/// symlinks and symlinks leading outside every shared root.
pub async fn read_directory(ctx: &AppContext, target: &ResolvedTarget) -> Result<Listing> {
    let mut dir = tokio::fs::read_dir(&target.path)
        .await
        .map_err(|e| Error::from_fs(e, &target.relative))?;
    let version = ctx.registry.version().await;

    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| Error::from_fs(e, &target.relative))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            debug!(dir = %target.relative, "skipping entry with non UTF-8 name");
            continue;
        };
        if !ctx.config.is_visible(&name) {
            continue;
        }

        let path = entry.path();
        let is_link = entry
            .file_type()
            .await
            .map(|t| t.is_symlink())
            .unwrap_or(false);
        if is_link {
            match tokio::fs::canonicalize(&path).await {
                Ok(real) if ctx.registry.contains(&real).await => {}
                _ => {
                    debug!(dir = %target.relative, name = %name, "skipping unreachable symlink");
                    continue;
                }
            }
        }

        let Ok(metadata) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let Some(kind) = EntryKind::from_metadata(&metadata) else {
            continue;
        };
        entries.push(ListingEntry {
            path: format!("{}/{}", target.relative, name),
            size: (kind == EntryKind::File).then(|| metadata.len()),
            name,
            kind,
        });
    }

    sort_entries(&mut entries);
    Ok(Listing {
        path: target.relative.clone(),
        version,
        entries,
    })
}

/// The shared roots themselves, in registration order.
pub async fn root_index(ctx: &AppContext) -> Listing {
    let (version, roots) = ctx.registry.snapshot().await;
    let mut entries = Vec::with_capacity(roots.len());
    for root in roots {
        let size = match root.kind {
            EntryKind::File => tokio::fs::metadata(&root.path).await.ok().map(|m| m.len()),
            EntryKind::Directory => None,
        };
        entries.push(ListingEntry {
            path: root.name.clone(),
            name: root.name,
            kind: root.kind,
            size,
        });
    }
    Listing {
        path: String::new(),
        version,
        entries,
    }
}

/// Render `listing` in the representation the client asked for.
pub fn respond(listing: Listing, as_json: bool) -> Response {
    if as_json {
        Json(listing).into_response()
    } else {
        Html(render_html(&listing).into_string()).into_response()
    }
}

/// Percent-encoded absolute URL for a request path.
pub fn href(path: &str, is_dir: bool) -> String {
    let mut url = String::from("/");
    let encoded: Vec<_> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    url.push_str(&encoded.join("/"));
    if is_dir && !encoded.is_empty() {
        url.push('/');
    }
    url
}

/// Format a byte size into a human-readable string.
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

const STYLE: &str = r#"
body{font-family:system-ui,-apple-system,Segoe UI,Roboto,sans-serif;margin:0;background:#f8fafc;color:#0f172a}
header{background:#fff;border-bottom:1px solid #e2e8f0;padding:12px 24px;display:flex;gap:12px;align-items:baseline}
header a{color:#2563eb;text-decoration:none;font-weight:700}
.path{font-family:ui-monospace,monospace;color:#64748b}
main{max-width:960px;margin:24px auto;padding:0 16px}
table{width:100%;border-collapse:collapse;background:#fff;border:1px solid #e2e8f0;border-radius:8px}
th,td{padding:8px 12px;border-bottom:1px solid #f1f5f9;text-align:left}
td.size,th.size{text-align:right;font-family:ui-monospace,monospace;color:#64748b}
td a{color:#0f172a;text-decoration:none}
td a:hover{color:#2563eb}
.actions{margin-top:12px}
button{background:#2563eb;color:#fff;border:0;border-radius:6px;padding:8px 14px;cursor:pointer}
button:disabled{opacity:.5;cursor:default}
"#;

const SCRIPT: &str = r#"
const button = document.getElementById('download-selected');
const boxes = () => Array.from(document.querySelectorAll('input[name=paths]:checked'));
document.addEventListener('change', () => { button.disabled = boxes().length === 0; });
button.addEventListener('click', async () => {
  const paths = boxes().map(b => b.value);
  if (paths.length === 0) return;
  const res = await fetch(location.pathname + '?archive', {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({ paths }),
  });
  if (!res.ok) { alert('Download failed: ' + res.status); return; }
  const url = URL.createObjectURL(await res.blob());
  const a = document.createElement('a');
  a.href = url;
  a.download = 'download.zip';
  document.body.appendChild(a);
  a.click();
  a.remove();
  URL.revokeObjectURL(url);
});
"#;

fn render_html(listing: &Listing) -> Markup {
    let parent = (!listing.path.is_empty()).then(|| match listing.path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    });

    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "lanshare /" (listing.path) }
                style { (PreEscaped(STYLE)) }
            }
            body {
                header {
                    a href="/" { "lanshare" }
                    span.path { "/" (listing.path) }
                }
                main {
                    table {
                        thead {
                            tr {
                                th {}
                                th { "Name" }
                                th.size { "Size" }
                                th {}
                            }
                        }
                        tbody {
                            @if let Some(parent) = &parent {
                                tr {
                                    td {}
                                    td { a href=(href(parent, true)) { ".." } }
                                    td.size {}
                                    td {}
                                }
                            }
                            @for entry in &listing.entries {
                                @let is_dir = entry.kind == EntryKind::Directory;
                                tr {
                                    td { input type="checkbox" name="paths" value=(entry.name); }
                                    td {
                                        a href=(href(&entry.path, is_dir)) {
                                            (entry.name) @if is_dir { "/" }
                                        }
                                    }
                                    td.size {
                                        @match entry.size {
                                            Some(size) => (format_size(size)),
                                            None => "-",
                                        }
                                    }
                                    td {
                                        @if is_dir {
                                            a href={ (href(&entry.path, true)) "?archive" } { "zip" }
                                        }
                                    }
                                }
                            }
                        }
                    }
                    div.actions {
                        button #download-selected type="button" disabled { "Download selected as ZIP" }
                    }
                }
                script { (PreEscaped(SCRIPT)) }
            }
        }
    }
}
