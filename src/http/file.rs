//! Single-file responses with byte-range support.

use std::io;
use std::path::Path;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use futures_util::{Stream, stream};
use tracing::debug;

use super::AppContext;
use super::stream::{Transfer, until_cancelled};
use crate::error::{Error, Result};
use crate::io::{LocalFileReader, ReadAt};
use crate::registry::ResolvedTarget;

/// Outcome of interpreting a `Range` header against a resource length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Serve the whole resource.
    Full,
    /// Serve the inclusive span `start..=end`.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl ByteRange {
    /// Interpret a `Range` header value for a resource of `len` bytes.
    ///
    /// Only a single `bytes=` range is honored. Multiple ranges, other units
    /// and malformed specs fall back to the full resource. An end past the
    /// resource is clamped; a start at or past it cannot be satisfied.
    pub fn parse(header: Option<&str>, len: u64) -> Self {
        let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
            return ByteRange::Full;
        };
        if ranges.contains(',') {
            return ByteRange::Full;
        }
        let Some((start, end)) = ranges.trim().split_once('-') else {
            return ByteRange::Full;
        };
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // Suffix form: the last `n` bytes.
            let Ok(n) = end.parse::<u64>() else {
                return ByteRange::Full;
            };
            if n == 0 || len == 0 {
                return ByteRange::Unsatisfiable;
            }
            return ByteRange::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            };
        }

        let Ok(start) = start.parse::<u64>() else {
            return ByteRange::Full;
        };
        let end = if end.is_empty() {
            None
        } else {
            match end.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return ByteRange::Full,
            }
        };

        if start >= len {
            return ByteRange::Unsatisfiable;
        }
        let end = end.map_or(len - 1, |end| end.min(len - 1));
        ByteRange::Partial { start, end }
    }
}

/// Stream the file behind `target`, honoring a single-range request.
pub async fn serve(ctx: &AppContext, target: &ResolvedTarget, range: Option<&str>) -> Result<Response> {
    let reader = LocalFileReader::open(&target.path).await.map_err(|e| match e.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::IsADirectory => {
            Error::Forbidden(format!("{} is a directory", target.relative))
        }
        _ => Error::from_fs(e, &target.relative),
    })?;
    let len = reader.size();

    let (status, start, end) = match ByteRange::parse(range, len) {
        ByteRange::Full => (StatusCode::OK, 0, len),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end + 1),
        ByteRange::Unsatisfiable => return Err(Error::RangeNotSatisfiable { len }),
    };
    let body_len = end - start;
    debug!(path = %target.relative, len, start, body_len, "streaming file");

    let transfer = Transfer::new(target.relative.clone(), Some(body_len));
    let body = file_chunks(reader, start, body_len, ctx.config.chunk_size, transfer);
    let body = until_cancelled(body, ctx.shutdown.clone());

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type(&target.path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = attachment(target.display_name()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if status == StatusCode::PARTIAL_CONTENT {
        let value = format!("bytes {}-{}/{}", start, end - 1, len);
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// Read `len` bytes from `offset` in chunks of at most `chunk_size`.
///
/// A file that shrinks underneath the stream ends it with `UnexpectedEof`.
pub fn file_chunks(
    reader: LocalFileReader,
    offset: u64,
    len: u64,
    chunk_size: usize,
    transfer: Transfer,
) -> impl Stream<Item = io::Result<bytes::Bytes>> + Send + 'static {
    let chunk_size = chunk_size.max(1);
    stream::try_unfold(
        (reader, offset, len, transfer),
        move |(reader, offset, remaining, mut transfer)| async move {
            if remaining == 0 {
                transfer.finish();
                return Ok(None);
            }
            let want = remaining.min(chunk_size as u64) as usize;
            let chunk = match reader.read_at(offset, want).await {
                Ok(chunk) if chunk.is_empty() => {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while streaming",
                    );
                    transfer.fail(&err);
                    return Err(err);
                }
                Ok(chunk) => chunk,
                Err(err) => {
                    transfer.fail(&err);
                    return Err(err);
                }
            };
            let n = chunk.len() as u64;
            transfer.record(chunk.len());
            Ok(Some((chunk, (reader, offset + n, remaining - n, transfer))))
        },
    )
}

/// `Content-Disposition: attachment` for `name`, with an ASCII fallback
/// and the exact name in RFC 5987 form.
pub fn attachment(name: &str) -> std::result::Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    ))
}

/// Content type by file extension; unknown extensions are opaque bytes.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "log" | "md" | "csv" | "ini" | "conf") => "text/plain; charset=utf-8",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz" | "tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("7z") => "application/x-7z-compressed",
        Some("rar") => "application/vnd.rar",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("heic") => "image/heic",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("mp4" | "m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("ppt") => "application/vnd.ms-powerpoint",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        Some("epub") => "application/epub+zip",
        Some("apk") => "application/vnd.android.package-archive",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
