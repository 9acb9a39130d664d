//! Request dispatch: method check, path resolution, handler selection.

use std::path::Path;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AppContext, archive, file, listing};
use crate::error::{Error, Result};
use crate::registry::{EntryKind, ResolvedTarget};

/// Query flags understood on every path
#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    /// Present (with any value) to request a ZIP instead of a listing.
    pub archive: Option<String>,
    /// `json` or `html` to override `Accept` negotiation.
    pub format: Option<String>,
}

/// Body of a multi-selection archive request
#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    #[serde(alias = "files")]
    pub paths: Vec<String>,
}

/// Entry point for every request the server receives.
pub async fn handle(
    State(ctx): State<AppContext>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&ctx, &method, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(err) => {
            if err.status() == StatusCode::INTERNAL_SERVER_ERROR {
                warn!(%method, path = %uri.path(), error = %err, "request failed");
            } else {
                debug!(%method, path = %uri.path(), error = %err, "request rejected");
            }
            err.into_response()
        }
    }
}

pub async fn dispatch(
    ctx: &AppContext,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response> {
    if method != Method::GET && method != Method::POST {
        return Err(Error::MethodNotAllowed(method.clone()));
    }

    let Query(query) = Query::<RequestQuery>::try_from_uri(uri)
        .map_err(|e| Error::Validation(e.body_text()))?;
    let path = urlencoding::decode(uri.path())
        .map_err(|_| Error::Validation("request path is not valid UTF-8".into()))?;
    let path = path.trim_matches('/');
    debug!(%method, path, archive = query.archive.is_some(), "dispatching");

    if method == Method::POST {
        if query.archive.is_none() {
            return Err(Error::MethodNotAllowed(Method::POST));
        }
        let targets = resolve_selection(ctx, path, body).await?;
        return archive::selection(ctx, &targets);
    }

    if path.is_empty() {
        let index = listing::root_index(ctx).await;
        return Ok(listing::respond(index, wants_json(headers, &query)));
    }

    let target = ctx.registry.resolve(path).await?;
    match target.kind {
        EntryKind::Directory if query.archive.is_some() => archive::directory(ctx, &target),
        EntryKind::Directory => {
            let listing = listing::read_directory(ctx, &target).await?;
            Ok(listing::respond(listing, wants_json(headers, &query)))
        }
        EntryKind::File => {
            let range = headers
                .get(header::RANGE)
                .and_then(|value| value.to_str().ok());
            file::serve(ctx, &target, range).await
        }
    }
}

/// Resolve every entry of a selection body relative to `base`.
///
/// The request fails as a whole on the first entry that is absolute,
/// escapes the shared roots or does not exist.
async fn resolve_selection(ctx: &AppContext, base: &str, body: &[u8]) -> Result<Vec<ResolvedTarget>> {
    let request: SelectionRequest = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("malformed selection: {e}")))?;
    if request.paths.is_empty() {
        return Err(Error::Validation("selection is empty".into()));
    }

    let mut targets = Vec::with_capacity(request.paths.len());
    for entry in &request.paths {
        if entry.starts_with(['/', '\\']) || Path::new(entry).is_absolute() {
            return Err(Error::Forbidden(format!("{entry} is an absolute path")));
        }
        let joined = if base.is_empty() {
            entry.clone()
        } else {
            format!("{base}/{entry}")
        };
        targets.push(ctx.registry.resolve(&joined).await?);
    }
    Ok(targets)
}

/// Whether a listing should be rendered as JSON rather than HTML.
pub fn wants_json(headers: &HeaderMap, query: &RequestQuery) -> bool {
    match query.format.as_deref() {
        Some(format) if format.eq_ignore_ascii_case("json") => return true,
        Some(format) if format.eq_ignore_ascii_case("html") => return false,
        _ => {}
    }
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .fold((false, false), |(json, html), value| {
            (
                json || value.contains("application/json"),
                html || value.contains("text/html"),
            )
        })
        == (true, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(format: Option<&str>) -> RequestQuery {
        RequestQuery {
            archive: None,
            format: format.map(str::to_string),
        }
    }

    #[test]
    fn negotiates_listing_format() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers, &query(None)));
        assert!(wants_json(&headers, &query(Some("json"))));

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(wants_json(&headers, &query(None)));
        assert!(!wants_json(&headers, &query(Some("html"))));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9"),
        );
        assert!(!wants_json(&headers, &query(None)));
    }

    #[test]
    fn archive_flag_accepts_bare_key() {
        let uri: Uri = "/docs?archive".parse().unwrap();
        let Query(query) = Query::<RequestQuery>::try_from_uri(&uri).unwrap();
        assert!(query.archive.is_some());

        let uri: Uri = "/docs".parse().unwrap();
        let Query(query) = Query::<RequestQuery>::try_from_uri(&uri).unwrap();
        assert!(query.archive.is_none());
    }

    #[test]
    fn selection_accepts_files_alias() {
        let request: SelectionRequest = serde_json::from_str(r#"{"files":["a","b/c"]}"#).unwrap();
        assert_eq!(request.paths, ["a", "b/c"]);
    }
}
