//! HTTP surface of the file server.
//!
//! ## Architecture
//!
//! - [`router`]: method check, path resolution and dispatch
//! - [`file`]: single-file responses with byte ranges
//! - [`listing`]: directory listings (JSON and HTML)
//! - [`archive`]: streamed ZIP of a directory or a selection
//! - [`stream`]: cancellation and accounting for streamed bodies
//!
//! Every route goes through one fallback handler, since the first path
//! segment names a shared root and the rest is arbitrary depth.

pub mod archive;
pub mod file;
pub mod listing;
pub mod router;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::registry::PathRegistry;

/// Shared state handed to every request
#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<PathRegistry>,
    pub config: Arc<ServerConfig>,
    /// Fired by `stop()`; streamed bodies end as soon as it is cancelled.
    pub shutdown: CancellationToken,
}

pub fn app(ctx: AppContext) -> Router {
    Router::new()
        .fallback(router::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
