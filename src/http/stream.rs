//! Body stream plumbing shared by file and archive responses.

use std::io;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

/// End `body` with an error as soon as `shutdown` fires.
///
/// The error makes the HTTP layer drop the connection instead of closing
/// the body cleanly, so a client never mistakes a cut-off transfer for a
/// complete one. Dropping the inner stream releases its file handles.
pub fn until_cancelled<S>(
    body: S,
    shutdown: CancellationToken,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let body: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> = Box::pin(body);
    stream::unfold(Some((body, shutdown)), |state| async move {
        let (mut body, shutdown) = state?;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("server stopping, abandoning transfer");
                let err = io::Error::new(io::ErrorKind::Interrupted, "server stopping");
                Some((Err(err), None))
            }
            item = body.next() => {
                let item = item?;
                Some((item, Some((body, shutdown))))
            }
        }
    })
}

/// Accounting for one streamed response.
///
/// If the response body is dropped before [`Transfer::finish`] runs, the
/// peer went away mid-stream (or the server is stopping); that is logged
/// as a disconnect, never as a server error.
pub struct Transfer {
    label: String,
    expected: Option<u64>,
    sent: u64,
    started: Instant,
    done: bool,
}

impl Transfer {
    pub fn new(label: impl Into<String>, expected: Option<u64>) -> Self {
        Self {
            label: label.into(),
            expected,
            sent: 0,
            started: Instant::now(),
            done: false,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.sent += bytes as u64;
    }

    pub fn finish(&mut self) {
        self.done = true;
        debug!(
            target: "lanshare::transfer",
            transfer = %self.label,
            bytes = self.sent,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "transfer complete"
        );
    }

    /// The body failed after headers went out; the connection will be
    /// terminated without a status change.
    pub fn fail(&mut self, err: &io::Error) {
        self.done = true;
        warn!(
            target: "lanshare::transfer",
            transfer = %self.label,
            bytes = self.sent,
            error = %err,
            "transfer aborted"
        );
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.done {
            debug!(
                target: "lanshare::transfer",
                transfer = %self.label,
                bytes = self.sent,
                expected = ?self.expected,
                reason = %Error::ClientDisconnected,
                "transfer cancelled"
            );
        }
    }
}
