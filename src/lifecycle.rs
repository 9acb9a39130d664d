//! Start/stop control of the HTTP server.
//!
//! A [`ServerLifecycle`] owns at most one running session. The session owns
//! the registry, the listener task and the cancellation token that every
//! request task observes; nothing lives in a global.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::{self, AppContext};
use crate::registry::{PathRegistry, SharedPath};

/// Externally visible server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One running listener
struct ServerSession {
    addr: SocketAddr,
    registry: Arc<PathRegistry>,
    shutdown: CancellationToken,
    serve: JoinHandle<()>,
}

enum Lifecycle {
    Stopped,
    Starting,
    Running(ServerSession),
    Stopping,
}

impl Lifecycle {
    fn state(&self) -> ServerState {
        match self {
            Lifecycle::Stopped => ServerState::Stopped,
            Lifecycle::Starting => ServerState::Starting,
            Lifecycle::Running(_) => ServerState::Running,
            Lifecycle::Stopping => ServerState::Stopping,
        }
    }
}

/// Control surface for the file server
pub struct ServerLifecycle {
    config: Arc<ServerConfig>,
    state: Mutex<Lifecycle>,
}

/// Puts the lifecycle back to `Stopped` if `start()` bails out early.
struct StartGuard<'a> {
    lifecycle: &'a ServerLifecycle,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.lifecycle.lock() = Lifecycle::Stopped;
        }
    }
}

impl ServerLifecycle {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Mutex::new(Lifecycle::Stopped),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lock().state()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            Lifecycle::Running(session) => Some(session.addr),
            _ => None,
        }
    }

    /// Register `roots` and start listening on `port`.
    ///
    /// Roots must be absolute. A root that does not resolve is dropped with
    /// a warning; the server still starts. On any error the lifecycle is
    /// back in `Stopped`.
    pub async fn start<I, P>(&self, port: u16, roots: I) -> Result<SocketAddr>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if port == 0 {
            return Err(Error::Validation("port must be between 1 and 65535".into()));
        }
        let roots: Vec<_> = roots.into_iter().collect();
        if roots.is_empty() {
            return Err(Error::Validation("at least one shared path is required".into()));
        }
        if let Some(relative) = roots.iter().find(|p| !p.as_ref().is_absolute()) {
            return Err(Error::Validation(format!(
                "shared path {} is not absolute",
                relative.as_ref().display()
            )));
        }

        {
            let mut state = self.lock();
            if !matches!(*state, Lifecycle::Stopped) {
                return Err(Error::AlreadyRunning);
            }
            *state = Lifecycle::Starting;
        }
        let mut guard = StartGuard {
            lifecycle: self,
            armed: true,
        };

        let registry = Arc::new(PathRegistry::new());
        for root in &roots {
            if let Err(e) = registry.add(root).await {
                warn!(path = %root.as_ref().display(), error = %e, "dropping shared path");
            }
        }

        let addr = SocketAddr::new(self.config.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let app = http::app(AppContext {
            registry: Arc::clone(&registry),
            config: Arc::clone(&self.config),
            shutdown: shutdown.clone(),
        });
        let serve = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    warn!(error = %e, "server loop ended with an error");
                }
            }
        });

        let shared = registry.len().await;
        guard.armed = false;
        *self.lock() = Lifecycle::Running(ServerSession {
            addr,
            registry,
            shutdown,
            serve,
        });
        info!(%addr, roots = shared, "server running");
        Ok(addr)
    }

    /// Stop accepting connections and abandon in-flight transfers.
    ///
    /// Streaming bodies are cut off at their next poll. The listener task
    /// gets `shutdown_timeout` to wind down before it is aborted, so this
    /// always returns in bounded time.
    ///
    /// Connection tasks are spawned by axum and are not aborted with the
    /// listener. A connection whose client stopped reading never polls its
    /// body again, so it keeps its open file until the socket errors or
    /// the client goes away; it cannot deliver the rest of the transfer.
    pub async fn stop(&self) -> Result<()> {
        let session = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, Lifecycle::Stopping) {
                Lifecycle::Running(session) => session,
                other => {
                    *state = other;
                    return Err(Error::NotRunning);
                }
            }
        };

        info!(addr = %session.addr, "stopping server");
        session.shutdown.cancel();
        let mut serve = session.serve;
        match tokio::time::timeout(self.config.shutdown_timeout, &mut serve).await {
            Ok(_) => debug!("server loop finished"),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "server loop did not finish in time, aborting"
                );
                serve.abort();
                let _ = serve.await;
            }
        }

        *self.lock() = Lifecycle::Stopped;
        info!("server stopped");
        Ok(())
    }

    /// Share another path on the running server.
    pub async fn add_path(&self, path: impl AsRef<Path>) -> Result<SharedPath> {
        self.running_registry()?.add(path).await
    }

    /// Stop sharing a path on the running server. Returns whether it was shared.
    pub async fn remove_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.running_registry()?.remove(path).await)
    }

    /// Roots shared by the running server, in registration order.
    pub async fn shared_paths(&self) -> Result<Vec<SharedPath>> {
        Ok(self.running_registry()?.list().await)
    }

    fn running_registry(&self) -> Result<Arc<PathRegistry>> {
        match &*self.lock() {
            Lifecycle::Running(session) => Ok(Arc::clone(&session.registry)),
            _ => Err(Error::NotRunning),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ServerLifecycle {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running(session) = state {
            session.shutdown.cancel();
            session.serve.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(base.join("docs")).unwrap();
        std::fs::write(base.join("notes.txt"), b"hello world!").unwrap();
        (dir, base)
    }

    #[tokio::test]
    async fn start_stop_cycle() {
        let (_dir, base) = fixture();
        let server = ServerLifecycle::new(local_config());
        assert_eq!(server.state(), ServerState::Stopped);

        let addr = server.start(free_port(), [base.join("docs")]).await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert_eq!(server.local_addr(), Some(addr));

        assert!(matches!(
            server.start(free_port(), [base.join("docs")]).await,
            Err(Error::AlreadyRunning)
        ));
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));

        // The port is free again once stop() returns.
        let again = server.start(addr.port(), [base.join("docs")]).await.unwrap();
        assert_eq!(again.port(), addr.port());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_start_arguments() {
        let (_dir, base) = fixture();
        let server = ServerLifecycle::new(local_config());

        let empty: [PathBuf; 0] = [];
        assert!(matches!(server.start(8080, empty).await, Err(Error::Validation(_))));
        assert!(matches!(
            server.start(0, [base.join("docs")]).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            server.start(free_port(), ["relative/dir"]).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_returns_to_stopped() {
        let (_dir, base) = fixture();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = ServerLifecycle::new(local_config());
        let err = server.start(port, [base.join("docs")]).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }), "{err:?}");
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn unresolvable_roots_are_dropped() {
        let (_dir, base) = fixture();
        let server = ServerLifecycle::new(local_config());
        server
            .start(free_port(), [base.join("missing"), base.join("notes.txt")])
            .await
            .unwrap();

        let shared = server.shared_paths().await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].name, "notes.txt");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn hot_mutation_requires_running_server() {
        let (_dir, base) = fixture();
        let server = ServerLifecycle::new(local_config());
        assert!(matches!(
            server.add_path(base.join("docs")).await,
            Err(Error::NotRunning)
        ));

        server.start(free_port(), [base.join("docs")]).await.unwrap();
        server.add_path(base.join("notes.txt")).await.unwrap();
        assert_eq!(server.shared_paths().await.unwrap().len(), 2);
        assert!(server.remove_path(base.join("docs")).await.unwrap());
        assert!(!server.remove_path(base.join("docs")).await.unwrap());
        assert_eq!(server.shared_paths().await.unwrap().len(), 1);
        server.stop().await.unwrap();

        assert!(matches!(server.shared_paths().await, Err(Error::NotRunning)));
    }
}
