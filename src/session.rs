//! Nested cassette sessions with strict LIFO scoping

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cassette::{HttpRequest, HttpResponse, WebSocketExchange};
use crate::config::{EngineConfig, Mode, SessionOptions};
use crate::mode::ModeController;
use crate::upstream::Upstream;
use crate::{ReelError, Result};

/// Maximum nesting depth
pub const MAX_DEPTH: usize = 64;

/// Proof of a session entered on a [`SessionStack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: u64,
    name: String,
}

impl SessionHandle {
    /// Cassette name this session is bound to
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Session<U: Upstream> {
    handle: SessionHandle,
    controller: Arc<ModeController<U>>,
}

/// Stack of cassette sessions.
///
/// Requests go to the innermost session. Outer sessions keep their
/// controller (and with it their consumption state) untouched while parked.
pub struct SessionStack<U: Upstream> {
    config: EngineConfig,
    upstream: Arc<U>,
    sessions: RwLock<Vec<Session<U>>>,
    /// Serializes enter/exit/abort
    ops: Mutex<()>,
    next_id: AtomicU64,
}

impl<U: Upstream> SessionStack<U> {
    /// Create an empty stack
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: EngineConfig, upstream: Arc<U>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            upstream,
            sessions: RwLock::new(Vec::new()),
            ops: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Enter a session bound to `name`, parking the current one
    ///
    /// # Errors
    ///
    /// Returns error if the stack is full or the session cannot start
    /// (for example `NotFound` when replaying a missing cassette); the stack
    /// is unchanged on error
    pub async fn enter(
        &self,
        name: &str,
        mode: Mode,
        options: &SessionOptions,
    ) -> Result<SessionHandle> {
        let _ops = self.ops.lock().await;

        let depth = self.sessions.read().await.len();
        if depth >= MAX_DEPTH {
            return Err(ReelError::InvalidState(format!(
                "session stack full: {MAX_DEPTH}"
            )));
        }

        let controller = Arc::new(ModeController::new(
            self.config.with_options(options),
            Arc::clone(&self.upstream),
        )?);
        controller.start(mode, name).await?;

        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
        };

        self.sessions.write().await.push(Session {
            handle: handle.clone(),
            controller,
        });

        info!("Entered session '{}' ({:?}) at depth {}", name, mode, depth + 1);
        Ok(handle)
    }

    /// Exit the innermost session, persisting it per its mode
    ///
    /// # Errors
    ///
    /// - `StackViolation` if `handle` is not the innermost session
    /// - `InvalidState` if `handle` is not on the stack
    /// - the storage error if persisting fails; the session then stays
    ///   on the stack so the caller can retry
    pub async fn exit(&self, handle: &SessionHandle) -> Result<()> {
        let _ops = self.ops.lock().await;

        let session = self.pop_top(handle).await?;

        if let Err(e) = session.controller.stop().await {
            warn!("Failed to stop session '{}': {e}", handle.name);
            self.sessions.write().await.push(session);
            return Err(e);
        }

        info!("Exited session '{}'", handle.name);
        Ok(())
    }

    /// Abort the innermost session without waiting for in-flight requests.
    ///
    /// A recording is discarded unless `best_effort_flush` is set. The
    /// session is removed from the stack even if the flush fails.
    ///
    /// # Errors
    ///
    /// Same ordering errors as [`SessionStack::exit`], or the flush error
    pub async fn abort(&self, handle: &SessionHandle, best_effort_flush: bool) -> Result<()> {
        let _ops = self.ops.lock().await;

        let session = self.pop_top(handle).await?;
        warn!("Aborting session '{}'", handle.name);
        session.controller.abort(best_effort_flush).await
    }

    async fn pop_top(&self, handle: &SessionHandle) -> Result<Session<U>> {
        let mut sessions = self.sessions.write().await;

        match sessions.last() {
            Some(top) if top.handle.id == handle.id => {}
            Some(top) if sessions.iter().any(|s| s.handle.id == handle.id) => {
                return Err(ReelError::StackViolation {
                    exiting: handle.name.clone(),
                    top: top.handle.name.clone(),
                });
            }
            _ => {
                return Err(ReelError::InvalidState(format!(
                    "session '{}' is not active",
                    handle.name
                )));
            }
        }

        sessions
            .pop()
            .ok_or_else(|| ReelError::InvalidState("session stack is empty".to_string()))
    }

    /// Controller of the innermost session
    pub async fn current(&self) -> Option<Arc<ModeController<U>>> {
        self.sessions
            .read()
            .await
            .last()
            .map(|s| Arc::clone(&s.controller))
    }

    /// Handle of the innermost session
    pub async fn current_handle(&self) -> Option<SessionHandle> {
        self.sessions.read().await.last().map(|s| s.handle.clone())
    }

    /// Controller bound to `handle`, parked or not
    pub async fn controller(&self, handle: &SessionHandle) -> Option<Arc<ModeController<U>>> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.handle.id == handle.id)
            .map(|s| Arc::clone(&s.controller))
    }

    /// Number of sessions on the stack
    pub async fn depth(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Route a request to the innermost session
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no session is active, otherwise whatever the
    /// session's controller returns
    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let controller = self.require_current().await?;
        controller.handle_request(request).await
    }

    /// Record a WebSocket exchange into the innermost session
    ///
    /// # Errors
    ///
    /// See [`ModeController::record_websocket`]
    pub async fn record_websocket(&self, exchange: &WebSocketExchange) -> Result<()> {
        let controller = self.require_current().await?;
        controller.record_websocket(exchange).await
    }

    /// Replay a WebSocket exchange from the innermost session
    ///
    /// # Errors
    ///
    /// See [`ModeController::replay_websocket`]
    pub async fn replay_websocket(&self, url: &str) -> Result<WebSocketExchange> {
        let controller = self.require_current().await?;
        controller.replay_websocket(url).await
    }

    async fn require_current(&self) -> Result<Arc<ModeController<U>>> {
        let controller = self.current().await;
        if controller.is_none() {
            debug!("Request with empty session stack");
        }
        controller.ok_or_else(|| ReelError::InvalidState("no active session".to_string()))
    }
}
