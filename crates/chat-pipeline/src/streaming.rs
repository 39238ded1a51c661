//! Stream session bookkeeping.
//!
//! A session tracks one in-progress response for one message. Every session
//! token is a child of the manager's root token, so closing the manager
//! cancels everything still running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::StreamError;

#[derive(Debug)]
pub struct StreamSession {
    message_id: String,
    token: CancellationToken,
    started_at: Instant,
    first_chunk_at: OnceLock<Instant>,
}

pub type SessionHandle = Arc<StreamSession>;

impl StreamSession {
    fn new(message_id: String, token: CancellationToken) -> Self {
        Self {
            message_id,
            token,
            started_at: Instant::now(),
            first_chunk_at: OnceLock::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn first_chunk_at(&self) -> Option<Instant> {
        self.first_chunk_at.get().copied()
    }

    /// Record the arrival of the first content chunk. Later calls are ignored.
    pub fn record_first_chunk(&self) -> bool {
        self.first_chunk_at.set(Instant::now()).is_ok()
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

pub struct StreamingManager {
    sessions: DashMap<String, SessionHandle>,
    root: CancellationToken,
    closed: AtomicBool,
}

impl Default for StreamingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a session for `message_id`.
    ///
    /// Fails if the message already has a live session or the manager is closed.
    pub fn start_stream(&self, message_id: &str) -> Result<SessionHandle, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let handle = match self.sessions.entry(message_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!("[{}] Stream already live; rejecting second start", message_id);
                return Err(StreamError::AlreadyStreaming(message_id.to_string()));
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(StreamSession::new(
                    message_id.to_string(),
                    self.root.child_token(),
                ));
                entry.insert(session.clone());
                session
            }
        };

        // close() may have drained the map between the check and the insert.
        if self.is_closed() {
            self.cancel_stream(message_id);
            return Err(StreamError::Closed);
        }

        tracing::debug!("[{}] Stream session started", message_id);
        Ok(handle)
    }

    /// Like [`start_stream`](Self::start_stream), but the session is finished
    /// when the returned guard is dropped.
    pub fn start_guarded(self: &Arc<Self>, message_id: &str) -> Result<SessionGuard, StreamError> {
        let handle = self.start_stream(message_id)?;
        Ok(SessionGuard {
            manager: Arc::clone(self),
            handle,
        })
    }

    /// Cancel and remove the session for `message_id`. No-op for unknown ids.
    pub fn cancel_stream(&self, message_id: &str) -> bool {
        match self.sessions.remove(message_id) {
            Some((_, session)) => {
                session.cancel();
                tracing::info!("[{}] Stream cancelled", message_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every live session. Returns how many were cancelled.
    pub fn cancel_all_streams(&self) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let cancelled = ids.iter().filter(|id| self.cancel_stream(id)).count();
        if cancelled > 0 {
            tracing::info!("Cancelled {} live streams", cancelled);
        }
        cancelled
    }

    /// Remove `handle`'s session if it is still the live one for its message.
    pub fn finish_stream(&self, handle: &SessionHandle) -> bool {
        let removed = self
            .sessions
            .remove_if(handle.message_id(), |_, live| Arc::ptr_eq(live, handle))
            .is_some();
        if removed {
            tracing::debug!("[{}] Stream session finished", handle.message_id());
        }
        removed
    }

    pub fn session(&self, message_id: &str) -> Option<SessionHandle> {
        self.sessions.get(message_id).map(|s| s.value().clone())
    }

    pub fn is_streaming(&self, message_id: &str) -> bool {
        self.sessions.contains_key(message_id)
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel all sessions and refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.root.cancel();
        let cancelled = self.cancel_all_streams();
        tracing::info!("Streaming manager closed ({} sessions cancelled)", cancelled);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        self.root.cancel();
        self.sessions.clear();
    }
}

/// Finishes its session on drop, whatever path the send took.
pub struct SessionGuard {
    manager: Arc<StreamingManager>,
    handle: SessionHandle,
}

impl SessionGuard {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = StreamSession;

    fn deref(&self) -> &StreamSession {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.finish_stream(&self.handle);
    }
}
