use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Broadcast event stream type used by session subscribers.
pub type SessionEventStream = broadcast::Receiver<SessionEvent>;

/// Events emitted while the client session is being torn down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// A teardown sequence took the guard.
    TeardownStarted,
    /// One session sink failed to clear; the sequence continued.
    SinkFailed {
        /// Name of the sink that failed.
        sink: String,
        /// Failure message.
        message: String,
    },
    /// The embedding application should navigate to the sign-in entry point.
    RedirectToSignIn {
        /// Sign-in path, for example `/login`.
        path: String,
    },
    /// The teardown sequence finished and the guard was released.
    TeardownFinished {
        /// Number of sinks that failed.
        failed_sinks: usize,
    },
}

/// Fan-out channel for session events.
#[derive(Clone, Debug)]
pub struct SessionEvents {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted session events.
    pub fn subscribe(&self) -> SessionEventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Receive the next event, skipping over lag notifications.
///
/// Returns `None` once every sender is gone.
pub async fn recv_event(events: &mut SessionEventStream) -> Option<SessionEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
