//! Lifecycle notification and server state.
//!
//! A server hands its caller a [`Notify`] when it starts. The server keeps
//! the matching [`Notifier`] inside its background task and fires it at most
//! once, when that task dies for a reason other than a requested shutdown.
//! If the task ends cleanly the notifier is dropped and the `Notify`
//! resolves to `None`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, watch};

use crate::Error;

/// Sending half of a one-shot fatal-error notification.
#[derive(Debug)]
pub struct Notifier(oneshot::Sender<Error>);

impl Notifier {
    /// Report a fatal error. Consumes the notifier; a dropped [`Notify`] is
    /// ignored.
    pub fn notify(self, err: Error) {
        let _ = self.0.send(err);
    }
}

/// Receiving half: resolves once with the fatal error, or `None` if the
/// server stopped without one.
#[derive(Debug)]
pub struct Notify(oneshot::Receiver<Error>);

impl Future for Notify {
    type Output = Option<Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(Result::ok)
    }
}

/// Create a connected notifier pair.
pub fn notify_channel() -> (Notifier, Notify) {
    let (tx, rx) = oneshot::channel();
    (Notifier(tx), Notify(rx))
}

/// Server lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared, observable [`ServerState`] that refuses backward transitions.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ServerState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::Created);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Move to `next` if it is ahead of the current state. Returns whether
    /// the state changed.
    pub(crate) fn advance(&self, next: ServerState) -> bool {
        self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Wait until the state reaches at least `target`.
    pub(crate) async fn wait_for(&self, target: ServerState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state >= target).await;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn notify_delivers_error_once() {
        let (notifier, notify) = notify_channel();
        notifier.notify(Error::ConnectionLost);
        assert!(matches!(notify.await, Some(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn dropped_notifier_resolves_none() {
        let (notifier, notify) = notify_channel();
        drop(notifier);
        assert!(notify.await.is_none());
    }

    #[test]
    fn state_is_monotonic() {
        // ---
        let state = StateCell::new();
        assert!(state.advance(ServerState::Running));
        assert!(state.advance(ServerState::Stopped));
        assert!(!state.advance(ServerState::Running));
        assert!(!state.advance(ServerState::ShuttingDown));
        assert_eq!(state.get(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn wait_for_returns_once_reached() {
        // ---
        let state = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for(ServerState::Stopped).await })
        };
        state.advance(ServerState::Running);
        state.advance(ServerState::Stopped);
        waiter.await.unwrap();
    }
}
