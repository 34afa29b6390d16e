//! Operator-facing scan status.
//!
//! The orchestrator publishes a [`ScanStatus`] snapshot on a tokio watch
//! channel; front ends subscribe and render whatever they need.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    #[default]
    Idle,
    /// Accepted, preparing hardware and files; no motion yet.
    Pending,
    Scanning,
    /// Abort requested; winding down to idle.
    Abort,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanState::Idle => "idle",
            ScanState::Pending => "pending",
            ScanState::Scanning => "scanning",
            ScanState::Abort => "abort",
        })
    }
}

/// Snapshot of the orchestrator's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub message: String,
    /// 1-based row in progress, 0 before the first row.
    pub row: usize,
    pub rows: usize,
    pub npts: usize,
    /// Row redos so far in this scan.
    pub redos: u32,
    pub folder: Option<PathBuf>,
}

/// Write side of the status channel.
#[derive(Debug)]
pub(crate) struct StatusBoard {
    tx: watch::Sender<ScanStatus>,
}

impl StatusBoard {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ScanStatus::default());
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> ScanStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn state(&self) -> ScanState {
        self.tx.borrow().state
    }

    pub(crate) fn set_state(&self, state: ScanState, message: impl Into<String>) {
        let message = message.into();
        info!(%state, %message, "scan state");
        self.tx.send_modify(|s| {
            s.state = state;
            s.message = message;
        });
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ScanStatus)) {
        self.tx.send_modify(f);
    }
}

/// Cooperative abort flag shared between the orchestrator and its callers.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Requests that the running scan stop before its next row.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_updates_reach_subscribers() {
        let board = StatusBoard::new();
        let rx = board.subscribe();
        board.set_state(ScanState::Pending, "preparing");
        board.update(|s| s.rows = 4);
        let seen = rx.borrow().clone();
        assert_eq!(seen.state, ScanState::Pending);
        assert_eq!(seen.message, "preparing");
        assert_eq!(seen.rows, 4);
    }

    #[test]
    fn test_abort_handle_is_shared() {
        let handle = AbortHandle::default();
        let other = handle.clone();
        other.abort();
        assert!(handle.is_aborted());
        handle.reset();
        assert!(!other.is_aborted());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ScanState::Scanning.to_string(), "scanning");
        assert_eq!(ScanState::default(), ScanState::Idle);
    }
}
