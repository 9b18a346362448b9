//! Command cancellation relayed through the heartbeat.
//!
//! The interrupt handler only stores into a process-wide atomic cell. A
//! [`CancellationToken`] reads that cell: when an interrupt is pending it
//! snapshots the currently running command id into its cancelled register and
//! arms a single relay that the heartbeat thread forwards to the server.
//! Cancellation is advisory; the server decides whether the command stops.

use crate::error::{CommError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use tracing::debug;

static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: Once = Once::new();

/// Install a Ctrl-C handler that requests an interrupt.
///
/// Safe to call more than once; only the first call installs the handler.
pub fn install_interrupt_handler() -> Result<()> {
    let mut outcome = Ok(());
    HANDLER_INSTALLED.call_once(|| {
        outcome = ctrlc::set_handler(request_interrupt).map_err(|e| CommError::Config {
            message: format!("Failed to install interrupt handler: {}", e),
        });
    });
    outcome
}

/// Mark the process as interrupted. Only performs an atomic store.
pub fn request_interrupt() {
    INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
}

/// Check whether an interrupt is pending without consuming it.
pub fn interrupt_pending() -> bool {
    INTERRUPT_REQUESTED.load(Ordering::SeqCst)
}

/// Tracks the running and cancelled command ids of one client.
///
/// Clones share state. Command id 0 means "none".
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    next_command: AtomicU64,
    running: AtomicU64,
    cancelled: AtomicU64,
    relay: AtomicU64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a command id and mark it running until the guard drops.
    pub fn begin_command(&self) -> CommandGuard {
        let id = self.inner.next_command.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.running.store(id, Ordering::SeqCst);
        CommandGuard {
            token: self.clone(),
            id,
        }
    }

    pub fn running_command(&self) -> u64 {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn cancelled_command(&self) -> u64 {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self, command_id: u64) -> bool {
        command_id != 0 && self.cancelled_command() == command_id
    }

    /// Consume a pending process interrupt, if any.
    ///
    /// Returns the command id that became the cancellation target. An
    /// interrupt that arrives while nothing is running is consumed and
    /// dropped.
    pub fn poll_interrupt(&self) -> Option<u64> {
        if !INTERRUPT_REQUESTED.swap(false, Ordering::SeqCst) {
            return None;
        }
        let running = self.running_command();
        if running == 0 {
            debug!("Interrupt received with no running command");
            return None;
        }
        self.cancel(running);
        Some(running)
    }

    /// Mark a command as the cancellation target and arm the relay.
    pub fn cancel(&self, command_id: u64) {
        self.inner.cancelled.store(command_id, Ordering::SeqCst);
        self.inner.relay.store(command_id, Ordering::SeqCst);
    }

    /// Take the armed relay, leaving it disarmed.
    pub fn take_relay(&self) -> Option<u64> {
        match self.inner.relay.swap(0, Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Re-arm a relay that could not be delivered. A newer relay wins.
    pub fn restore_relay(&self, command_id: u64) {
        let _ = self
            .inner
            .relay
            .compare_exchange(0, command_id, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Marks a command as running for its lifetime.
#[derive(Debug)]
pub struct CommandGuard {
    token: CancellationToken,
    id: u64,
}

impl CommandGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        let _ = self.token.inner.running.compare_exchange(
            self.id,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_has_nothing_running() {
        let token = CancellationToken::new();
        assert_eq!(token.running_command(), 0);
        assert_eq!(token.cancelled_command(), 0);
        assert!(token.take_relay().is_none());
    }

    #[test]
    fn test_guard_tracks_running_command() {
        let token = CancellationToken::new();
        let guard = token.begin_command();
        assert_eq!(token.running_command(), guard.id());
        drop(guard);
        assert_eq!(token.running_command(), 0);
    }

    #[test]
    fn test_command_ids_increase() {
        let token = CancellationToken::new();
        let first = token.begin_command().id();
        let second = token.begin_command().id();
        assert!(second > first);
    }

    #[test]
    fn test_cancel_arms_single_relay() {
        let token = CancellationToken::new();
        token.cancel(5);
        assert!(token.is_cancelled(5));
        assert_eq!(token.take_relay(), Some(5));
        assert_eq!(token.take_relay(), None);
        assert!(token.is_cancelled(5));
    }

    #[test]
    fn test_restore_relay_does_not_override_newer() {
        let token = CancellationToken::new();
        token.cancel(3);
        let taken = token.take_relay().unwrap();
        token.cancel(4);
        token.restore_relay(taken);
        assert_eq!(token.take_relay(), Some(4));
    }

    #[test]
    fn test_clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        let guard = token.begin_command();
        assert_eq!(clone.running_command(), guard.id());
    }

    #[test]
    fn test_poll_interrupt_snapshots_running_command() {
        // The interrupt cell is process-wide, so this is the only test that
        // raises it.
        let token = CancellationToken::new();
        let guard = token.begin_command();
        request_interrupt();
        assert!(interrupt_pending());
        assert_eq!(token.poll_interrupt(), Some(guard.id()));
        assert!(!interrupt_pending());
        assert_eq!(token.cancelled_command(), guard.id());
        assert_eq!(token.take_relay(), Some(guard.id()));
        assert_eq!(token.poll_interrupt(), None);
    }
}
