//! Heartbeat thread: liveness pings, cancellation relay, periodic object sync.

use super::{ClientInner, SyncOutcome};
use crate::error::{CommError, Result};
use crate::message::{CallMessage, ROOT_OBJECT_ID};
use crate::protocol::{self, PingRequest};
use crate::transport::lock;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Slice in which a pending ping re-checks for shutdown.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Flags {
    wake: bool,
    stop: bool,
}

#[derive(Default)]
pub(super) struct HeartbeatSignal {
    flags: Mutex<Flags>,
    cv: Condvar,
}

impl HeartbeatSignal {
    /// Run the next tick now instead of at the end of the interval.
    pub(super) fn wake(&self) {
        lock(&self.flags).wake = true;
        self.cv.notify_all();
    }

    fn request_stop(&self) {
        lock(&self.flags).stop = true;
        self.cv.notify_all();
    }

    fn is_stopped(&self) -> bool {
        lock(&self.flags).stop
    }

    /// Sleep until woken, stopped, or `interval` passes. Returns false once
    /// stop has been requested.
    fn wait(&self, interval: Duration) -> bool {
        let flags = lock(&self.flags);
        let (mut flags, _) = self
            .cv
            .wait_timeout_while(flags, interval, |f| !f.wake && !f.stop)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        flags.wake = false;
        !flags.stop
    }
}

pub(super) struct Heartbeat {
    signal: Arc<HeartbeatSignal>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(super) fn spawn(client: Arc<ClientInner>, signal: Arc<HeartbeatSignal>) -> Result<Self> {
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat_loop(client, thread_signal))
            .map_err(|e| CommError::Transport {
                message: "Failed to spawn heartbeat thread".to_string(),
                source: Some(e),
            })?;
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub(super) fn stop(mut self) {
        self.signal.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Heartbeat thread panicked");
            }
        }
    }
}

fn heartbeat_loop(client: Arc<ClientInner>, signal: Arc<HeartbeatSignal>) {
    let config = client.config.clone();
    let mut failures: usize = 0;

    while signal.wait(config.heartbeat_interval) {
        // Nothing to learn from pinging a server already declared dead.
        if !client.server_alive() {
            continue;
        }
        if config.ops_interruptible {
            if let Some(command) = client.cancel.poll_interrupt() {
                info!("Interrupt received, cancelling command {}", command);
            }
        }
        let cancel_command = client.cancel.take_relay();

        let ping = PingRequest {
            value: "heartbeat".to_string(),
            cancel_command,
        };
        let mut call = match CallMessage::json(ROOT_OBJECT_ID, protocol::PING, &ping) {
            Ok(call) => call,
            Err(e) => {
                error!("Failed to encode heartbeat ping: {}", e);
                break;
            }
        };

        let future = client.internal_call_future(&mut call, true);
        let deadline = Instant::now() + config.ping_timeout;
        let mut answered = false;
        while !signal.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if future.wait_for(STOP_CHECK_INTERVAL.min(deadline - now)) {
                // A reply made up on this side means the ping never reached
                // the server. Any status the server sent counts as alive.
                answered = !future.is_local()
                    && future
                        .get()
                        .is_some_and(|reply| !reply.status.is_local_failure());
                break;
            }
        }
        if signal.is_stopped() {
            if let Some(command) = cancel_command {
                client.cancel.restore_relay(command);
            }
            break;
        }

        if answered {
            if failures > 0 {
                debug!("Ping answered after {} failures", failures);
            }
            failures = 0;
            if let Some(command) = cancel_command {
                debug!("Relayed cancellation of command {}", command);
            }
            if client.try_send_tracked_objects(false) == SyncOutcome::Failed {
                debug!("Periodic object sync failed, retrying next tick");
            }
            continue;
        }

        if let Some(command) = cancel_command {
            client.cancel.restore_relay(command);
        }
        failures += 1;
        warn!(
            "Ping timed out ({} of {} tolerated)",
            failures, config.num_tolerable_ping_failures
        );
        if failures >= config.num_tolerable_ping_failures && client.server_alive() {
            client.mark_server_dead();
        }
    }

    debug!("Heartbeat thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_cuts_wait_short() {
        let signal = Arc::new(HeartbeatSignal::default());
        let waker = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_ends_wait() {
        let signal = HeartbeatSignal::default();
        signal.request_stop();
        assert!(!signal.wait(Duration::from_secs(10)));
        assert!(signal.is_stopped());
    }
}
