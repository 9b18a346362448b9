//! Single-assignment reply slot shared by a channel and its caller.

use crate::message::ReplyMessage;
use crate::status::ReplyStatus;
use crate::transport::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Slot {
    reply: Mutex<Option<ReplyMessage>>,
    /// Set when the reply was made up on this side rather than received.
    local: AtomicBool,
    ready: Condvar,
}

/// The eventual reply to one issued call.
///
/// The first `fulfil` wins; later ones are ignored. Reads are repeatable and
/// always yield the same reply once one is present.
#[derive(Debug, Clone, Default)]
pub struct CallFuture {
    slot: Arc<Slot>,
}

impl CallFuture {
    /// An unresolved future.
    pub fn new() -> Self {
        Self::default()
    }

    /// A future that is already resolved.
    pub fn ready(reply: ReplyMessage) -> Self {
        let future = Self::new();
        future.fulfil(reply);
        future
    }

    /// A future already failed with `status` on this side, without any
    /// exchange with the peer.
    pub fn failed(status: ReplyStatus) -> Self {
        let future = Self::new();
        future.fail_locally(status);
        future
    }

    /// Resolve the future with a reply from the peer. Returns false if it
    /// was already resolved.
    pub fn fulfil(&self, reply: ReplyMessage) -> bool {
        self.resolve(reply, false)
    }

    /// Resolve the future with a failure raised on this side. Returns false
    /// if it was already resolved.
    pub fn fail_locally(&self, status: ReplyStatus) -> bool {
        self.resolve(ReplyMessage::failure(status), true)
    }

    fn resolve(&self, reply: ReplyMessage, local: bool) -> bool {
        let mut slot = lock(&self.slot.reply);
        if slot.is_some() {
            return false;
        }
        self.slot.local.store(local, Ordering::SeqCst);
        *slot = Some(reply);
        self.slot.ready.notify_all();
        true
    }

    /// True when the reply was synthesized locally (the call never reached
    /// the peer or was abandoned), false for a received reply or no reply.
    pub fn is_local(&self) -> bool {
        let slot = lock(&self.slot.reply);
        slot.is_some() && self.slot.local.load(Ordering::SeqCst)
    }

    /// True while some clone other than this one is alive.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.slot) > 1
    }

    pub fn has_value(&self) -> bool {
        lock(&self.slot.reply).is_some()
    }

    /// Block until resolved or `timeout` elapses. Returns `has_value()`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot.reply);
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = match self.slot.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// The reply, if resolved.
    pub fn get(&self) -> Option<ReplyMessage> {
        lock(&self.slot.reply).clone()
    }
}
