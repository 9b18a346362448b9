//! Remote objects hosted by a server.

use crate::error::{CommError, Result};
use crate::status::ReplyStatus;
use crate::transport::PublisherSocket;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An object clients can call methods on.
pub trait RemoteObject: Send + Sync {
    /// Handle `method`. Errors become the reply status via
    /// [`CommError::status`].
    fn call(&self, ctx: &CallContext, method: &str, body: &Bytes) -> Result<Bytes>;

    /// Runs when a client deletes the object explicitly.
    fn destroy(&self) {}
}

/// Builds a new object for `make_object`.
pub type ObjectFactory = Arc<dyn Fn() -> Arc<dyn RemoteObject> + Send + Sync>;

/// Error for a method the object does not implement.
pub fn unknown_method(method: &str) -> CommError {
    CommError::Status {
        status: ReplyStatus::NoFunction,
        message: format!("Unknown method {}", method),
    }
}

/// Per-call view of the server handed to object methods.
pub struct CallContext {
    object_id: u64,
    command_id: u64,
    cancelled: Arc<AtomicU64>,
    publisher: Option<Arc<PublisherSocket>>,
}

impl CallContext {
    pub(crate) fn new(
        object_id: u64,
        command_id: u64,
        cancelled: Arc<AtomicU64>,
        publisher: Option<Arc<PublisherSocket>>,
    ) -> Self {
        Self {
            object_id,
            command_id,
            cancelled,
            publisher,
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn command_id(&self) -> u64 {
        self.command_id
    }

    /// True once the client has asked for this command to stop. Long
    /// running methods should poll it and bail out.
    pub fn must_cancel(&self) -> bool {
        self.command_id != 0 && self.cancelled.load(Ordering::SeqCst) == self.command_id
    }

    /// Publish a status message to subscribed clients.
    pub fn report_status(&self, message: &str) {
        match &self.publisher {
            Some(publisher) => {
                publisher.publish(vec![Bytes::copy_from_slice(message.as_bytes())]);
            }
            None => debug!("No status publisher, dropping {:?}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_cancel_matches_command() {
        let cancelled = Arc::new(AtomicU64::new(0));
        let ctx = CallContext::new(1, 7, cancelled.clone(), None);
        assert!(!ctx.must_cancel());
        cancelled.store(6, Ordering::SeqCst);
        assert!(!ctx.must_cancel());
        cancelled.store(7, Ordering::SeqCst);
        assert!(ctx.must_cancel());
    }

    #[test]
    fn test_untracked_command_never_cancels() {
        let cancelled = Arc::new(AtomicU64::new(0));
        let ctx = CallContext::new(1, 0, cancelled, None);
        assert!(!ctx.must_cancel());
        ctx.report_status("ignored");
    }

    #[test]
    fn test_unknown_method_status() {
        assert_eq!(unknown_method("frobnicate").status(), ReplyStatus::NoFunction);
    }
}
