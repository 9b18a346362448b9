//! Authentication hooks on calls and replies.
//!
//! Authenticators are layered: outbound messages are transformed by each one
//! in registration order and inbound messages are validated in reverse order,
//! so every layer peels off exactly what it added.

use crate::message::{CallMessage, ReplyMessage};
use std::sync::{Arc, RwLock};

pub trait Authenticator: Send + Sync {
    /// Client side: decorate an outgoing call.
    fn apply_auth_call(&self, call: &mut CallMessage) -> bool {
        let _ = call;
        true
    }

    /// Client side: check and strip a returned reply.
    fn validate_auth_reply(&self, reply: &mut ReplyMessage) -> bool {
        let _ = reply;
        true
    }

    /// Server side: check and strip an incoming call.
    fn validate_auth_call(&self, call: &mut CallMessage) -> bool {
        let _ = call;
        true
    }

    /// Server side: decorate an outgoing reply.
    fn apply_auth_reply(&self, reply: &mut ReplyMessage) -> bool {
        let _ = reply;
        true
    }
}

/// Ordered set of authenticators.
#[derive(Clone, Default)]
pub struct AuthChain {
    methods: Arc<RwLock<Vec<Arc<dyn Authenticator>>>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, method: Arc<dyn Authenticator>) {
        self.write().push(method);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply_call(&self, call: &mut CallMessage) -> bool {
        self.snapshot().iter().all(|m| m.apply_auth_call(call))
    }

    pub fn validate_reply(&self, reply: &mut ReplyMessage) -> bool {
        self.snapshot().iter().rev().all(|m| m.validate_auth_reply(reply))
    }

    pub fn validate_call(&self, call: &mut CallMessage) -> bool {
        self.snapshot().iter().rev().all(|m| m.validate_auth_call(call))
    }

    pub fn apply_reply(&self, reply: &mut ReplyMessage) -> bool {
        self.snapshot().iter().all(|m| m.apply_auth_reply(reply))
    }

    // Methods run without the lock held.
    fn snapshot(&self) -> Vec<Arc<dyn Authenticator>> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Authenticator>>> {
        self.methods.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Authenticator>>> {
        self.methods.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Shared-secret authenticator.
///
/// Pushes its token onto the message's auth list and, on the receiving side,
/// pops the last token and compares it.
#[derive(Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn pop_matches(&self, auth: &mut Vec<String>) -> bool {
        auth.pop().is_some_and(|token| token == self.token)
    }
}

impl Authenticator for TokenAuthenticator {
    fn apply_auth_call(&self, call: &mut CallMessage) -> bool {
        call.auth.push(self.token.clone());
        true
    }

    fn validate_auth_reply(&self, reply: &mut ReplyMessage) -> bool {
        self.pop_matches(&mut reply.auth)
    }

    fn validate_auth_call(&self, call: &mut CallMessage) -> bool {
        self.pop_matches(&mut call.auth)
    }

    fn apply_auth_reply(&self, reply: &mut ReplyMessage) -> bool {
        reply.auth.push(self.token.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_layers_peel_symmetrically() {
        let chain = AuthChain::new();
        chain.add(Arc::new(TokenAuthenticator::new("outer")));
        chain.add(Arc::new(TokenAuthenticator::new("inner")));

        let mut call = CallMessage::new(0, "ping", Bytes::new());
        assert!(chain.apply_call(&mut call));
        assert_eq!(call.auth, vec!["outer".to_string(), "inner".to_string()]);
        assert!(chain.validate_call(&mut call));
        assert!(call.auth.is_empty());
    }

    #[test]
    fn test_wrong_token_fails_validation() {
        let client = AuthChain::new();
        client.add(Arc::new(TokenAuthenticator::new("secret")));

        let mut reply = ReplyMessage::ok(Bytes::new());
        reply.auth.push("forged".to_string());
        assert!(!client.validate_reply(&mut reply));

        let mut bare = ReplyMessage::ok(Bytes::new());
        assert!(!client.validate_reply(&mut bare));
    }

    #[test]
    fn test_empty_chain_accepts() {
        let chain = AuthChain::new();
        let mut reply = ReplyMessage::ok(Bytes::new());
        assert!(chain.is_empty());
        assert!(chain.validate_reply(&mut reply));
    }
}
