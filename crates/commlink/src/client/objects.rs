//! Reference counts of remote objects held by this client.

use super::ClientInner;
use crate::error::Result;
use crate::message::ReplyMessage;
use crate::transport::lock;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Local reference counts keyed by object id.
///
/// An id is present only while its count is non-zero.
#[derive(Debug, Default)]
pub struct ObjectTracker {
    counts: Mutex<HashMap<u64, usize>>,
}

impl ObjectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference, tracking the id if it is new. Returns the new count.
    pub fn incr(&self, object_id: u64) -> usize {
        let mut counts = lock(&self.counts);
        let count = counts.entry(object_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a reference. Returns the remaining count, or `None` if the id
    /// was not tracked. Reaching zero removes the id.
    pub fn decr(&self, object_id: u64) -> Option<usize> {
        let mut counts = lock(&self.counts);
        let count = counts.get_mut(&object_id)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            counts.remove(&object_id);
        }
        Some(remaining)
    }

    /// True while at least one reference is held.
    pub fn contains(&self, object_id: u64) -> bool {
        lock(&self.counts).contains_key(&object_id)
    }

    /// Current count, zero for untracked ids.
    pub fn count(&self, object_id: u64) -> usize {
        lock(&self.counts).get(&object_id).copied().unwrap_or(0)
    }

    /// Every tracked id, ascending.
    pub fn tracked_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.counts).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of distinct tracked ids.
    pub fn len(&self) -> usize {
        lock(&self.counts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A counted handle to one remote object.
///
/// Cloning adds a reference; dropping releases one. The server is told to
/// release the object when the last handle goes away.
pub struct ObjectProxy {
    client: Arc<ClientInner>,
    object_id: u64,
}

impl ObjectProxy {
    /// Wrap a reference the caller already holds.
    pub(super) fn adopt(client: Arc<ClientInner>, object_id: u64) -> Self {
        Self { client, object_id }
    }

    /// Server-assigned object id.
    pub fn id(&self) -> u64 {
        self.object_id
    }

    /// Call `method` on this object. Non-OK replies become errors.
    pub fn call(&self, method: &str, body: impl Into<Bytes>) -> Result<ReplyMessage> {
        self.client.call(self.object_id, method, body.into())
    }

    /// Like [`Self::call`] with JSON-encoded params and reply.
    pub fn call_json<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        self.client.call_json(self.object_id, method, params)
    }
}

impl Clone for ObjectProxy {
    fn clone(&self) -> Self {
        self.client.incr_ref_count(self.object_id);
        Self {
            client: self.client.clone(),
            object_id: self.object_id,
        }
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        if let Err(e) = self.client.decr_ref_count(self.object_id) {
            debug!("Releasing proxy for object {}: {}", self.object_id, e);
        }
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("object_id", &self.object_id)
            .finish()
    }
}
