//! Client-side request channel returning a future per request.
//!
//! Requests are framed as `[key][request id][""][call frames]`. The server
//! echoes the envelope in front of its reply, and the reactor callback uses
//! the request id to resolve the matching future.

use crate::config::CommConfig;
use crate::discovery::Discovery;
use crate::error::{CommError, Result};
use crate::future::CallFuture;
use crate::message::{CallMessage, Multipart, ReplyMessage};
use crate::pollset::{Pollset, SourceId};
use crate::status::ReplyStatus;
use crate::transport::{is_literal, lock, Context, DealerSocket, Inbound};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<u64, CallFuture>>>;

/// Resolve `target` to a transport address.
///
/// Literal addresses pass through. A key must be published with a real
/// address; a reservation placeholder counts as unresolved.
pub fn resolve(discovery: Option<&dyn Discovery>, target: &str) -> Result<String> {
    if is_literal(target) {
        return Ok(target.to_string());
    }
    let discovery = discovery.ok_or_else(|| CommError::Discovery {
        key: target.to_string(),
        message: "no discovery service configured".to_string(),
    })?;
    match discovery.get(target) {
        Some(address) if address == CommConfig::RESERVED_PLACEHOLDER => Err(CommError::Discovery {
            key: target.to_string(),
            message: "key is reserved but not yet bound".to_string(),
        }),
        Some(address) => Ok(address),
        None => Err(CommError::Discovery {
            key: target.to_string(),
            message: "key is not published".to_string(),
        }),
    }
}

pub struct AsyncRequestSocket {
    key: Bytes,
    dealer: DealerSocket,
    inbound: Mutex<Option<Inbound>>,
    pending: PendingMap,
    next_request: AtomicU64,
    registration: Mutex<Option<(Arc<Pollset>, SourceId)>>,
    closed: AtomicBool,
}

impl AsyncRequestSocket {
    /// Open a channel to a literal address or a discovery key.
    pub fn open(ctx: &Context, discovery: Option<&dyn Discovery>, target: &str) -> Result<Self> {
        let address = resolve(discovery, target)?;
        Self::connect(ctx, target, &address)
    }

    /// Open a channel to `address`, announcing `key` in every envelope.
    pub fn connect(ctx: &Context, key: &str, address: &str) -> Result<Self> {
        let mut dealer = DealerSocket::connect(ctx, address)?;
        let inbound = dealer.take_inbound();
        debug!("Request channel {} -> {}", key, address);
        Ok(Self {
            key: Bytes::copy_from_slice(key.as_bytes()),
            dealer,
            inbound: Mutex::new(inbound),
            pending: PendingMap::default(),
            next_request: AtomicU64::new(1),
            registration: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The concrete address this channel connects to.
    pub fn endpoint(&self) -> String {
        self.dealer.endpoint().to_string()
    }

    pub fn add_to_pollset(&self, pollset: &Arc<Pollset>) -> Result<()> {
        let mut registration = lock(&self.registration);
        if registration.is_some() {
            return Err(CommError::Config {
                message: format!("Request channel to {} is already in a pollset", self.endpoint()),
            });
        }
        let inbound = lock(&self.inbound).take().ok_or_else(|| CommError::Config {
            message: format!("Request channel to {} has no receive queue", self.endpoint()),
        })?;

        let pending = self.pending.clone();
        let source = pollset.add_source(
            format!("request-{}", self.endpoint()),
            inbound,
            Box::new(move |batch| {
                for frames in batch {
                    resolve_reply(&pending, frames);
                }
            }),
        )?;
        *registration = Some((pollset.clone(), source));
        Ok(())
    }

    /// Issue `call`. Failures to issue resolve the future immediately.
    pub fn request(&self, call: &CallMessage) -> CallFuture {
        if self.is_closed() {
            return CallFuture::failed(ReplyStatus::HostUnreachable);
        }
        let frames = match call.to_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Failed to encode call {}: {}", call.method, e);
                return CallFuture::failed(ReplyStatus::BadMessage);
            }
        };

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let future = CallFuture::new();
        {
            let mut pending = lock(&self.pending);
            drop_abandoned(&mut pending);
            pending.insert(request_id, future.clone());
        }

        let mut message = Vec::with_capacity(frames.len() + 3);
        message.push(self.key.clone());
        message.push(Bytes::copy_from_slice(&request_id.to_be_bytes()));
        message.push(Bytes::new());
        message.extend(frames);

        if let Err(e) = self.dealer.send(message) {
            debug!("Request {} not sent: {}", request_id, e);
            lock(&self.pending).remove(&request_id);
            return CallFuture::failed(ReplyStatus::HostUnreachable);
        }
        future
    }

    /// Requests still awaiting a reply that some caller is waiting on.
    ///
    /// A request whose future every caller has dropped is abandoned and no
    /// longer counted; its late reply is discarded.
    pub fn pending_count(&self) -> usize {
        let mut pending = lock(&self.pending);
        drop_abandoned(&mut pending);
        pending.len()
    }

    /// Resolve every outstanding future with a local `status` failure.
    pub fn fail_pending(&self, status: ReplyStatus) -> usize {
        let pending: Vec<CallFuture> = lock(&self.pending).drain().map(|(_, f)| f).collect();
        for future in &pending {
            future.fail_locally(status);
        }
        pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel and fail outstanding requests. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((pollset, source)) = lock(&self.registration).take() {
            pollset.remove_source(source);
        }
        self.dealer.close();
        let failed = self.fail_pending(ReplyStatus::HostUnreachable);
        if failed > 0 {
            debug!("Failed {} pending requests to {}", failed, self.endpoint());
        }
    }
}

impl Drop for AsyncRequestSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forget requests nobody waits for any more. The map's own clone is the
/// only remaining holder of such a future.
fn drop_abandoned(pending: &mut HashMap<u64, CallFuture>) {
    let before = pending.len();
    pending.retain(|_, future| future.is_shared());
    let dropped = before - pending.len();
    if dropped > 0 {
        debug!("Dropped {} abandoned requests", dropped);
    }
}

fn resolve_reply(pending: &PendingMap, frames: Multipart) {
    let request_id = match frames.as_slice() {
        [_key, id, delimiter, ..] if delimiter.is_empty() => {
            match <[u8; 8]>::try_from(&id[..]) {
                Ok(bytes) => u64::from_be_bytes(bytes),
                Err(_) => {
                    warn!("Dropping reply with malformed request id");
                    return;
                }
            }
        }
        _ => {
            warn!("Dropping reply without request envelope");
            return;
        }
    };

    let Some(future) = lock(pending).remove(&request_id) else {
        debug!("Reply for unknown request {} discarded", request_id);
        return;
    };

    let reply = ReplyMessage::from_frames(&frames[3..]).unwrap_or_else(|e| {
        warn!("Malformed reply to request {}: {}", request_id, e);
        ReplyMessage::failure(ReplyStatus::BadMessage)
    });
    future.fulfil(reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;
    use crate::reply_socket::AsyncReplySocket;
    use std::time::Duration;

    #[test]
    fn test_resolve_literal_and_key() {
        let discovery = MemoryDiscovery::new();
        discovery.insert("engine", "tcp://127.0.0.1:9000");
        assert_eq!(resolve(None, "tcp://h:1").unwrap(), "tcp://h:1");
        assert_eq!(resolve(Some(&discovery), "engine").unwrap(), "tcp://127.0.0.1:9000");
        assert!(matches!(
            resolve(Some(&discovery), "missing"),
            Err(CommError::Discovery { .. })
        ));
        assert!(resolve(None, "engine").is_err());
    }

    #[test]
    fn test_reserved_key_is_unresolved() {
        let discovery = MemoryDiscovery::new();
        discovery.insert("engine", CommConfig::RESERVED_PLACEHOLDER);
        assert!(matches!(
            resolve(Some(&discovery), "engine"),
            Err(CommError::Discovery { .. })
        ));
    }

    #[test]
    fn test_request_resolves_through_reply_socket() {
        let ctx = Arc::new(Context::new().unwrap());
        let pollset = Arc::new(Pollset::new("request-test"));
        let server = AsyncReplySocket::new(
            ctx.clone(),
            None,
            Arc::new(|payload: &[Bytes]| {
                let call = CallMessage::from_frames(payload).ok()?;
                ReplyMessage::ok(call.body).to_frames().ok()
            }),
            2,
            "reply",
        )
        .unwrap();
        let address = server.bind(Some("tcp://127.0.0.1:0")).unwrap();
        server.add_to_pollset(&pollset).unwrap();

        let channel = AsyncRequestSocket::open(&ctx, None, &address).unwrap();
        channel.add_to_pollset(&pollset).unwrap();
        pollset.start().unwrap();

        let future = channel.request(&CallMessage::new(1, "echo", Bytes::from_static(b"data")));
        assert!(future.wait_for(Duration::from_secs(5)));
        let reply = future.get().unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.body, Bytes::from_static(b"data"));
        assert_eq!(channel.pending_count(), 0);

        channel.close();
        server.close();
        pollset.stop();
    }

    #[test]
    fn test_timed_out_requests_do_not_accumulate() {
        let ctx = Context::new().unwrap();
        // Accepts connections but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("tcp://{}", silent.local_addr().unwrap());
        let channel = AsyncRequestSocket::connect(&ctx, &address, &address).unwrap();

        for _ in 0..50 {
            let future = channel.request(&CallMessage::new(0, "ping", Bytes::new()));
            assert!(!future.wait_for(Duration::from_millis(10)));
        }
        assert_eq!(channel.pending_count(), 0);

        let held = channel.request(&CallMessage::new(0, "ping", Bytes::new()));
        assert_eq!(channel.pending_count(), 1);
        channel.close();
        assert_eq!(held.get().unwrap().status, ReplyStatus::HostUnreachable);
        assert!(held.is_local());
    }

    #[test]
    fn test_close_fails_pending_and_later_requests() {
        let ctx = Context::new().unwrap();
        let channel = AsyncRequestSocket::connect(&ctx, "nobody", "tcp://127.0.0.1:1").unwrap();
        let pending = channel.request(&CallMessage::new(0, "ping", Bytes::new()));
        assert!(!pending.has_value());

        channel.close();
        assert_eq!(pending.get().unwrap().status, ReplyStatus::HostUnreachable);

        let late = channel.request(&CallMessage::new(0, "ping", Bytes::new()));
        assert_eq!(late.get().unwrap().status, ReplyStatus::HostUnreachable);
    }
}
