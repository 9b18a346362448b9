//! Server-side dispatcher: one bound socket, a pool of worker threads.
//!
//! The reactor thread owns the bound router socket. Received messages are
//! queued for the workers; a worker hands its reply to a private loopback
//! channel, and the reactor drains that channel back onto the router. Worker
//! threads never touch the shared socket.
//!
//! Incoming messages carry a routing envelope:
//!
//! ```text
//! [identity][key][request id][""][payload frames...]
//! ```
//!
//! `key` is the discovery key the client resolved, or the literal address it
//! dialed.
//!
//! Everything up to and including the first empty frame is the envelope. It
//! is copied unchanged in front of the reply so it routes back to the caller.

use crate::config::CommConfig;
use crate::discovery::Discovery;
use crate::error::{CommError, Result};
use crate::message::Multipart;
use crate::pollset::{Pollset, SourceId};
use crate::transport::{is_literal, lock, Context, Inbound, RouterSocket};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handles one request payload. `None` means no reply is sent.
pub type ReplyCallback = Arc<dyn Fn(&[Bytes]) -> Option<Multipart> + Send + Sync>;

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Multipart>,
    shutdown: bool,
}

#[derive(Default)]
struct KeyState {
    /// key -> bound address
    registered: HashMap<String, String>,
    reserved: HashSet<String>,
}

struct Shared {
    name: String,
    queue: Mutex<JobQueue>,
    work_ready: Condvar,
    keys: Mutex<KeyState>,
    loopback: mpsc::UnboundedSender<Multipart>,
    callback: ReplyCallback,
}

struct Registration {
    pollset: Arc<Pollset>,
    sources: Vec<SourceId>,
}

pub struct AsyncReplySocket {
    ctx: Arc<Context>,
    discovery: Option<Arc<dyn Discovery>>,
    shared: Arc<Shared>,
    router: Mutex<Option<RouterSocket>>,
    address: Mutex<Option<String>>,
    loopback_rx: Mutex<Option<Inbound>>,
    registration: Mutex<Option<Registration>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AsyncReplySocket {
    /// Create the dispatcher and start `nthreads` workers.
    pub fn new(
        ctx: Arc<Context>,
        discovery: Option<Arc<dyn Discovery>>,
        callback: ReplyCallback,
        nthreads: usize,
        name: impl Into<String>,
    ) -> Result<Self> {
        let (loopback, loopback_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.into(),
            queue: Mutex::new(JobQueue::default()),
            work_ready: Condvar::new(),
            keys: Mutex::new(KeyState::default()),
            loopback,
            callback,
        });

        let socket = Self {
            ctx,
            discovery,
            shared: shared.clone(),
            router: Mutex::new(None),
            address: Mutex::new(None),
            loopback_rx: Mutex::new(Some(loopback_rx)),
            registration: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let mut workers = Vec::with_capacity(nthreads.max(1));
        for index in 0..nthreads.max(1) {
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", shared.name, index))
                .spawn(move || worker_loop(worker_shared))
                .map_err(|e| CommError::Transport {
                    message: format!("Failed to spawn worker for {}", shared.name),
                    source: Some(e),
                })?;
            workers.push(handle);
        }
        *lock(&socket.workers) = workers;

        Ok(socket)
    }

    /// Bind the external socket. `None` scans local ports.
    ///
    /// Returns the bound address.
    pub fn bind(&self, address: Option<&str>) -> Result<String> {
        let mut router = lock(&self.router);
        if router.is_some() {
            return Err(CommError::Config {
                message: format!("Reply socket {} is already bound", self.shared.name),
            });
        }
        let socket = RouterSocket::bind(&self.ctx, address)?;
        let bound = socket.endpoint().to_string();
        *router = Some(socket);
        *lock(&self.address) = Some(bound.clone());
        info!("Reply socket {} listening on {}", self.shared.name, bound);
        Ok(bound)
    }

    pub fn address(&self) -> Option<String> {
        lock(&self.address).clone()
    }

    /// Register the bound socket and the loopback relay with `pollset`.
    ///
    /// Only one registration may be outstanding.
    pub fn add_to_pollset(&self, pollset: &Arc<Pollset>) -> Result<()> {
        let mut registration = lock(&self.registration);
        if registration.is_some() {
            return Err(CommError::Config {
                message: format!("Reply socket {} is already in a pollset", self.shared.name),
            });
        }

        let (inbound, sender) = {
            let mut router = lock(&self.router);
            let router = router.as_mut().ok_or_else(|| CommError::Config {
                message: format!("Reply socket {} is not bound", self.shared.name),
            })?;
            let inbound = router.take_inbound().ok_or_else(|| CommError::Config {
                message: format!("Reply socket {} receive queue already taken", self.shared.name),
            })?;
            (inbound, router.sender())
        };
        let loopback_rx = lock(&self.loopback_rx).take().ok_or_else(|| CommError::Config {
            message: format!("Reply socket {} loopback already taken", self.shared.name),
        })?;

        let receive_shared = self.shared.clone();
        let receive = pollset.add_source(
            format!("{}-recv", self.shared.name),
            inbound,
            Box::new(move |batch| enqueue(&receive_shared, batch)),
        )?;

        let name = self.shared.name.clone();
        let relay = pollset.add_source(
            format!("{}-relay", self.shared.name),
            loopback_rx,
            Box::new(move |batch| {
                for frames in batch {
                    if let Err(e) = sender.send(frames) {
                        warn!("{}: reply not delivered: {}", name, e);
                    }
                }
            }),
        )?;

        *registration = Some(Registration {
            pollset: pollset.clone(),
            sources: vec![receive, relay],
        });
        Ok(())
    }

    /// Publish `key -> bound address` and accept requests addressed to it.
    ///
    /// A key previously reserved by this socket is taken over. Returns false,
    /// with nothing changed, if discovery rejects it.
    pub fn register_key(&self, key: &str) -> bool {
        let Some(discovery) = self.discovery.as_ref() else {
            warn!("{}: no discovery service to register {}", self.shared.name, key);
            return false;
        };
        let Some(address) = self.address() else {
            warn!("{}: cannot register {} before binding", self.shared.name, key);
            return false;
        };

        let mut keys = lock(&self.shared.keys);
        if keys.registered.contains_key(key) {
            return true;
        }

        let reserved = keys.reserved.contains(key);
        if reserved && !discovery.erase(key) {
            warn!("{}: failed to release reservation of {}", self.shared.name, key);
            return false;
        }
        if !discovery.insert(key, &address) {
            if reserved && !discovery.insert(key, CommConfig::RESERVED_PLACEHOLDER) {
                warn!("{}: lost reservation of {}", self.shared.name, key);
                keys.reserved.remove(key);
            }
            warn!("{}: failed to register {}", self.shared.name, key);
            return false;
        }

        keys.reserved.remove(key);
        keys.registered.insert(key.to_string(), address.clone());
        info!("{}: registered {} -> {}", self.shared.name, key, address);
        true
    }

    /// Claim `key` with a placeholder before the address is known.
    pub fn reserve_key(&self, key: &str) -> bool {
        let Some(discovery) = self.discovery.as_ref() else {
            return false;
        };
        let mut keys = lock(&self.shared.keys);
        if keys.registered.contains_key(key) || keys.reserved.contains(key) {
            return true;
        }
        if !discovery.insert(key, CommConfig::RESERVED_PLACEHOLDER) {
            warn!("{}: failed to reserve {}", self.shared.name, key);
            return false;
        }
        keys.reserved.insert(key.to_string());
        debug!("{}: reserved {}", self.shared.name, key);
        true
    }

    /// Retract a registered or reserved key.
    pub fn unregister_key(&self, key: &str) -> bool {
        let Some(discovery) = self.discovery.as_ref() else {
            return false;
        };
        let mut keys = lock(&self.shared.keys);
        if !keys.registered.contains_key(key) && !keys.reserved.contains(key) {
            return false;
        }
        if !discovery.erase(key) {
            warn!("{}: failed to unregister {}", self.shared.name, key);
            return false;
        }
        keys.registered.remove(key);
        keys.reserved.remove(key);
        debug!("{}: unregistered {}", self.shared.name, key);
        true
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.shared.keys).registered.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the dispatcher down. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(registration) = lock(&self.registration).take() {
            for source in registration.sources {
                registration.pollset.remove_source(source);
            }
        }

        let keys: Vec<String> = {
            let keys = lock(&self.shared.keys);
            keys.registered.keys().chain(keys.reserved.iter()).cloned().collect()
        };
        for key in keys {
            if !self.unregister_key(&key) {
                debug!("{}: ignoring failed unregister of {}", self.shared.name, key);
            }
        }

        {
            let mut queue = lock(&self.shared.queue);
            queue.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                error!("{}: worker thread panicked", self.shared.name);
            }
        }

        if let Some(router) = lock(&self.router).take() {
            router.close();
        }
        let _ = lock(&self.loopback_rx).take();
        debug!("Reply socket {} closed", self.shared.name);
    }
}

impl Drop for AsyncReplySocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn enqueue(shared: &Shared, batch: Vec<Multipart>) {
    let mut queue = lock(&shared.queue);
    if queue.shutdown {
        return;
    }
    queue.jobs.extend(batch);
    shared.work_ready.notify_all();
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                queue = shared
                    .work_ready
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };
        handle_job(&shared, job);
    }
}

/// Split `frames` into envelope and payload at the first empty frame.
pub(crate) fn split_envelope(frames: &[Bytes]) -> Option<(&[Bytes], &[Bytes])> {
    let delimiter = frames.iter().position(|f| f.is_empty())?;
    if delimiter == 0 {
        return None;
    }
    Some((&frames[..=delimiter], &frames[delimiter + 1..]))
}

/// Clients that dialed a literal address send that address as the key.
fn key_accepted(shared: &Shared, envelope: &[Bytes]) -> bool {
    // envelope[0] is the transport identity; the frame after it is the key.
    let key = match envelope.get(1) {
        Some(frame) if envelope.len() > 2 => frame,
        _ => return true,
    };
    let Ok(key) = std::str::from_utf8(key) else {
        return false;
    };
    if is_literal(key) {
        return true;
    }
    let keys = lock(&shared.keys);
    keys.registered.is_empty() || keys.registered.contains_key(key)
}

fn handle_job(shared: &Shared, frames: Multipart) {
    let Some((envelope, payload)) = split_envelope(&frames) else {
        warn!("{}: dropping message without routing envelope", shared.name);
        return;
    };
    if !key_accepted(shared, envelope) {
        warn!(
            "{}: dropping message for unregistered key {}",
            shared.name,
            String::from_utf8_lossy(&envelope[1])
        );
        return;
    }

    let reply = match catch_unwind(AssertUnwindSafe(|| (shared.callback)(payload))) {
        Ok(reply) => reply,
        Err(_) => {
            error!("{}: request handler panicked", shared.name);
            return;
        }
    };

    if let Some(reply) = reply {
        let mut out = Vec::with_capacity(envelope.len() + reply.len());
        out.extend_from_slice(envelope);
        out.extend(reply);
        if shared.loopback.send(out).is_err() {
            debug!("{}: relay closed, reply dropped", shared.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;
    use crate::transport::DealerSocket;
    use std::time::{Duration, Instant};

    fn echo() -> ReplyCallback {
        Arc::new(|payload: &[Bytes]| Some(payload.to_vec()))
    }

    fn recv(inbound: &mut Inbound, timeout: Duration) -> Option<Multipart> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(frames) = inbound.try_recv() {
                return Some(frames);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn request(key: &str, id: u64, payload: &'static [u8]) -> Multipart {
        vec![
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(&id.to_be_bytes()),
            Bytes::new(),
            Bytes::from_static(payload),
        ]
    }

    #[test]
    fn test_split_envelope() {
        let frames = vec![
            Bytes::from_static(b"id"),
            Bytes::new(),
            Bytes::from_static(b"body"),
        ];
        let (envelope, payload) = split_envelope(&frames).unwrap();
        assert_eq!(envelope.len(), 2);
        assert_eq!(payload, &[Bytes::from_static(b"body")][..]);

        assert!(split_envelope(&[Bytes::from_static(b"no delimiter")]).is_none());
        assert!(split_envelope(&[Bytes::new(), Bytes::from_static(b"x")]).is_none());
    }

    #[test]
    fn test_echo_through_workers() {
        let ctx = Arc::new(Context::new().unwrap());
        let pollset = Arc::new(Pollset::new("reply-test"));
        let socket = AsyncReplySocket::new(ctx.clone(), None, echo(), 2, "echo").unwrap();
        let address = socket.bind(Some("tcp://127.0.0.1:0")).unwrap();
        socket.add_to_pollset(&pollset).unwrap();
        pollset.start().unwrap();

        let mut dealer = DealerSocket::connect(&ctx, &address).unwrap();
        let mut inbound = dealer.take_inbound().unwrap();
        dealer.send(request(&address, 7, b"hello")).unwrap();

        let reply = recv(&mut inbound, Duration::from_secs(5)).unwrap();
        assert_eq!(reply, request(&address, 7, b"hello"));

        socket.close();
        pollset.stop();
    }

    /// Echo, except that a `boom` payload panics inside the handler.
    fn echo_or_panic() -> ReplyCallback {
        Arc::new(|payload: &[Bytes]| {
            if payload.first().is_some_and(|f| f.as_ref() == b"boom") {
                panic!("handler failure");
            }
            Some(payload.to_vec())
        })
    }

    fn serving_socket(
        callback: ReplyCallback,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> (Arc<Context>, Arc<Pollset>, AsyncReplySocket, String) {
        let ctx = Arc::new(Context::new().unwrap());
        let pollset = Arc::new(Pollset::new("reply-test"));
        // One worker, so every message below is handled by the same thread.
        let socket = AsyncReplySocket::new(ctx.clone(), discovery, callback, 1, "serve").unwrap();
        let address = socket.bind(Some("tcp://127.0.0.1:0")).unwrap();
        socket.add_to_pollset(&pollset).unwrap();
        pollset.start().unwrap();
        (ctx, pollset, socket, address)
    }

    #[test]
    fn test_message_without_envelope_is_dropped() {
        let (ctx, pollset, socket, address) = serving_socket(echo(), None);
        let mut dealer = DealerSocket::connect(&ctx, &address).unwrap();
        let mut inbound = dealer.take_inbound().unwrap();

        dealer.send(vec![Bytes::from_static(b"no delimiter anywhere")]).unwrap();
        dealer.send(request(&address, 2, b"after")).unwrap();

        assert_eq!(
            recv(&mut inbound, Duration::from_secs(5)).unwrap(),
            request(&address, 2, b"after")
        );
        assert!(recv(&mut inbound, Duration::from_millis(200)).is_none());

        socket.close();
        pollset.stop();
    }

    #[test]
    fn test_unregistered_key_is_dropped() {
        let discovery = Arc::new(MemoryDiscovery::new());
        let (ctx, pollset, socket, address) =
            serving_socket(echo(), Some(discovery.clone() as Arc<dyn Discovery>));
        assert!(socket.register_key("engine"));

        let mut dealer = DealerSocket::connect(&ctx, &address).unwrap();
        let mut inbound = dealer.take_inbound().unwrap();
        dealer.send(request("stranger", 1, b"ignored")).unwrap();
        dealer.send(request("engine", 2, b"served")).unwrap();

        assert_eq!(
            recv(&mut inbound, Duration::from_secs(5)).unwrap(),
            request("engine", 2, b"served")
        );
        assert!(recv(&mut inbound, Duration::from_millis(200)).is_none());

        socket.close();
        pollset.stop();
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let (ctx, pollset, socket, address) = serving_socket(echo_or_panic(), None);
        let mut dealer = DealerSocket::connect(&ctx, &address).unwrap();
        let mut inbound = dealer.take_inbound().unwrap();

        dealer.send(request(&address, 1, b"boom")).unwrap();
        dealer.send(request(&address, 2, b"still here")).unwrap();

        assert_eq!(
            recv(&mut inbound, Duration::from_secs(5)).unwrap(),
            request(&address, 2, b"still here")
        );
        assert!(recv(&mut inbound, Duration::from_millis(200)).is_none());

        socket.close();
        pollset.stop();
    }

    #[test]
    fn test_second_pollset_registration_fails() {
        let ctx = Arc::new(Context::new().unwrap());
        let pollset = Arc::new(Pollset::new("double"));
        let socket = AsyncReplySocket::new(ctx, None, echo(), 1, "double").unwrap();
        socket.bind(Some("tcp://127.0.0.1:0")).unwrap();
        socket.add_to_pollset(&pollset).unwrap();
        assert!(socket.add_to_pollset(&pollset).is_err());
    }

    #[test]
    fn test_register_key_requires_available_discovery() {
        let ctx = Arc::new(Context::new().unwrap());
        let discovery = Arc::new(MemoryDiscovery::new());
        let socket =
            AsyncReplySocket::new(ctx, Some(discovery.clone()), echo(), 1, "keys").unwrap();
        let address = socket.bind(Some("tcp://127.0.0.1:0")).unwrap();

        discovery.set_available(false);
        assert!(!socket.register_key("engine"));
        assert!(socket.registered_keys().is_empty());

        discovery.set_available(true);
        assert!(socket.register_key("engine"));
        assert_eq!(discovery.get("engine"), Some(address));

        socket.close();
        assert!(discovery.get("engine").is_none());
    }

    #[test]
    fn test_reserved_key_is_taken_over_on_register() {
        let ctx = Arc::new(Context::new().unwrap());
        let discovery = Arc::new(MemoryDiscovery::new());
        let socket =
            AsyncReplySocket::new(ctx, Some(discovery.clone()), echo(), 1, "reserve").unwrap();

        assert!(socket.reserve_key("engine"));
        assert_eq!(discovery.get("engine").as_deref(), Some(CommConfig::RESERVED_PLACEHOLDER));

        let address = socket.bind(Some("tcp://127.0.0.1:0")).unwrap();
        assert!(socket.register_key("engine"));
        assert_eq!(discovery.get("engine"), Some(address));
    }

    #[test]
    fn test_register_key_taken_by_another_server_changes_nothing() {
        let ctx = Arc::new(Context::new().unwrap());
        let discovery = Arc::new(MemoryDiscovery::new());
        discovery.insert("engine", "tcp://10.0.0.1:1");
        let socket =
            AsyncReplySocket::new(ctx, Some(discovery.clone()), echo(), 1, "taken").unwrap();
        socket.bind(Some("tcp://127.0.0.1:0")).unwrap();

        assert!(!socket.register_key("engine"));
        assert!(socket.registered_keys().is_empty());
        assert_eq!(discovery.get("engine").as_deref(), Some("tcp://10.0.0.1:1"));
        assert!(!socket.unregister_key("engine"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let ctx = Arc::new(Context::new().unwrap());
        let socket = AsyncReplySocket::new(ctx, None, echo(), 3, "close").unwrap();
        socket.bind(None).unwrap();
        socket.close();
        socket.close();
        assert!(socket.is_closed());
    }
}
