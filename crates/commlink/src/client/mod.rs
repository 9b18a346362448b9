//! Comm client: drives remote objects on one server.
//!
//! A client holds two request channels (object and control), a status
//! subscriber feeding the [`StatusFanout`], a heartbeat thread and the local
//! reference counts of every remote object it created.
//!
//! # Lifecycle
//!
//! `Unstarted -> Started -> Stopped`. A stopped client cannot be restarted;
//! a failed `start` leaves the client unstarted and may be retried.
//!
//! # Liveness
//!
//! The heartbeat pings the server over the control channel. Once
//! `num_tolerable_ping_failures` consecutive pings time out the server is
//! marked dead: every outstanding call fails with
//! [`ReplyStatus::HostUnreachable`] and every later call fails the same way
//! without touching the transport.

mod fanout;
mod heartbeat;
mod objects;

pub use fanout::{StatusCallback, StatusFanout};
pub use objects::{ObjectProxy, ObjectTracker};

use crate::auth::{AuthChain, Authenticator};
use crate::cancel::CancellationToken;
use crate::config::{ClientConfig, CommConfig};
use crate::discovery::Discovery;
use crate::error::{CommError, Result};
use crate::future::CallFuture;
use crate::message::{CallMessage, ReplyMessage, ROOT_OBJECT_ID};
use crate::pollset::Pollset;
use crate::protocol::{
    self, AddressResponse, DeleteObjectRequest, MakeObjectRequest, MakeObjectResponse,
    PingRequest, PingResponse, SyncObjectsRequest,
};
use crate::request_socket::{resolve, AsyncRequestSocket};
use crate::status::ReplyStatus;
use crate::transport::{is_literal, lock, rewrite_any_address, Context, SubscriberSocket};
use bytes::Bytes;
use heartbeat::{Heartbeat, HeartbeatSignal};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Started,
    Stopped,
}

/// Result of an opportunistic tracked-object sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NotDue,
    Sent,
    Failed,
}

struct Channels {
    object: Arc<AsyncRequestSocket>,
    control: Arc<AsyncRequestSocket>,
}

struct Session {
    pollset: Arc<Pollset>,
    subscriber: SubscriberSocket,
    heartbeat: Heartbeat,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    ctx: Arc<Context>,
    discovery: Mutex<Option<Arc<dyn Discovery>>>,
    /// Serializes `start` and `stop`.
    lifecycle: Mutex<()>,
    state: Mutex<ClientState>,
    channels: RwLock<Option<Channels>>,
    session: Mutex<Option<Session>>,
    server_alive: AtomicBool,
    auth: AuthChain,
    objects: ObjectTracker,
    fanout: StatusFanout,
    cancel: CancellationToken,
    heartbeat_signal: Arc<HeartbeatSignal>,
    last_sync: Mutex<Option<Instant>>,
    /// Held shared by `make_object` and exclusively by the tracked-object
    /// sync, so an active list never races a creation in flight.
    sync_gate: RwLock<()>,
}

/// Client for one comm server.
///
/// Dropping the client stops it.
pub struct CommClient {
    inner: Arc<ClientInner>,
}

impl CommClient {
    /// Create an unstarted client. Literal addresses connect directly;
    /// anything else is resolved through `discovery` at start.
    pub fn new(config: ClientConfig, discovery: Option<Arc<dyn Discovery>>) -> Result<Self> {
        if config.name.is_empty() {
            return Err(CommError::Config {
                message: "Client needs a server address or discovery key".to_string(),
            });
        }
        let ctx = Arc::new(Context::new()?);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                ctx,
                discovery: Mutex::new(discovery),
                lifecycle: Mutex::new(()),
                state: Mutex::new(ClientState::Unstarted),
                channels: RwLock::new(None),
                session: Mutex::new(None),
                server_alive: AtomicBool::new(false),
                auth: AuthChain::new(),
                objects: ObjectTracker::new(),
                fanout: StatusFanout::new(),
                cancel: CancellationToken::new(),
                heartbeat_signal: Arc::new(HeartbeatSignal::default()),
                last_sync: Mutex::new(None),
                sync_gate: RwLock::new(()),
            }),
        })
    }

    /// Connect to the server.
    ///
    /// On failure the client stays unstarted and the error's
    /// [`CommError::status`] is the underlying status.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Shut down. Idempotent. Must not be called from a status callback.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// True between a successful `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// False once the heartbeat has given up on the server.
    pub fn server_alive(&self) -> bool {
        self.inner.server_alive()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Issue `call` and block until it resolves. Never fails with an error;
    /// transport and auth failures come back as the reply status.
    pub fn internal_call(&self, call: &mut CallMessage, control: bool) -> ReplyMessage {
        self.inner.internal_call(call, control)
    }

    /// Non-blocking form of [`Self::internal_call`].
    pub fn internal_call_future(&self, call: &mut CallMessage, control: bool) -> CallFuture {
        self.inner.internal_call_future(call, control)
    }

    /// Call `method` on a remote object. Non-OK replies become errors.
    pub fn call(&self, object_id: u64, method: &str, body: impl Into<Bytes>) -> Result<ReplyMessage> {
        self.inner.call(object_id, method, body.into())
    }

    /// JSON-encode `params`, call `method` and decode the reply body.
    pub fn call_json<P: Serialize, R: DeserializeOwned>(
        &self,
        object_id: u64,
        method: &str,
        params: &P,
    ) -> Result<R> {
        self.inner.call_json(object_id, method, params)
    }

    /// Create a remote object and track one reference to it.
    pub fn make_object(&self, type_name: &str) -> Result<u64> {
        self.inner.make_object(type_name)
    }

    /// Create a remote object owned by the returned proxy.
    pub fn make_proxy(&self, type_name: &str) -> Result<ObjectProxy> {
        let object_id = self.inner.make_object(type_name)?;
        Ok(ObjectProxy::adopt(self.inner.clone(), object_id))
    }

    /// Take a new counted reference to an object id obtained elsewhere.
    pub fn proxy(&self, object_id: u64) -> ObjectProxy {
        self.inner.incr_ref_count(object_id);
        ObjectProxy::adopt(self.inner.clone(), object_id)
    }

    /// Round-trip `value` through the server's control socket.
    pub fn ping(&self, value: &str) -> Result<String> {
        self.inner.ping(value)
    }

    /// Run the object's destructor on the server and drop one reference.
    pub fn delete_object(&self, object_id: u64) -> Result<()> {
        self.inner.delete_object(object_id)
    }

    /// Take another reference to a tracked object. Returns the new count.
    pub fn incr_ref_count(&self, object_id: u64) -> usize {
        self.inner.incr_ref_count(object_id)
    }

    /// Drop a reference. Reaching zero tells the server to release the
    /// object. Returns the remaining count.
    pub fn decr_ref_count(&self, object_id: u64) -> Result<usize> {
        self.inner.decr_ref_count(object_id)
    }

    /// References held on `object_id`; zero when untracked.
    pub fn ref_count(&self, object_id: u64) -> usize {
        self.inner.objects.count(object_id)
    }

    /// Ids this client holds references to, ascending.
    pub fn tracked_objects(&self) -> Vec<u64> {
        self.inner.objects.tracked_ids()
    }

    /// Send the full tracked-object list if the sync interval has passed,
    /// or unconditionally with `force`.
    pub fn try_send_tracked_objects(&self, force: bool) -> SyncOutcome {
        self.inner.try_send_tracked_objects(force)
    }

    /// Register an authenticator. Every outgoing call passes through all of
    /// them in registration order.
    pub fn add_auth_method(&self, method: Arc<dyn Authenticator>) {
        self.inner.auth.add(method);
    }

    /// Subscribe to status messages starting with `prefix`. The callback
    /// runs on the subscriber thread and must not call `stop`.
    pub fn add_status_watch<F>(&self, prefix: &str, callback: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.fanout.add_status_watch(prefix, Arc::new(callback))
    }

    /// Returns false if `prefix` was not watched.
    pub fn remove_status_watch(&self, prefix: &str) -> bool {
        self.inner.fanout.remove_status_watch(prefix)
    }

    /// Drop every status watch and the subscription behind it.
    pub fn clear_status_watch(&self) {
        self.inner.fanout.clear_status_watch();
    }

    /// Running and cancelled command ids of this client.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Run the next heartbeat tick now.
    pub fn wake_heartbeat(&self) {
        self.inner.heartbeat_signal.wake();
    }
}

impl Drop for CommClient {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for CommClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommClient")
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.state())
            .field("server_alive", &self.inner.server_alive())
            .finish()
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn is_started(&self) -> bool {
        self.state() == ClientState::Started
    }

    fn server_alive(&self) -> bool {
        self.server_alive.load(Ordering::SeqCst)
    }

    fn require_started(&self) -> Result<()> {
        match self.state() {
            ClientState::Started => Ok(()),
            ClientState::Unstarted => Err(CommError::NotConnected),
            ClientState::Stopped => Err(CommError::Stopped),
        }
    }

    fn channels(&self) -> RwLockReadGuard<'_, Option<Channels>> {
        self.channels.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn channels_mut(&self) -> RwLockWriteGuard<'_, Option<Channels>> {
        self.channels.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        match self.state() {
            ClientState::Started => return Ok(()),
            ClientState::Stopped => return Err(CommError::Stopped),
            ClientState::Unstarted => {}
        }

        // Everything opened here closes on drop if a later step fails.
        let discovery = lock(&self.discovery).clone();
        let discovery = discovery.as_deref();
        let pollset = Arc::new(Pollset::new("client"));

        let object = Arc::new(AsyncRequestSocket::open(&self.ctx, discovery, &self.config.name)?);
        object.add_to_pollset(&pollset)?;
        pollset.start()?;

        let (control_key, control_address) = self.locate(
            discovery,
            &object,
            self.config.alternate_control_address.as_deref(),
            CommConfig::CONTROL_KEY_SUFFIX,
            protocol::GET_CONTROL_ADDRESS,
        )?;
        let control = Arc::new(AsyncRequestSocket::connect(
            &self.ctx,
            &control_key,
            &control_address,
        )?);
        control.add_to_pollset(&pollset)?;

        let (_, status_address) = self.locate(
            discovery,
            &object,
            self.config.alternate_publish_address.as_deref(),
            CommConfig::STATUS_KEY_SUFFIX,
            protocol::GET_STATUS_PUBLISH_ADDRESS,
        )?;
        let mut subscriber = SubscriberSocket::connect(&self.ctx, &status_address)?;
        let status_inbound = subscriber.take_inbound().ok_or_else(|| CommError::Config {
            message: "Status subscriber has no receive queue".to_string(),
        })?;
        let fanout = self.fanout.clone();
        pollset.add_source(
            "status",
            status_inbound,
            Box::new(move |batch| {
                for frames in batch {
                    fanout.subscribe_callback(frames);
                }
            }),
        )?;
        self.fanout.attach(Arc::new(subscriber.handle()))?;

        if let Err(e) = self.fanout.start() {
            self.fanout.detach();
            return Err(e);
        }
        let heartbeat = match Heartbeat::spawn(self.clone(), self.heartbeat_signal.clone()) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                self.fanout.stop();
                self.fanout.detach();
                return Err(e);
            }
        };

        *self.channels_mut() = Some(Channels { object, control });
        *lock(&self.session) = Some(Session {
            pollset,
            subscriber,
            heartbeat,
        });
        self.server_alive.store(true, Ordering::SeqCst);
        *lock(&self.state) = ClientState::Started;
        info!(
            "Connected to {} (control {}, status {})",
            self.config.name, control_address, status_address
        );

        // Release whatever a previous session of this client left behind.
        if self.try_send_tracked_objects(true) == SyncOutcome::Failed {
            warn!("Initial tracked-object sync with {} failed", self.config.name);
        }
        Ok(())
    }

    /// Find a companion endpoint: an explicit alternate address, the
    /// server's discovery key plus `suffix`, or the server's own answer to
    /// `bootstrap_method` over the object channel.
    ///
    /// Returns the key to announce on the channel and the concrete address.
    fn locate(
        &self,
        discovery: Option<&dyn Discovery>,
        object: &AsyncRequestSocket,
        alternate: Option<&str>,
        suffix: &str,
        bootstrap_method: &str,
    ) -> Result<(String, String)> {
        let (key, advertised) = if let Some(alternate) = alternate {
            (alternate.to_string(), resolve(discovery, alternate)?)
        } else if !is_literal(&self.config.name) {
            let key = format!("{}{}", self.config.name, suffix);
            let address = resolve(discovery, &key)?;
            (key, address)
        } else {
            let mut call = CallMessage::new(ROOT_OBJECT_ID, bootstrap_method, Bytes::new());
            let reply = self.call_on(object, &mut call, self.config.bootstrap_timeout)?;
            let response: AddressResponse = reply.parse()?;
            (response.address.clone(), response.address)
        };

        let address = rewrite_any_address(&advertised, &object.endpoint())?;
        let key = if is_literal(&key) { address.clone() } else { key };
        Ok((key, address))
    }

    fn stop(&self) {
        let _lifecycle = lock(&self.lifecycle);
        let previous = std::mem::replace(&mut *lock(&self.state), ClientState::Stopped);
        if previous == ClientState::Stopped {
            return;
        }
        self.server_alive.store(false, Ordering::SeqCst);

        let session = lock(&self.session).take();
        if let Some(session) = session {
            // Threads first: both issue calls on the sockets closed below.
            session.heartbeat.stop();
            self.fanout.stop();
            self.fanout.clear_status_watch();
            self.fanout.detach();
            session.pollset.stop();

            if let Some(channels) = self.channels_mut().take() {
                channels.object.close();
                channels.control.close();
            }
            session.subscriber.close();
        }

        lock(&self.discovery).take();
        self.ctx.terminate();
        info!("Client for {} stopped", self.config.name);
    }

    pub(crate) fn internal_call_future(&self, call: &mut CallMessage, control: bool) -> CallFuture {
        let channel = {
            let channels = self.channels();
            match channels.as_ref() {
                Some(channels) if control => channels.control.clone(),
                Some(channels) => channels.object.clone(),
                None => {
                    let status = match self.state() {
                        ClientState::Unstarted => ReplyStatus::NotConnected,
                        _ => ReplyStatus::HostUnreachable,
                    };
                    return CallFuture::failed(status);
                }
            }
        };
        if channel.is_closed() {
            return CallFuture::failed(ReplyStatus::HostUnreachable);
        }
        if !self.auth.apply_call(call) {
            warn!("Authentication refused call {} on object {}", call.method, call.object_id);
            return CallFuture::failed(ReplyStatus::AuthFailure);
        }
        channel.request(call)
    }

    pub(crate) fn internal_call(&self, call: &mut CallMessage, control: bool) -> ReplyMessage {
        if self.is_started() && !self.server_alive() {
            call.clear();
            return ReplyMessage::failure(ReplyStatus::HostUnreachable);
        }

        let _command = if control {
            None
        } else {
            let guard = self.cancel.begin_command();
            call.command_id = guard.id();
            Some(guard)
        };

        let future = self.internal_call_future(call, control);
        while !future.wait_for(self.config.call_poll_interval) {
            if !self.server_alive() {
                debug!("Abandoning call {}: server unreachable", call.method);
                call.clear();
                return ReplyMessage::failure(ReplyStatus::HostUnreachable);
            }
        }

        let mut reply = future
            .get()
            .unwrap_or_else(|| ReplyMessage::failure(ReplyStatus::HostUnreachable));
        if future.is_local() || reply.status.is_local_failure() {
            call.clear();
            return reply;
        }
        if !self.auth.validate_reply(&mut reply) {
            warn!("Reply to {} failed authentication", call.method);
            return ReplyMessage::failure(ReplyStatus::AuthFailure);
        }
        reply
    }

    /// Issue on a specific channel with a single bounded wait.
    fn call_on(
        &self,
        channel: &AsyncRequestSocket,
        call: &mut CallMessage,
        timeout: Duration,
    ) -> Result<ReplyMessage> {
        if !self.auth.apply_call(call) {
            return Err(CommError::from_status(ReplyStatus::AuthFailure, b"call refused"));
        }
        let future = channel.request(call);
        if !future.wait_for(timeout) {
            return Err(CommError::Timeout(timeout));
        }
        let mut reply = future.get().ok_or(CommError::Timeout(timeout))?;
        if future.is_local() {
            return reply.into_result();
        }
        if !reply.status.is_local_failure() && !self.auth.validate_reply(&mut reply) {
            return Err(CommError::from_status(ReplyStatus::AuthFailure, b"reply failed validation"));
        }
        reply.into_result()
    }

    pub(crate) fn call(&self, object_id: u64, method: &str, body: Bytes) -> Result<ReplyMessage> {
        self.require_started()?;
        let mut call = CallMessage::new(object_id, method, body);
        self.internal_call(&mut call, false).into_result()
    }

    pub(crate) fn call_json<P: Serialize, R: DeserializeOwned>(
        &self,
        object_id: u64,
        method: &str,
        params: &P,
    ) -> Result<R> {
        self.require_started()?;
        let mut call = CallMessage::json(object_id, method, params)?;
        self.internal_call(&mut call, false).into_result()?.parse()
    }

    fn make_object(&self, type_name: &str) -> Result<u64> {
        self.require_started()?;
        let _creating = self.sync_gate.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let request = MakeObjectRequest {
            type_name: type_name.to_string(),
        };
        let response: MakeObjectResponse =
            self.call_json(ROOT_OBJECT_ID, protocol::MAKE_OBJECT, &request)?;
        self.objects.incr(response.object_id);
        debug!("Created {} object {}", type_name, response.object_id);
        Ok(response.object_id)
    }

    fn ping(&self, value: &str) -> Result<String> {
        let request = PingRequest {
            value: value.to_string(),
            cancel_command: None,
        };
        let response: PingResponse = self.call_json(ROOT_OBJECT_ID, protocol::PING, &request)?;
        Ok(response.value)
    }

    fn delete_object(&self, object_id: u64) -> Result<()> {
        self.require_started()?;
        if !self.objects.contains(object_id) {
            return Err(CommError::UntrackedObject { object_id });
        }

        let request = DeleteObjectRequest { object_id };
        match CallMessage::json(ROOT_OBJECT_ID, protocol::DELETE_OBJECT, &request) {
            Ok(mut call) => {
                let reply = self.internal_call(&mut call, false);
                if !reply.status.is_ok() {
                    warn!(
                        "Destructor of object {} failed with {}, releasing anyway",
                        object_id, reply.status
                    );
                }
            }
            Err(e) => warn!("Failed to encode deletion of object {}: {}", object_id, e),
        }

        match self.decr_ref_count(object_id) {
            Ok(_) | Err(CommError::UntrackedObject { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn incr_ref_count(&self, object_id: u64) -> usize {
        self.objects.incr(object_id)
    }

    pub(crate) fn decr_ref_count(&self, object_id: u64) -> Result<usize> {
        match self.objects.decr(object_id) {
            None => Err(CommError::UntrackedObject { object_id }),
            Some(0) => {
                self.send_deletion_list(&[object_id]);
                Ok(0)
            }
            Some(remaining) => Ok(remaining),
        }
    }

    /// Tell the server it may release `object_ids`. Fire and forget.
    fn send_deletion_list(&self, object_ids: &[u64]) {
        if !self.is_started() || !self.server_alive() {
            debug!("Server not reachable, skipping release of {:?}", object_ids);
            return;
        }
        let request = SyncObjectsRequest {
            object_ids: object_ids.to_vec(),
            active_list: false,
        };
        match CallMessage::json(ROOT_OBJECT_ID, protocol::SYNC_OBJECTS, &request) {
            Ok(mut call) => {
                // Unanswered releases are swept from the pending map by the
                // next request on the channel.
                let future = self.internal_call_future(&mut call, true);
                if future.is_local() {
                    debug!("Release of {:?} not sent", object_ids);
                } else {
                    debug!("Released objects {:?}", object_ids);
                }
            }
            Err(e) => warn!("Failed to encode release of {:?}: {}", object_ids, e),
        }
    }

    pub(crate) fn try_send_tracked_objects(&self, force: bool) -> SyncOutcome {
        if !force {
            if let Some(last) = *lock(&self.last_sync) {
                if last.elapsed() < self.config.sync_interval {
                    return SyncOutcome::NotDue;
                }
            }
        }

        let _gate = match self.sync_gate.try_write() {
            Ok(gate) => gate,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Object creation in flight, deferring sync");
                return SyncOutcome::NotDue;
            }
        };

        let Some(control) = self.channels().as_ref().map(|c| c.control.clone()) else {
            return SyncOutcome::Failed;
        };
        let request = SyncObjectsRequest {
            object_ids: self.objects.tracked_ids(),
            active_list: true,
        };
        let mut call = match CallMessage::json(ROOT_OBJECT_ID, protocol::SYNC_OBJECTS, &request) {
            Ok(call) => call,
            Err(e) => {
                error!("Failed to encode tracked-object list: {}", e);
                return SyncOutcome::Failed;
            }
        };

        match self.call_on(&control, &mut call, self.config.ping_timeout) {
            Ok(_) => {
                *lock(&self.last_sync) = Some(Instant::now());
                debug!("Synced {} tracked objects", request.object_ids.len());
                SyncOutcome::Sent
            }
            Err(e) => {
                debug!("Tracked-object sync failed: {}", e);
                SyncOutcome::Failed
            }
        }
    }

    /// One-way transition; only a new client brings the server back.
    fn mark_server_dead(&self) {
        if !self.server_alive.swap(false, Ordering::SeqCst) {
            return;
        }
        error!(
            "Server {} stopped answering pings, marking it unreachable",
            self.config.name
        );
        if let Some(channels) = self.channels().as_ref() {
            let failed = channels.object.fail_pending(ReplyStatus::HostUnreachable)
                + channels.control.fail_pending(ReplyStatus::HostUnreachable);
            if failed > 0 {
                debug!("Failed {} outstanding calls", failed);
            }
        }
    }
}
