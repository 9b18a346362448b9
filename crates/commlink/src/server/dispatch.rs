//! Request dispatch: auth, the root object, and hosted objects.

use super::object::{unknown_method, CallContext, ObjectFactory, RemoteObject};
use crate::auth::AuthChain;
use crate::error::{CommError, Result};
use crate::message::{CallMessage, Multipart, ReplyMessage, ROOT_OBJECT_ID};
use crate::protocol::{
    self, AddressResponse, DeleteObjectRequest, MakeObjectRequest, MakeObjectResponse,
    PingRequest, PingResponse, SyncObjectsRequest, SyncObjectsResponse,
};
use crate::status::ReplyStatus;
use crate::transport::{lock, PublisherSocket};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub calls: u64,
    pub objects_created: u64,
    pub objects_released: u64,
    /// Deletion lists received (as opposed to full active lists).
    pub deletion_lists: u64,
    pub live_objects: usize,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    objects_created: AtomicU64,
    objects_released: AtomicU64,
    deletion_lists: AtomicU64,
}

#[derive(Default)]
struct Addresses {
    control: Option<String>,
    publish: Option<String>,
    publisher: Option<Arc<PublisherSocket>>,
}

pub(crate) struct Dispatcher {
    factories: RwLock<HashMap<String, ObjectFactory>>,
    objects: Mutex<HashMap<u64, Arc<dyn RemoteObject>>>,
    next_object_id: AtomicU64,
    pub(crate) auth: AuthChain,
    cancelled: Arc<AtomicU64>,
    addresses: Mutex<Addresses>,
    counters: Counters,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            next_object_id: AtomicU64::new(ROOT_OBJECT_ID + 1),
            auth: AuthChain::new(),
            cancelled: Arc::new(AtomicU64::new(0)),
            addresses: Mutex::new(Addresses::default()),
            counters: Counters::default(),
        }
    }

    pub(crate) fn register_type(&self, type_name: &str, factory: ObjectFactory) {
        self.factories
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(type_name.to_string(), factory);
    }

    pub(crate) fn set_addresses(&self, control: String, publisher: Arc<PublisherSocket>) {
        let mut addresses = lock(&self.addresses);
        addresses.control = Some(control);
        addresses.publish = Some(publisher.endpoint().to_string());
        addresses.publisher = Some(publisher);
    }

    pub(crate) fn clear_addresses(&self) {
        *lock(&self.addresses) = Addresses::default();
    }

    pub(crate) fn publisher(&self) -> Option<Arc<PublisherSocket>> {
        lock(&self.addresses).publisher.clone()
    }

    pub(crate) fn cancelled_command(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    pub(crate) fn stats(&self) -> ServerStats {
        ServerStats {
            calls: self.counters.calls.load(Ordering::SeqCst),
            objects_created: self.counters.objects_created.load(Ordering::SeqCst),
            objects_released: self.counters.objects_released.load(Ordering::SeqCst),
            deletion_lists: self.counters.deletion_lists.load(Ordering::SeqCst),
            live_objects: self.object_count(),
        }
    }

    /// Worker entry point: decode, authenticate, dispatch, encode.
    pub(crate) fn handle(&self, payload: &[Bytes]) -> Option<Multipart> {
        let reply = match CallMessage::from_frames(payload) {
            Ok(mut call) => {
                if self.auth.validate_call(&mut call) {
                    let mut reply = self.dispatch(&call);
                    if !self.auth.apply_reply(&mut reply) {
                        warn!("Failed to sign reply to {}", call.method);
                        reply = ReplyMessage::failure(ReplyStatus::AuthFailure);
                    }
                    reply
                } else {
                    warn!("Rejecting unauthenticated call {} on object {}", call.method, call.object_id);
                    ReplyMessage::failure(ReplyStatus::AuthFailure)
                }
            }
            Err(e) => {
                warn!("Rejecting malformed call: {}", e);
                ReplyMessage::new(ReplyStatus::BadMessage, e.to_string())
            }
        };

        match reply.to_frames() {
            Ok(frames) => Some(frames),
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                None
            }
        }
    }

    fn dispatch(&self, call: &CallMessage) -> ReplyMessage {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let result = if call.object_id == ROOT_OBJECT_ID {
            self.root_call(call)
        } else {
            self.object_call(call)
        };
        match result {
            Ok(body) => ReplyMessage::ok(body),
            Err(e) => error_reply(e),
        }
    }

    fn object_call(&self, call: &CallMessage) -> Result<Bytes> {
        let object = lock(&self.objects).get(&call.object_id).cloned();
        let object = object.ok_or_else(|| no_object(call.object_id))?;
        let ctx = CallContext::new(
            call.object_id,
            call.command_id,
            self.cancelled.clone(),
            self.publisher(),
        );
        object.call(&ctx, &call.method, &call.body)
    }

    fn root_call(&self, call: &CallMessage) -> Result<Bytes> {
        match call.method.as_str() {
            protocol::MAKE_OBJECT => {
                let request: MakeObjectRequest = parse(&call.body)?;
                let object_id = self.make_object(&request.type_name)?;
                to_body(&MakeObjectResponse { object_id })
            }
            protocol::PING => {
                let request: PingRequest = parse(&call.body)?;
                if let Some(command) = request.cancel_command {
                    info!("Client cancelled command {}", command);
                    self.cancelled.store(command, Ordering::SeqCst);
                }
                to_body(&PingResponse {
                    value: request.value,
                })
            }
            protocol::DELETE_OBJECT => {
                let request: DeleteObjectRequest = parse(&call.body)?;
                let object = lock(&self.objects)
                    .remove(&request.object_id)
                    .ok_or_else(|| no_object(request.object_id))?;
                object.destroy();
                self.counters.objects_released.fetch_add(1, Ordering::SeqCst);
                debug!("Deleted object {}", request.object_id);
                to_body(&SyncObjectsResponse { released: 1 })
            }
            protocol::SYNC_OBJECTS => {
                let request: SyncObjectsRequest = parse(&call.body)?;
                let released = self.sync_objects(&request);
                to_body(&SyncObjectsResponse { released })
            }
            protocol::GET_CONTROL_ADDRESS => {
                let address = lock(&self.addresses).control.clone();
                address_body(address)
            }
            protocol::GET_STATUS_PUBLISH_ADDRESS => {
                let address = lock(&self.addresses).publish.clone();
                address_body(address)
            }
            other => Err(unknown_method(other)),
        }
    }

    fn make_object(&self, type_name: &str) -> Result<u64> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| CommError::Status {
                status: ReplyStatus::NoObject,
                message: format!("Unknown object type {}", type_name),
            })?;

        let object = factory();
        let object_id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.objects).insert(object_id, object);
        self.counters.objects_created.fetch_add(1, Ordering::SeqCst);
        debug!("Created {} object {}", type_name, object_id);
        Ok(object_id)
    }

    /// Apply a client's object list. Returns how many objects were released.
    fn sync_objects(&self, request: &SyncObjectsRequest) -> usize {
        let released: Vec<Arc<dyn RemoteObject>> = {
            let mut objects = lock(&self.objects);
            if request.active_list {
                let keep: HashSet<u64> = request.object_ids.iter().copied().collect();
                let stale: Vec<u64> = objects.keys().filter(|id| !keep.contains(id)).copied().collect();
                stale.iter().filter_map(|id| objects.remove(id)).collect()
            } else {
                request
                    .object_ids
                    .iter()
                    .filter_map(|id| objects.remove(id))
                    .collect()
            }
        };
        if !request.active_list {
            self.counters.deletion_lists.fetch_add(1, Ordering::SeqCst);
        }

        let count = released.len();
        if count > 0 {
            self.counters
                .objects_released
                .fetch_add(count as u64, Ordering::SeqCst);
            debug!("Released {} objects", count);
        }
        // Objects drop here, outside the table lock.
        drop(released);
        count
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| CommError::BadMessage {
        message: format!("Invalid call body: {}", e),
    })
}

fn to_body<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn address_body(address: Option<String>) -> Result<Bytes> {
    let address = address.ok_or_else(|| CommError::Status {
        status: ReplyStatus::CommFailure,
        message: "Server is not bound".to_string(),
    })?;
    to_body(&AddressResponse { address })
}

fn no_object(object_id: u64) -> CommError {
    CommError::Status {
        status: ReplyStatus::NoObject,
        message: format!("No object {}", object_id),
    }
}

fn error_reply(error: CommError) -> ReplyMessage {
    let status = error.status();
    let message = match error {
        CommError::Status { message, .. } => message,
        other => other.to_string(),
    };
    ReplyMessage::new(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthenticator;

    struct Counter {
        value: AtomicU64,
    }

    impl RemoteObject for Counter {
        fn call(&self, _ctx: &CallContext, method: &str, _body: &Bytes) -> Result<Bytes> {
            match method {
                "incr" => {
                    let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Bytes::from(value.to_string()))
                }
                other => Err(unknown_method(other)),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher.register_type(
            "counter",
            Arc::new(|| {
                Arc::new(Counter {
                    value: AtomicU64::new(0),
                }) as Arc<dyn RemoteObject>
            }),
        );
        dispatcher
    }

    fn roundtrip(dispatcher: &Dispatcher, call: &CallMessage) -> ReplyMessage {
        let frames = dispatcher.handle(&call.to_frames().unwrap()).unwrap();
        ReplyMessage::from_frames(&frames).unwrap()
    }

    fn make(dispatcher: &Dispatcher) -> u64 {
        let call = CallMessage::json(
            ROOT_OBJECT_ID,
            protocol::MAKE_OBJECT,
            &MakeObjectRequest {
                type_name: "counter".to_string(),
            },
        )
        .unwrap();
        let response: MakeObjectResponse = roundtrip(dispatcher, &call).parse().unwrap();
        response.object_id
    }

    #[test]
    fn test_make_and_call_object() {
        let dispatcher = dispatcher();
        let id = make(&dispatcher);
        assert_ne!(id, ROOT_OBJECT_ID);

        let reply = roundtrip(&dispatcher, &CallMessage::new(id, "incr", Bytes::new()));
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.body, Bytes::from_static(b"1"));

        let reply = roundtrip(&dispatcher, &CallMessage::new(id, "bogus", Bytes::new()));
        assert_eq!(reply.status, ReplyStatus::NoFunction);
        assert_eq!(reply.body, Bytes::from_static(b"Unknown method bogus"));
    }

    #[test]
    fn test_unknown_type_and_object() {
        let dispatcher = dispatcher();
        let call = CallMessage::json(
            ROOT_OBJECT_ID,
            protocol::MAKE_OBJECT,
            &MakeObjectRequest {
                type_name: "missing".to_string(),
            },
        )
        .unwrap();
        assert_eq!(roundtrip(&dispatcher, &call).status, ReplyStatus::NoObject);

        let reply = roundtrip(&dispatcher, &CallMessage::new(99, "incr", Bytes::new()));
        assert_eq!(reply.status, ReplyStatus::NoObject);
    }

    #[test]
    fn test_malformed_call_is_bad_message() {
        let dispatcher = dispatcher();
        let frames = dispatcher.handle(&[Bytes::from_static(b"junk")]).unwrap();
        let reply = ReplyMessage::from_frames(&frames).unwrap();
        assert_eq!(reply.status, ReplyStatus::BadMessage);
    }

    #[test]
    fn test_active_list_releases_everything_else() {
        let dispatcher = dispatcher();
        let keep = make(&dispatcher);
        make(&dispatcher);
        make(&dispatcher);

        let request = SyncObjectsRequest {
            object_ids: vec![keep],
            active_list: true,
        };
        let call = CallMessage::json(ROOT_OBJECT_ID, protocol::SYNC_OBJECTS, &request).unwrap();
        let response: SyncObjectsResponse = roundtrip(&dispatcher, &call).parse().unwrap();
        assert_eq!(response.released, 2);
        assert_eq!(dispatcher.object_count(), 1);
        assert_eq!(dispatcher.stats().deletion_lists, 0);
    }

    #[test]
    fn test_deletion_list_ignores_unknown_ids() {
        let dispatcher = dispatcher();
        let id = make(&dispatcher);
        let request = SyncObjectsRequest {
            object_ids: vec![id, 12345],
            active_list: false,
        };
        let call = CallMessage::json(ROOT_OBJECT_ID, protocol::SYNC_OBJECTS, &request).unwrap();
        let response: SyncObjectsResponse = roundtrip(&dispatcher, &call).parse().unwrap();
        assert_eq!(response.released, 1);

        let stats = dispatcher.stats();
        assert_eq!(stats.deletion_lists, 1);
        assert_eq!(stats.objects_released, 1);
        assert_eq!(stats.live_objects, 0);
    }

    #[test]
    fn test_ping_records_cancellation() {
        let dispatcher = dispatcher();
        let request = PingRequest {
            value: "hb".to_string(),
            cancel_command: Some(42),
        };
        let call = CallMessage::json(ROOT_OBJECT_ID, protocol::PING, &request).unwrap();
        let response: PingResponse = roundtrip(&dispatcher, &call).parse().unwrap();
        assert_eq!(response.value, "hb");
        assert_eq!(dispatcher.cancelled_command(), 42);
    }

    #[test]
    fn test_addresses_unavailable_before_bind() {
        let dispatcher = dispatcher();
        let call = CallMessage::new(ROOT_OBJECT_ID, protocol::GET_CONTROL_ADDRESS, Bytes::new());
        assert_eq!(roundtrip(&dispatcher, &call).status, ReplyStatus::CommFailure);
    }

    #[test]
    fn test_auth_rejects_unsigned_calls() {
        let dispatcher = dispatcher();
        dispatcher.auth.add(Arc::new(TokenAuthenticator::new("secret")));

        let reply = roundtrip(&dispatcher, &CallMessage::new(ROOT_OBJECT_ID, "ping", Bytes::new()));
        assert_eq!(reply.status, ReplyStatus::AuthFailure);

        let mut call = CallMessage::json(
            ROOT_OBJECT_ID,
            protocol::PING,
            &PingRequest {
                value: "v".to_string(),
                cancel_command: None,
            },
        )
        .unwrap();
        call.auth.push("secret".to_string());
        let reply = roundtrip(&dispatcher, &call);
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.auth, vec!["secret".to_string()]);
    }
}
