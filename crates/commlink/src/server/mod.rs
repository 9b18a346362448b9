//! Comm server: hosts remote objects behind two reply sockets.
//!
//! The object socket carries ordinary method calls on a worker pool. The
//! control socket has its own workers so pings, cancellation and object
//! sync are answered while every object worker is busy. Status messages go
//! out on a publisher socket.
//!
//! A named server publishes `name`, `name_control` and `name_status` to the
//! discovery service. A server serves one controlling client: the active
//! object list that client sends on connect releases every other object.

mod dispatch;
mod object;

pub use dispatch::ServerStats;
pub use object::{unknown_method, CallContext, ObjectFactory, RemoteObject};

use crate::auth::Authenticator;
use crate::config::{CommConfig, ServerConfig};
use crate::discovery::Discovery;
use crate::error::{CommError, Result};
use crate::pollset::Pollset;
use crate::reply_socket::{AsyncReplySocket, ReplyCallback};
use crate::transport::{lock, Context, PublisherSocket};
use bytes::Bytes;
use dispatch::Dispatcher;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Created,
    Running,
    Stopped,
}

pub struct CommServer {
    config: ServerConfig,
    ctx: Arc<Context>,
    discovery: Option<Arc<dyn Discovery>>,
    dispatcher: Arc<Dispatcher>,
    pollset: Arc<Pollset>,
    object_socket: AsyncReplySocket,
    control_socket: AsyncReplySocket,
    status_key: Mutex<Option<String>>,
    state: Mutex<ServerState>,
}

impl CommServer {
    pub fn new(config: ServerConfig, discovery: Option<Arc<dyn Discovery>>) -> Result<Self> {
        let ctx = Arc::new(Context::new()?);
        let dispatcher = Arc::new(Dispatcher::new());

        let handler = dispatcher.clone();
        let callback: ReplyCallback = Arc::new(move |payload: &[Bytes]| handler.handle(payload));

        let object_socket = AsyncReplySocket::new(
            ctx.clone(),
            discovery.clone(),
            callback.clone(),
            config.worker_threads,
            "objects",
        )?;
        let control_socket = AsyncReplySocket::new(
            ctx.clone(),
            discovery.clone(),
            callback,
            config.control_worker_threads,
            "control",
        )?;

        Ok(Self {
            config,
            ctx,
            discovery,
            dispatcher,
            pollset: Arc::new(Pollset::new("server")),
            object_socket,
            control_socket,
            status_key: Mutex::new(None),
            state: Mutex::new(ServerState::Created),
        })
    }

    /// Make `type_name` constructible through `make_object`.
    pub fn register_type<F>(&self, type_name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn RemoteObject> + Send + Sync + 'static,
    {
        self.dispatcher.register_type(type_name, Arc::new(factory));
    }

    pub fn add_auth_method(&self, method: Arc<dyn Authenticator>) {
        self.dispatcher.auth.add(method);
    }

    /// Bind all sockets, publish discovery keys and start serving.
    ///
    /// Returns the object socket address. A failed start stops the server.
    pub fn start(&self) -> Result<String> {
        match *lock(&self.state) {
            ServerState::Running => {
                return self.address().ok_or_else(|| CommError::Other("Server has no address".to_string()));
            }
            ServerState::Stopped => return Err(CommError::Stopped),
            ServerState::Created => {}
        }

        match self.bind_and_publish() {
            Ok(address) => {
                *lock(&self.state) = ServerState::Running;
                info!("Server {} serving on {}", self.display_name(), address);
                Ok(address)
            }
            Err(e) => {
                warn!("Server {} failed to start: {}", self.display_name(), e);
                self.stop();
                Err(e)
            }
        }
    }

    fn bind_and_publish(&self) -> Result<String> {
        let address = self.object_socket.bind(self.config.bind_address.as_deref())?;
        let control_address = self
            .control_socket
            .bind(self.config.control_address.as_deref())?;
        let publisher = Arc::new(PublisherSocket::bind(
            &self.ctx,
            self.config.publish_address.as_deref(),
        )?);
        let publish_address = publisher.endpoint().to_string();
        self.dispatcher.set_addresses(control_address, publisher);

        self.object_socket.add_to_pollset(&self.pollset)?;
        self.control_socket.add_to_pollset(&self.pollset)?;

        if !self.config.name.is_empty() {
            self.publish_keys(&publish_address)?;
        }

        self.pollset.start()?;
        Ok(address)
    }

    fn publish_keys(&self, publish_address: &str) -> Result<()> {
        let name = self.config.name.as_str();
        let discovery = self.discovery.as_ref().ok_or_else(|| CommError::Config {
            message: format!("Server {} has a name but no discovery service", name),
        })?;
        let refused = |key: &str| CommError::Discovery {
            key: key.to_string(),
            message: "discovery service refused the key".to_string(),
        };

        if !self.object_socket.register_key(name) {
            return Err(refused(name));
        }
        let control_key = format!("{}{}", name, CommConfig::CONTROL_KEY_SUFFIX);
        if !self.control_socket.register_key(&control_key) {
            return Err(refused(&control_key));
        }
        let status_key = format!("{}{}", name, CommConfig::STATUS_KEY_SUFFIX);
        if !discovery.insert(&status_key, publish_address) {
            return Err(refused(&status_key));
        }
        *lock(&self.status_key) = Some(status_key);
        Ok(())
    }

    /// Stop serving and retract discovery keys. Idempotent.
    ///
    /// Blocks until in-flight object calls return.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Stopped;
        }

        self.pollset.stop();
        self.object_socket.close();
        self.control_socket.close();

        if let Some(key) = lock(&self.status_key).take() {
            let erased = self.discovery.as_ref().is_some_and(|d| d.erase(&key));
            if !erased {
                warn!("Ignoring failed retraction of {}", key);
            }
        }
        if let Some(publisher) = self.dispatcher.publisher() {
            publisher.close();
        }
        self.dispatcher.clear_addresses();
        self.ctx.terminate();
        info!("Server {} stopped", self.display_name());
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.state) == ServerState::Running
    }

    /// Object socket address, once bound.
    pub fn address(&self) -> Option<String> {
        self.object_socket.address()
    }

    pub fn control_address(&self) -> Option<String> {
        self.control_socket.address()
    }

    pub fn publish_address(&self) -> Option<String> {
        self.dispatcher.publisher().map(|p| p.endpoint().to_string())
    }

    /// Publish a status message to every subscribed client.
    pub fn publish_status(&self, message: &str) -> usize {
        match self.dispatcher.publisher() {
            Some(publisher) => publisher.publish(vec![Bytes::copy_from_slice(message.as_bytes())]),
            None => 0,
        }
    }

    pub fn object_count(&self) -> usize {
        self.dispatcher.object_count()
    }

    pub fn stats(&self) -> ServerStats {
        self.dispatcher.stats()
    }

    /// Command id most recently cancelled by the client, 0 if none.
    pub fn cancelled_command(&self) -> u64 {
        self.dispatcher.cancelled_command()
    }

    fn display_name(&self) -> &str {
        if self.config.name.is_empty() {
            "<unnamed>"
        } else {
            &self.config.name
        }
    }
}

impl Drop for CommServer {
    fn drop(&mut self) {
        self.stop();
    }
}
