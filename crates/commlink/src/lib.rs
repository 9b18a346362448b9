//! Commlink - remote-object RPC transport.
//!
//! A [`CommServer`] hosts long-lived remote objects behind an asynchronous
//! reply-socket dispatcher. A [`CommClient`] creates, calls and releases those
//! objects over a message-oriented socket transport, with discovery-based
//! addressing, heartbeat liveness detection, advisory cancellation and
//! reference-counted object lifetimes.
//!
//! All public APIs are blocking and thread based. Network I/O runs on the
//! transport [`Context`]; receive-side socket work runs on one reactor thread
//! per [`pollset::Pollset`].
//!
//! # Example
//!
//! ```rust,ignore
//! use commlink::{ClientConfig, CommClient, CommServer, ServerConfig};
//!
//! let server = CommServer::new(ServerConfig::default(), None)?;
//! server.register_type("echo", || std::sync::Arc::new(Echo));
//! let address = server.start()?;
//!
//! let client = CommClient::new(ClientConfig::new(address), None)?;
//! client.start()?;
//! let echo = client.make_proxy("echo")?;
//! let reply = echo.call("echo", "hello")?;
//! ```

pub mod auth;
pub mod cancel;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod future;
pub mod message;
pub mod platform;
pub mod pollset;
pub mod protocol;
pub mod reply_socket;
pub mod request_socket;
pub mod server;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use auth::{AuthChain, Authenticator, TokenAuthenticator};
pub use cancel::{install_interrupt_handler, request_interrupt, CancellationToken};
pub use client::{ClientState, CommClient, ObjectProxy, StatusCallback, SyncOutcome};
pub use config::{ClientConfig, CommConfig, ServerConfig};
pub use discovery::{Discovery, MemoryDiscovery, SqliteDiscovery};
pub use error::{CommError, Result};
pub use future::CallFuture;
pub use message::{CallMessage, Multipart, ReplyMessage, ROOT_OBJECT_ID};
pub use reply_socket::AsyncReplySocket;
pub use request_socket::AsyncRequestSocket;
pub use server::{CallContext, CommServer, RemoteObject, ServerStats};
pub use status::ReplyStatus;
pub use transport::Context;
