//! Framed multi-part message transport over TCP.
//!
//! Provides the socket primitives the RPC layer is built on:
//!
//! - **Router**: bound socket that tags every inbound message with the
//!   sender's identity frame and routes outbound messages by that frame
//! - **Dealer**: connecting socket with automatic reconnect
//! - **Publisher / Subscriber**: prefix-filtered fan-out
//!
//! Network I/O runs on the [`Context`] threads. Inbound messages are queued
//! on an [`Inbound`] receiver that a [`crate::pollset::Pollset`] drains.

pub mod codec;
pub mod context;
pub mod dealer;
pub mod endpoint;
pub mod pubsub;
pub mod router;

pub use context::Context;
pub use dealer::DealerSocket;
pub use endpoint::{is_literal, rewrite_any_address, Endpoint};
pub use pubsub::{PublisherSocket, Subscribe, SubscriberSocket, SubscriptionHandle};
pub use router::{RouterSender, RouterSocket};

use crate::message::Multipart;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Receive queue of a socket.
pub type Inbound = mpsc::UnboundedReceiver<Multipart>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accept connections until shutdown, numbering peers from 1.
pub(crate) async fn accept_loop<F>(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    mut on_accept: F,
) where
    F: FnMut(u64, TcpStream),
{
    let mut next_peer: u64 = 1;
    if *shutdown_rx.borrow() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        debug!("Accepted peer {} from {}", next_peer, peer_addr);
                        on_accept(next_peer, stream);
                        next_peer += 1;
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}
