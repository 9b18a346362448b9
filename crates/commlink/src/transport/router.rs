//! Router socket: one bound endpoint, many peers, identity-addressed.
//!
//! Every inbound message arrives with the peer's 8-byte identity prepended.
//! Outbound messages must start with an identity frame; the frame is stripped
//! and the rest is written to that peer. Messages for unknown peers are
//! dropped.

use super::codec::{read_multipart, write_multipart};
use super::endpoint::{bind_listener, Endpoint};
use super::{accept_loop, lock, Context, Inbound};
use crate::error::{CommError, Result};
use crate::message::Multipart;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

type PeerMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Multipart>>>>;

pub struct RouterSocket {
    endpoint: Endpoint,
    peers: PeerMap,
    inbound: Option<Inbound>,
    shutdown_tx: watch::Sender<bool>,
}

impl RouterSocket {
    /// Bind on `address`, or on the first free local port when `None`.
    pub fn bind(ctx: &Context, address: Option<&str>) -> Result<Self> {
        let (std_listener, endpoint) = bind_listener(address)?;
        std_listener.set_nonblocking(true)?;

        let listener = {
            let _guard = ctx.handle().enter();
            TcpListener::from_std(std_listener)?
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers = PeerMap::default();

        let handle = ctx.handle().clone();
        let accept_peers = peers.clone();
        let peer_shutdown = shutdown_rx.clone();
        ctx.handle().spawn(accept_loop(listener, shutdown_rx, move |id, stream| {
            handle.spawn(handle_peer(
                id,
                stream,
                accept_peers.clone(),
                inbound_tx.clone(),
                peer_shutdown.clone(),
            ));
        }));

        info!("Router bound on {}", endpoint);

        Ok(Self {
            endpoint,
            peers,
            inbound: Some(inbound_rx),
            shutdown_tx,
        })
    }

    /// The bound endpoint, with the requested host and the actual port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Hand the receive queue to a reader. Only the first call succeeds.
    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    pub fn sender(&self) -> RouterSender {
        RouterSender {
            peers: self.peers.clone(),
        }
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        lock(&self.peers).clear();
        debug!("Router on {} closed", self.endpoint);
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write half of a router socket.
#[derive(Clone)]
pub struct RouterSender {
    peers: PeerMap,
}

impl RouterSender {
    /// Send `frames`, whose first frame is the destination identity.
    pub fn send(&self, mut frames: Multipart) -> Result<()> {
        if frames.is_empty() {
            return Err(CommError::BadMessage {
                message: "Router message has no identity frame".to_string(),
            });
        }
        let identity = frames.remove(0);
        let peer = decode_identity(&identity).ok_or_else(|| CommError::BadMessage {
            message: format!("Invalid identity frame of {} bytes", identity.len()),
        })?;

        let peers = lock(&self.peers);
        let tx = peers.get(&peer).ok_or_else(|| CommError::Transport {
            message: format!("Peer {} is not connected", peer),
            source: None,
        })?;
        tx.send(frames).map_err(|_| CommError::Transport {
            message: format!("Peer {} connection closed", peer),
            source: None,
        })
    }
}

pub fn encode_identity(peer: u64) -> Bytes {
    Bytes::copy_from_slice(&peer.to_be_bytes())
}

pub fn decode_identity(frame: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = frame.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

async fn handle_peer(
    id: u64,
    stream: TcpStream,
    peers: PeerMap,
    inbound_tx: mpsc::UnboundedSender<Multipart>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();
    lock(&peers).insert(id, tx);

    tokio::spawn(async move {
        while let Some(frames) = rx.recv().await {
            if let Err(e) = write_multipart(&mut writer, &frames).await {
                debug!("Write to peer {} failed: {}", id, e);
                break;
            }
        }
    });

    let identity = encode_identity(id);
    if !*shutdown_rx.borrow() {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                read = read_multipart(&mut reader) => {
                    match read {
                        Ok(Some(mut frames)) => {
                            frames.insert(0, identity.clone());
                            if inbound_tx.send(frames).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("Peer {} disconnected", id);
                            break;
                        }
                        Err(e) => {
                            debug!("Read from peer {} failed: {}", id, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    lock(&peers).remove(&id);
}
