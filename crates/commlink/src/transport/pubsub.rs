//! Publisher and subscriber sockets.
//!
//! Subscribers tell the publisher which topic prefixes they want with
//! single-frame control messages:
//!
//! ```text
//! [0x01][prefix bytes]   subscribe
//! [0x00][prefix bytes]   unsubscribe
//! ```
//!
//! The publisher forwards a message to a subscriber only when its first frame
//! starts with one of that subscriber's prefixes. Subscriptions are replayed
//! on every reconnect.

use super::codec::{read_multipart, write_multipart};
use super::dealer::{DealerSocket, Greeting};
use super::endpoint::{bind_listener, Endpoint};
use super::{accept_loop, lock, Context, Inbound};
use crate::error::{CommError, Result};
use crate::message::Multipart;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x00;

struct SubscriberEntry {
    tx: mpsc::UnboundedSender<Multipart>,
    prefixes: Vec<Bytes>,
}

type SubscriberMap = Arc<Mutex<HashMap<u64, SubscriberEntry>>>;

pub struct PublisherSocket {
    endpoint: Endpoint,
    subscribers: SubscriberMap,
    shutdown_tx: watch::Sender<bool>,
}

impl PublisherSocket {
    pub fn bind(ctx: &Context, address: Option<&str>) -> Result<Self> {
        let (std_listener, endpoint) = bind_listener(address)?;
        std_listener.set_nonblocking(true)?;

        let listener = {
            let _guard = ctx.handle().enter();
            TcpListener::from_std(std_listener)?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscribers = SubscriberMap::default();

        let handle = ctx.handle().clone();
        let accept_subscribers = subscribers.clone();
        let peer_shutdown = shutdown_rx.clone();
        ctx.handle().spawn(accept_loop(listener, shutdown_rx, move |id, stream| {
            handle.spawn(handle_subscriber(
                id,
                stream,
                accept_subscribers.clone(),
                peer_shutdown.clone(),
            ));
        }));

        info!("Publisher bound on {}", endpoint);

        Ok(Self {
            endpoint,
            subscribers,
            shutdown_tx,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Publish to every matching subscriber. Returns the delivery count.
    pub fn publish(&self, frames: Multipart) -> usize {
        let topic = frames.first().cloned().unwrap_or_default();
        let subscribers = lock(&self.subscribers);
        let mut delivered = 0;
        for entry in subscribers.values() {
            let matches = entry.prefixes.iter().any(|prefix| topic.starts_with(prefix));
            if matches && entry.tx.send(frames.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        lock(&self.subscribers).clear();
        debug!("Publisher on {} closed", self.endpoint);
    }
}

impl Drop for PublisherSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_subscriber(
    id: u64,
    stream: TcpStream,
    subscribers: SubscriberMap,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();
    lock(&subscribers).insert(
        id,
        SubscriberEntry {
            tx,
            prefixes: Vec::new(),
        },
    );

    tokio::spawn(async move {
        while let Some(frames) = rx.recv().await {
            if write_multipart(&mut writer, &frames).await.is_err() {
                break;
            }
        }
    });

    if !*shutdown_rx.borrow() {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                read = read_multipart(&mut reader) => {
                    match read {
                        Ok(Some(frames)) => apply_control(id, &frames, &subscribers),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Subscriber {} read failed: {}", id, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    lock(&subscribers).remove(&id);
}

fn apply_control(id: u64, frames: &[Bytes], subscribers: &SubscriberMap) {
    let [frame] = frames else {
        debug!("Ignoring {}-frame control message from subscriber {}", frames.len(), id);
        return;
    };
    let Some((&kind, prefix)) = frame.split_first() else {
        return;
    };
    let prefix = Bytes::copy_from_slice(prefix);

    let mut subscribers = lock(subscribers);
    let Some(entry) = subscribers.get_mut(&id) else {
        return;
    };
    match kind {
        SUBSCRIBE => {
            if !entry.prefixes.contains(&prefix) {
                entry.prefixes.push(prefix);
            }
        }
        UNSUBSCRIBE => entry.prefixes.retain(|p| p != &prefix),
        other => debug!("Unknown control byte {} from subscriber {}", other, id),
    }
}

fn control_frame(kind: u8, prefix: &str) -> Multipart {
    let mut frame = BytesMut::with_capacity(prefix.len() + 1);
    frame.put_u8(kind);
    frame.put_slice(prefix.as_bytes());
    vec![frame.freeze()]
}

/// Transport-level subscription management.
pub trait Subscribe: Send + Sync {
    fn subscribe(&self, prefix: &str) -> Result<()>;
    fn unsubscribe(&self, prefix: &str) -> Result<()>;
}

pub struct SubscriberSocket {
    dealer: DealerSocket,
    handle: SubscriptionHandle,
}

impl SubscriberSocket {
    pub fn connect(ctx: &Context, address: &str) -> Result<Self> {
        let subscriptions: Arc<Mutex<Vec<String>>> = Arc::default();
        let replay = subscriptions.clone();
        let greeting: Greeting = Arc::new(move || {
            lock(&replay)
                .iter()
                .map(|prefix| control_frame(SUBSCRIBE, prefix))
                .collect()
        });

        let dealer = DealerSocket::connect_with_greeting(ctx, address, greeting)?;
        let handle = SubscriptionHandle {
            subscriptions,
            outbound: dealer.outbound(),
        };
        Ok(Self { dealer, handle })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.dealer.endpoint()
    }

    /// A cloneable handle for managing subscriptions from other threads.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self, prefix: &str) -> Result<()> {
        self.handle.subscribe(prefix)
    }

    pub fn unsubscribe(&self, prefix: &str) -> Result<()> {
        self.handle.unsubscribe(prefix)
    }

    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.dealer.take_inbound()
    }

    pub fn is_connected(&self) -> bool {
        self.dealer.is_connected()
    }

    pub fn close(&self) {
        self.dealer.close();
    }
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    subscriptions: Arc<Mutex<Vec<String>>>,
    outbound: mpsc::UnboundedSender<Multipart>,
}

impl SubscriptionHandle {
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    fn send(&self, frames: Multipart) -> Result<()> {
        self.outbound.send(frames).map_err(|_| CommError::Transport {
            message: "Subscriber socket is closed".to_string(),
            source: None,
        })
    }
}

impl Subscribe for SubscriptionHandle {
    fn subscribe(&self, prefix: &str) -> Result<()> {
        {
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.iter().any(|p| p == prefix) {
                return Ok(());
            }
            subscriptions.push(prefix.to_string());
        }
        self.send(control_frame(SUBSCRIBE, prefix))
    }

    fn unsubscribe(&self, prefix: &str) -> Result<()> {
        lock(&self.subscriptions).retain(|p| p != prefix);
        self.send(control_frame(UNSUBSCRIBE, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_control_frame_layout() {
        let frames = control_frame(SUBSCRIBE, "job:");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\x01job:");
    }

    #[test]
    fn test_prefix_filtered_delivery() {
        let ctx = Context::new().unwrap();
        let publisher = PublisherSocket::bind(&ctx, Some("tcp://127.0.0.1:0")).unwrap();
        let mut subscriber = SubscriberSocket::connect(&ctx, &publisher.endpoint().to_string()).unwrap();
        let mut inbound = subscriber.take_inbound().unwrap();
        subscriber.subscribe("job:").unwrap();

        // Wait until the subscription reached the publisher.
        assert!(wait_until(Duration::from_secs(5), || {
            publisher.publish(vec![Bytes::from_static(b"job: indexing")]) > 0
        }));
        publisher.publish(vec![Bytes::from_static(b"other: ignored")]);
        publisher.publish(vec![Bytes::from_static(b"job: done")]);

        let mut received = Vec::new();
        assert!(wait_until(Duration::from_secs(5), || {
            while let Ok(frames) = inbound.try_recv() {
                received.push(frames[0].clone());
            }
            received.contains(&Bytes::from_static(b"job: done"))
        }));
        assert!(!received.contains(&Bytes::from_static(b"other: ignored")));
    }

    #[test]
    fn test_duplicate_subscribe_is_recorded_once() {
        let ctx = Context::new().unwrap();
        let subscriber = SubscriberSocket::connect(&ctx, "tcp://127.0.0.1:1").unwrap();
        subscriber.subscribe("a").unwrap();
        subscriber.subscribe("a").unwrap();
        assert_eq!(subscriber.handle().subscriptions(), vec!["a".to_string()]);
        subscriber.unsubscribe("a").unwrap();
        assert!(subscriber.handle().subscriptions().is_empty());
    }
}
