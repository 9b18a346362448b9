//! Dealer socket: a single outbound connection that reconnects on its own.
//!
//! `connect` never fails because the peer is absent. Outbound messages queue
//! until a connection exists; a message being written when the connection
//! drops is lost.

use super::codec::{read_multipart, write_multipart};
use super::endpoint::Endpoint;
use super::{Context, Inbound};
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::message::Multipart;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Messages written first on every (re)connection.
pub(crate) type Greeting = Arc<dyn Fn() -> Vec<Multipart> + Send + Sync>;

pub struct DealerSocket {
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Multipart>,
    inbound: Option<Inbound>,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl DealerSocket {
    pub fn connect(ctx: &Context, address: &str) -> Result<Self> {
        Self::connect_with_greeting(ctx, address, Arc::new(Vec::<Multipart>::new))
    }

    pub(crate) fn connect_with_greeting(ctx: &Context, address: &str, greeting: Greeting) -> Result<Self> {
        let endpoint = Endpoint::parse(address)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        ctx.handle().spawn(connection_loop(
            endpoint.socket_addr_string(),
            outbound_rx,
            inbound_tx,
            shutdown_rx,
            connected.clone(),
            greeting,
        ));

        debug!("Dealer connecting to {}", endpoint);

        Ok(Self {
            endpoint,
            outbound: outbound_tx,
            inbound: Some(inbound_rx),
            connected,
            shutdown_tx,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn send(&self, frames: Multipart) -> Result<()> {
        self.outbound.send(frames).map_err(|_| CommError::Transport {
            message: format!("Socket to {} is closed", self.endpoint),
            source: None,
        })
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<Multipart> {
        self.outbound.clone()
    }

    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn close(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!("Dealer to {} closed", self.endpoint);
        }
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

enum ConnectionEnd {
    Reconnect,
    Exit,
}

async fn connection_loop(
    addr: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Multipart>,
    inbound_tx: mpsc::UnboundedSender<Multipart>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    greeting: Greeting,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match tokio::time::timeout(CommConfig::CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                connected.store(true, Ordering::SeqCst);
                debug!("Connected to {}", addr);
                let end = run_connection(
                    stream,
                    &mut outbound_rx,
                    &inbound_tx,
                    &mut shutdown_rx,
                    &greeting,
                )
                .await;
                connected.store(false, Ordering::SeqCst);
                if let ConnectionEnd::Exit = end {
                    break;
                }
                debug!("Connection to {} lost, reconnecting", addr);
            }
            Ok(Err(e)) => debug!("Connect to {} failed: {}", addr, e),
            Err(_) => debug!("Connect to {} timed out", addr),
        }

        tokio::select! {
            _ = tokio::time::sleep(CommConfig::RECONNECT_INTERVAL) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn run_connection(
    stream: TcpStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Multipart>,
    inbound_tx: &mpsc::UnboundedSender<Multipart>,
    shutdown_rx: &mut watch::Receiver<bool>,
    greeting: &Greeting,
) -> ConnectionEnd {
    let (mut reader, mut writer) = stream.into_split();

    for frames in greeting() {
        if write_multipart(&mut writer, &frames).await.is_err() {
            return ConnectionEnd::Reconnect;
        }
    }

    let inbound = inbound_tx.clone();
    let mut reader_task = tokio::spawn(async move {
        loop {
            match read_multipart(&mut reader).await {
                Ok(Some(frames)) => {
                    if inbound.send(frames).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    break;
                }
            }
        }
    });

    let end = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break ConnectionEnd::Exit,
            _ = &mut reader_task => break ConnectionEnd::Reconnect,
            next = outbound_rx.recv() => {
                match next {
                    Some(frames) => {
                        if let Err(e) = write_multipart(&mut writer, &frames).await {
                            debug!("Write failed: {}", e);
                            break ConnectionEnd::Reconnect;
                        }
                    }
                    None => break ConnectionEnd::Exit,
                }
            }
        }
    };

    reader_task.abort();
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RouterSocket;
    use bytes::Bytes;
    use std::time::Duration;

    fn recv_blocking(inbound: &mut Inbound, timeout: Duration) -> Option<Multipart> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Ok(frames) = inbound.try_recv() {
                return Some(frames);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_dealer_router_roundtrip() {
        let ctx = Context::new().unwrap();
        let mut router = RouterSocket::bind(&ctx, Some("tcp://127.0.0.1:0")).unwrap();
        let mut router_inbound = router.take_inbound().unwrap();

        let mut dealer = DealerSocket::connect(&ctx, &router.endpoint().to_string()).unwrap();
        let mut dealer_inbound = dealer.take_inbound().unwrap();
        dealer.send(vec![Bytes::from_static(b"hello")]).unwrap();

        let received = recv_blocking(&mut router_inbound, Duration::from_secs(5)).unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1], Bytes::from_static(b"hello"));

        let reply = vec![received[0].clone(), Bytes::from_static(b"world")];
        router.sender().send(reply).unwrap();

        let answer = recv_blocking(&mut dealer_inbound, Duration::from_secs(5)).unwrap();
        assert_eq!(answer, vec![Bytes::from_static(b"world")]);

        dealer.close();
        router.close();
    }

    #[test]
    fn test_dealer_queues_until_peer_appears() {
        let ctx = Context::new().unwrap();
        // Reserve a port, release it, then connect before anything listens.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let address = format!("tcp://127.0.0.1:{}", port);

        let dealer = DealerSocket::connect(&ctx, &address).unwrap();
        dealer.send(vec![Bytes::from_static(b"early")]).unwrap();
        assert!(!dealer.is_connected());

        std::thread::sleep(Duration::from_millis(200));
        let mut router = RouterSocket::bind(&ctx, Some(&address)).unwrap();
        let mut inbound = router.take_inbound().unwrap();

        let received = recv_blocking(&mut inbound, Duration::from_secs(5)).unwrap();
        assert_eq!(received[1], Bytes::from_static(b"early"));
    }

    #[test]
    fn test_send_after_close_fails_eventually() {
        let ctx = Context::new().unwrap();
        let dealer = DealerSocket::connect(&ctx, "tcp://127.0.0.1:1").unwrap();
        dealer.close();
        assert!(dealer.is_closed());
        std::thread::sleep(Duration::from_millis(300));
        assert!(dealer.send(vec![Bytes::from_static(b"late")]).is_err());
    }
}
