//! Status message fan-out.
//!
//! The reactor thread only copies each status message into a buffer and
//! wakes the dispatch thread. The dispatch thread swaps the buffer out, takes
//! a private copy of the watch table and runs the matching callbacks with no
//! lock held, so a callback may itself add or remove watches.

use crate::error::{CommError, Result};
use crate::message::Multipart;
use crate::transport::{lock, Subscribe};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Receives every status message starting with the watched prefix.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Buffer {
    messages: Vec<String>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<Buffer>,
    ready: Condvar,
    shutdown: AtomicBool,
    /// (prefix, callback) in registration order
    watches: Mutex<Vec<(String, StatusCallback)>>,
    subscriber: Mutex<Option<Arc<dyn Subscribe>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Prefix-matched dispatch of status messages. Clones share state.
#[derive(Clone, Default)]
pub struct StatusFanout {
    shared: Arc<Shared>,
}

impl StatusFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route transport subscriptions through `subscriber`, subscribing every
    /// prefix already watched.
    pub fn attach(&self, subscriber: Arc<dyn Subscribe>) -> Result<()> {
        let watches = lock(&self.shared.watches);
        for (prefix, _) in watches.iter() {
            subscriber.subscribe(prefix)?;
        }
        *lock(&self.shared.subscriber) = Some(subscriber);
        Ok(())
    }

    pub fn detach(&self) {
        lock(&self.shared.subscriber).take();
    }

    /// Watch `prefix`. A second watch on the same prefix replaces the
    /// callback; only the first one subscribes on the transport.
    pub fn add_status_watch(&self, prefix: &str, callback: StatusCallback) -> Result<()> {
        let mut watches = lock(&self.shared.watches);
        if let Some(entry) = watches.iter_mut().find(|(p, _)| p == prefix) {
            entry.1 = callback;
            return Ok(());
        }
        if let Some(subscriber) = lock(&self.shared.subscriber).as_ref() {
            subscriber.subscribe(prefix)?;
        }
        watches.push((prefix.to_string(), callback));
        Ok(())
    }

    /// Stop watching `prefix`. Returns false if it was not watched.
    pub fn remove_status_watch(&self, prefix: &str) -> bool {
        let mut watches = lock(&self.shared.watches);
        let before = watches.len();
        watches.retain(|(p, _)| p != prefix);
        if watches.len() == before {
            return false;
        }
        self.unsubscribe(prefix);
        true
    }

    /// Drop every watch.
    pub fn clear_status_watch(&self) {
        let removed = std::mem::take(&mut *lock(&self.shared.watches));
        for (prefix, _) in &removed {
            self.unsubscribe(prefix);
        }
    }

    pub fn watched_prefixes(&self) -> Vec<String> {
        lock(&self.shared.watches).iter().map(|(p, _)| p.clone()).collect()
    }

    fn unsubscribe(&self, prefix: &str) {
        if let Some(subscriber) = lock(&self.shared.subscriber).as_ref() {
            if let Err(e) = subscriber.unsubscribe(prefix) {
                debug!("Unsubscribe from {:?} failed: {}", prefix, e);
            }
        }
    }

    /// Reactor-side receive. Queues one single-frame status message.
    pub fn subscribe_callback(&self, frames: Multipart) {
        let [frame] = frames.as_slice() else {
            warn!("Dropping {}-frame status message", frames.len());
            return;
        };
        let message = String::from_utf8_lossy(frame).into_owned();
        let mut buffer = lock(&self.shared.buffer);
        if buffer.shutdown {
            return;
        }
        buffer.messages.push(message);
        self.shared.ready.notify_one();
    }

    /// Start the dispatch thread. Idempotent, and allowed again after `stop`.
    pub fn start(&self) -> Result<()> {
        let mut thread = lock(&self.shared.thread);
        if thread.is_some() {
            return Ok(());
        }
        lock(&self.shared.buffer).shutdown = false;
        self.shared.shutdown.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("status-dispatch".to_string())
            .spawn(move || dispatch_loop(shared))
            .map_err(|e| CommError::Transport {
                message: "Failed to spawn status dispatch thread".to_string(),
                source: Some(e),
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop and join the dispatch thread. Messages not yet dispatched are
    /// dropped.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let mut buffer = lock(&self.shared.buffer);
            buffer.shutdown = true;
            buffer.messages.clear();
            self.shared.ready.notify_all();
        }
        let handle = lock(&self.shared.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Status dispatch thread panicked");
            }
        }
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut buffer = lock(&shared.buffer);
            while buffer.messages.is_empty() && !buffer.shutdown {
                buffer = shared
                    .ready
                    .wait(buffer)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if buffer.shutdown {
                return;
            }
            std::mem::take(&mut buffer.messages)
        };

        let watches = lock(&shared.watches).clone();
        for message in &batch {
            for (prefix, callback) in &watches {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if !message.starts_with(prefix.as_str()) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                    error!("Status callback for {:?} panicked", prefix);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingSubscriber {
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
    }

    impl Subscribe for CountingSubscriber {
        fn subscribe(&self, _prefix: &str) -> Result<()> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unsubscribe(&self, _prefix: &str) -> Result<()> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, StatusCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |m: &str| lock(&sink).push(m.to_string())))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn frame(message: &'static str) -> Multipart {
        vec![Bytes::from_static(message.as_bytes())]
    }

    #[test]
    fn test_duplicate_prefix_replaces_callback_and_subscribes_once() {
        let fanout = StatusFanout::new();
        let subscriber = Arc::new(CountingSubscriber::default());
        fanout.attach(subscriber.clone()).unwrap();

        let (first, first_cb) = recorder();
        let (second, second_cb) = recorder();
        fanout.add_status_watch("job:", first_cb).unwrap();
        fanout.add_status_watch("job:", second_cb).unwrap();
        assert_eq!(subscriber.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(fanout.watched_prefixes(), vec!["job:".to_string()]);

        fanout.start().unwrap();
        fanout.subscribe_callback(frame("job: started"));
        assert!(wait_until(|| lock(&second).len() == 1));
        assert!(lock(&first).is_empty());
        fanout.stop();
    }

    #[test]
    fn test_attach_replays_existing_watches() {
        let fanout = StatusFanout::new();
        let (_, cb) = recorder();
        fanout.add_status_watch("a", cb.clone()).unwrap();
        fanout.add_status_watch("b", cb).unwrap();

        let subscriber = Arc::new(CountingSubscriber::default());
        fanout.attach(subscriber.clone()).unwrap();
        assert_eq!(subscriber.subscribes.load(Ordering::SeqCst), 2);

        assert!(fanout.remove_status_watch("a"));
        assert!(!fanout.remove_status_watch("a"));
        fanout.clear_status_watch();
        assert_eq!(subscriber.unsubscribes.load(Ordering::SeqCst), 2);
        assert!(fanout.watched_prefixes().is_empty());
    }

    #[test]
    fn test_dispatch_matches_prefix_in_arrival_order() {
        let fanout = StatusFanout::new();
        let (seen, cb) = recorder();
        fanout.add_status_watch("progress", cb).unwrap();
        fanout.start().unwrap();

        fanout.subscribe_callback(frame("progress 10"));
        fanout.subscribe_callback(frame("other 50"));
        fanout.subscribe_callback(frame("progress 20"));

        assert!(wait_until(|| lock(&seen).len() == 2));
        assert_eq!(*lock(&seen), vec!["progress 10".to_string(), "progress 20".to_string()]);
        fanout.stop();
    }

    #[test]
    fn test_multi_frame_messages_are_dropped() {
        let fanout = StatusFanout::new();
        let (seen, cb) = recorder();
        fanout.add_status_watch("", cb).unwrap();
        fanout.start().unwrap();

        fanout.subscribe_callback(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        fanout.subscribe_callback(frame("single"));
        assert!(wait_until(|| lock(&seen).len() == 1));
        assert_eq!(lock(&seen)[0], "single");
        fanout.stop();
    }

    #[test]
    fn test_callback_may_add_watch_without_deadlock() {
        let fanout = StatusFanout::new();
        let (seen, recorded) = recorder();
        let reentrant = fanout.clone();
        let callback: StatusCallback = Arc::new(move |_m: &str| {
            let _ = reentrant.add_status_watch("late", recorded.clone());
        });
        fanout.add_status_watch("trigger", callback).unwrap();
        fanout.start().unwrap();

        fanout.subscribe_callback(frame("trigger"));
        assert!(wait_until(|| fanout.watched_prefixes().len() == 2));
        fanout.subscribe_callback(frame("late arrival"));
        assert!(wait_until(|| lock(&seen).len() == 1));
        fanout.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let fanout = StatusFanout::new();
        let (seen, cb) = recorder();
        fanout.add_status_watch("", cb).unwrap();
        fanout.start().unwrap();
        fanout.stop();
        fanout.stop();
        // Messages after stop are ignored.
        fanout.subscribe_callback(frame("late"));

        fanout.start().unwrap();
        fanout.subscribe_callback(frame("again"));
        assert!(wait_until(|| lock(&seen).len() == 1));
        assert_eq!(lock(&seen)[0], "again");
        fanout.stop();
    }
}
