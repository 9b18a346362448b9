//! Single-threaded reactor driving receive-side socket I/O.
//!
//! A pollset owns one OS thread. Each registered source is a socket's
//! receive queue; whenever it becomes readable the reactor drains every
//! message currently queued and hands the batch to the source's callback.
//! Callbacks run on the reactor thread, which makes it the only thread that
//! touches state captured by them.

use crate::error::{CommError, Result};
use crate::message::Multipart;
use crate::transport::{lock, Inbound};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback invoked on the reactor thread with a drained batch.
pub type PollCallback = Box<dyn FnMut(Vec<Multipart>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

enum Command {
    Add {
        id: SourceId,
        name: String,
        inbound: Inbound,
        callback: PollCallback,
    },
    Remove(SourceId),
    Stop,
}

struct ReactorState {
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
    thread: Option<JoinHandle<()>>,
}

pub struct Pollset {
    name: String,
    next_source: AtomicU64,
    state: Mutex<ReactorState>,
}

impl Pollset {
    pub fn new(name: impl Into<String>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            next_source: AtomicU64::new(1),
            state: Mutex::new(ReactorState {
                commands_tx,
                commands_rx: Some(commands_rx),
                thread: None,
            }),
        }
    }

    /// Register a receive queue. Sources added before `start` are polled
    /// once the reactor runs.
    pub fn add_source(
        &self,
        name: impl Into<String>,
        inbound: Inbound,
        callback: PollCallback,
    ) -> Result<SourceId> {
        let id = SourceId(self.next_source.fetch_add(1, Ordering::SeqCst));
        let command = Command::Add {
            id,
            name: name.into(),
            inbound,
            callback,
        };
        lock(&self.state)
            .commands_tx
            .send(command)
            .map_err(|_| CommError::Other(format!("Pollset {} is stopped", self.name)))?;
        Ok(id)
    }

    /// Stop polling a source. Unknown ids are ignored.
    pub fn remove_source(&self, id: SourceId) {
        let _ = lock(&self.state).commands_tx.send(Command::Remove(id));
    }

    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.thread.is_some() {
            return Ok(());
        }
        let Some(commands_rx) = state.commands_rx.take() else {
            return Err(CommError::Other(format!("Pollset {} cannot restart", self.name)));
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| CommError::Transport {
                message: format!("Failed to build reactor for pollset {}", self.name),
                source: Some(e),
            })?;

        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{}-poll", self.name))
            .spawn(move || runtime.block_on(reactor(name, commands_rx)))
            .map_err(|e| CommError::Transport {
                message: format!("Failed to spawn reactor for pollset {}", self.name),
                source: Some(e),
            })?;

        state.thread = Some(thread);
        debug!("Pollset {} started", self.name);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).thread.is_some()
    }

    /// Stop the reactor and join it. Idempotent.
    ///
    /// Must not be called from a poll callback.
    pub fn stop(&self) {
        let thread = {
            let mut state = lock(&self.state);
            let _ = state.commands_tx.send(Command::Stop);
            state.thread.take()
        };
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Pollset {} reactor panicked", self.name);
            }
            debug!("Pollset {} stopped", self.name);
        }
    }
}

impl Drop for Pollset {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reactor(name: String, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut sources: HashMap<SourceId, tokio::task::JoinHandle<()>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Add {
                id,
                name: source,
                inbound,
                callback,
            } => {
                debug!("Pollset {} polling {}", name, source);
                sources.insert(id, tokio::spawn(drain_source(source, inbound, callback)));
            }
            Command::Remove(id) => {
                if let Some(task) = sources.remove(&id) {
                    task.abort();
                }
            }
            Command::Stop => break,
        }
    }

    for (_, task) in sources.drain() {
        task.abort();
    }
}

async fn drain_source(name: String, mut inbound: Inbound, mut callback: PollCallback) {
    while let Some(first) = inbound.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = inbound.try_recv() {
            batch.push(next);
        }
        callback(batch);
    }
    debug!("Source {} closed", name);
}
