//! Transport context: the I/O threads behind every socket.
//!
//! Sockets created from a context run their network I/O as tasks on the
//! context's runtime. Application threads only exchange whole messages with
//! those tasks through queues.

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use std::sync::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

pub struct Context {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl Context {
    pub fn new() -> Result<Self> {
        Self::with_io_threads(CommConfig::IO_THREADS)
    }

    pub fn with_io_threads(io_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("commlink-io")
            .enable_all()
            .build()
            .map_err(|e| CommError::Transport {
                message: "Failed to start transport I/O threads".to_string(),
                source: Some(e),
            })?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_terminated(&self) -> bool {
        self.runtime.lock().map(|rt| rt.is_none()).unwrap_or(true)
    }

    /// Stop the I/O threads. Sockets still open stop moving data.
    ///
    /// Must not be called from inside a transport task.
    pub fn terminate(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(CommConfig::CONTEXT_SHUTDOWN_TIMEOUT);
            debug!("Transport context terminated");
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
