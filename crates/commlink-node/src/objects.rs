//! Object types hosted by `commlink-node serve`.

use bytes::Bytes;
use commlink::server::unknown_method;
use commlink::{CallContext, CommError, RemoteObject, ReplyStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

pub const ECHO_TYPE: &str = "echo";

#[derive(Debug, Serialize, Deserialize)]
pub struct SleepParams {
    pub millis: u64,
}

/// Echoes bodies back, sleeps on request and reports status.
#[derive(Default)]
pub struct EchoObject {
    calls: AtomicU64,
}

impl EchoObject {
    fn sleep(&self, ctx: &CallContext, body: &Bytes) -> commlink::Result<Bytes> {
        let params: SleepParams = serde_json::from_slice(body)?;
        let deadline = Instant::now() + Duration::from_millis(params.millis);

        while Instant::now() < deadline {
            if ctx.must_cancel() {
                debug!("Sleep on object {} cancelled", ctx.object_id());
                return Err(CommError::Status {
                    status: ReplyStatus::Exception,
                    message: "cancelled".to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(Bytes::from(serde_json::to_vec(&params)?))
    }
}

impl RemoteObject for EchoObject {
    fn call(&self, ctx: &CallContext, method: &str, body: &Bytes) -> commlink::Result<Bytes> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match method {
            "echo" => Ok(body.clone()),
            "sleep" => self.sleep(ctx, body),
            "status" => {
                ctx.report_status(&format!(
                    "{}: object {} call {}",
                    ECHO_TYPE,
                    ctx.object_id(),
                    count
                ));
                Ok(Bytes::new())
            }
            "calls" => Ok(Bytes::from(count.to_string())),
            other => Err(unknown_method(other)),
        }
    }

    fn destroy(&self) {
        debug!(
            "Echo object destroyed after {} calls",
            self.calls.load(Ordering::SeqCst)
        );
    }
}
