//! Diagnostic echo operation: hold the request for an artificial delay,
//! then return the submitted data unchanged. Exercises the full queued
//! request path without touching any state.

use std::time::Duration;

use replicore_shared::protocol::EchoResponseBody;

use super::{ExecResult, ExecState};

/// Largest single sleep between cancellation checkpoints
const CHECKPOINT_IVAL_MS: u64 = 100;

#[derive(Debug)]
pub struct EchoWorker {
    data: String,
    remaining_ms: u64,
}

impl EchoWorker {
    pub fn new(data: String, delay_ms: u64) -> Self {
        Self {
            data,
            remaining_ms: delay_ms,
        }
    }

    pub(super) async fn execute(&mut self) -> ExecResult {
        if self.remaining_ms == 0 {
            return Ok(ExecState::Done);
        }
        let step = self.remaining_ms.min(CHECKPOINT_IVAL_MS);
        tokio::time::sleep(Duration::from_millis(step)).await;
        self.remaining_ms -= step;
        Ok(ExecState::Continue)
    }

    pub fn response(&self) -> EchoResponseBody {
        EchoResponseBody {
            data: self.data.clone(),
        }
    }
}
