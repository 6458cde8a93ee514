//! Declared interface to the chat core.
//!
//! The chat engine is an external collaborator: it accepts JSON commands on
//! an input queue and emits JSON responses on an output queue. Replies carry
//! the correlation id of the command that caused them; spontaneous events
//! carry none. Output flagged `log_only` is written to the log file and is
//! never mirrored to a satellite.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::LinkError;

pub type CorrId = u64;

#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub corr_id: CorrId,
    pub cmd: Value,
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub corr_id: Option<CorrId>,
    pub resp: Value,
    pub log_only: bool,
}

impl EngineOutput {
    pub fn reply(corr_id: CorrId, resp: Value) -> Self {
        Self { corr_id: Some(corr_id), resp, log_only: false }
    }

    pub fn event(resp: Value) -> Self {
        Self { corr_id: None, resp, log_only: false }
    }
}

/// Sender half of the engine's input queue.
#[derive(Clone)]
pub struct EngineHandle {
    input: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(input: mpsc::Sender<EngineCommand>) -> Self {
        Self { input }
    }

    pub async fn submit(&self, cmd: EngineCommand) -> Result<(), LinkError> {
        self.input.send(cmd).await.map_err(|_| LinkError::Closed)
    }
}
