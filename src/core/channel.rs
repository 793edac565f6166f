//! Purpose: Asynchronous output-channel messages and the publisher seam.
//! Exports: `Publisher`, `OutputMessage`, `StreamName`, `ExecutionState`.
//! Role: What the kernel hands the transport as "send message of kind K with payload P".
//! Invariants: `msg_type`/`content` pairs match the notebook protocol's iopub shapes.
use serde_json::{Map, Value, json};

use crate::core::error::Error;
use crate::core::mime::MimeBundle;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    Busy,
    Idle,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Busy => "busy",
            ExecutionState::Idle => "idle",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputMessage {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
    },
    ExecuteResult {
        execution_count: u64,
        data: MimeBundle,
    },
    Status {
        execution_state: ExecutionState,
    },
}

impl OutputMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            OutputMessage::Stream { .. } => "stream",
            OutputMessage::DisplayData { .. } => "display_data",
            OutputMessage::ExecuteResult { .. } => "execute_result",
            OutputMessage::Status { .. } => "status",
        }
    }

    pub fn content(&self) -> Value {
        match self {
            OutputMessage::Stream { name, text } => json!({
                "name": name.as_str(),
                "text": text,
            }),
            OutputMessage::DisplayData { data } => json!({
                "data": data.to_json(),
                "metadata": Value::Object(Map::new()),
            }),
            OutputMessage::ExecuteResult {
                execution_count,
                data,
            } => json!({
                "execution_count": execution_count,
                "data": data.to_json(),
                "metadata": Value::Object(Map::new()),
            }),
            OutputMessage::Status { execution_state } => json!({
                "execution_state": execution_state.as_str(),
            }),
        }
    }
}

/// Sends output-channel messages to the front-end.
pub trait Publisher {
    fn publish(&mut self, message: OutputMessage) -> Result<(), Error>;
}

/// Collects messages in order; used by callers that buffer output.
impl Publisher for Vec<OutputMessage> {
    fn publish(&mut self, message: OutputMessage) -> Result<(), Error> {
        self.push(message);
        Ok(())
    }
}
