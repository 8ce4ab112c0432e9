use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WorkerId;

/// Every command an [`Envelope`] can carry, regardless of direction.
///
/// Which commands are valid depends on who sent the envelope: the driver
/// issues `Terminate`, `Emit` and `SendToWorker`; the router hands workers
/// `InitWorker` and `SendToWorker`; workers answer with `WorkerError`,
/// `MessageFromWorker` and `Initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Terminate,
    Emit,
    SendToWorker,
    InitWorker,
    WorkerError,
    MessageFromWorker,
    Initialized,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Terminate => "TERMINATE",
            Command::Emit => "EMIT",
            Command::SendToWorker => "SEND_TO_WORKER",
            Command::InitWorker => "INIT_WORKER",
            Command::WorkerError => "WORKER_ERROR",
            Command::MessageFromWorker => "MESSAGE_FROM_WORKER",
            Command::Initialized => "INITIALIZED",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TERMINATE" => Ok(Command::Terminate),
            "EMIT" => Ok(Command::Emit),
            "SEND_TO_WORKER" => Ok(Command::SendToWorker),
            "INIT_WORKER" => Ok(Command::InitWorker),
            "WORKER_ERROR" => Ok(Command::WorkerError),
            "MESSAGE_FROM_WORKER" => Ok(Command::MessageFromWorker),
            "INITIALIZED" => Ok(Command::Initialized),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command `{0}`")]
pub struct UnknownCommand(pub String);

/// The routed message unit.
///
/// `worker_id` is set for anything targeting or originating from a worker and
/// left empty for driver-directed traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: Command,
    #[serde(rename = "workerId", default)]
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(cmd: Command, worker_id: Option<WorkerId>, data: Value) -> Self {
        Self {
            cmd,
            worker_id,
            data,
        }
    }

    pub(crate) fn init_worker(config: String) -> Self {
        Self::new(Command::InitWorker, None, Value::String(config))
    }

    pub(crate) fn send_to_worker(data: Value) -> Self {
        Self::new(Command::SendToWorker, None, data)
    }

    pub(crate) fn initialized(worker_id: &str) -> Self {
        Self::new(Command::Initialized, Some(worker_id.to_string()), Value::Null)
    }

    pub(crate) fn worker_error(worker_id: &str, error: String) -> Self {
        Self::new(
            Command::WorkerError,
            Some(worker_id.to_string()),
            Value::String(error),
        )
    }

    pub(crate) fn message_from_worker(worker_id: &str, batch: Vec<Value>) -> Self {
        Self::new(
            Command::MessageFromWorker,
            Some(worker_id.to_string()),
            Value::Array(batch),
        )
    }
}

/// Envelope as the driver hands it over, before any validation.
///
/// The driver is opaque, so neither the command nor the worker identifier can
/// be trusted to be well-formed.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawEnvelope {
    #[serde(default)]
    pub cmd: Value,
    #[serde(rename = "workerId", default)]
    pub worker_id: Value,
    #[serde(default)]
    pub data: Value,
}

impl RawEnvelope {
    /// Lenient parse: anything that is not an object becomes an envelope with
    /// no command, which the router rejects as unrecognized.
    pub fn parse(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn command(&self) -> Result<Command, UnknownCommand> {
        match &self.cmd {
            Value::String(cmd) => cmd.parse(),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Message pushed into a program's incoming port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub for_worker: bool,
    pub worker_id: Option<WorkerId>,
    pub data: Value,
}

impl Inbound {
    /// Driver-directed message, either from the embedder (`worker_id` empty)
    /// or relayed from a worker.
    pub fn for_driver(worker_id: Option<WorkerId>, data: Value) -> Self {
        Self {
            for_worker: false,
            worker_id,
            data,
        }
    }

    /// Message delivered into a worker's own program instance.
    pub fn for_worker(data: Value) -> Self {
        Self {
            for_worker: true,
            worker_id: None,
            data,
        }
    }
}
