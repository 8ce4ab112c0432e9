use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_SEND_PORT: &str = "send";
pub const DEFAULT_RECEIVE_PORT: &str = "receive";

/// What a worker unit does when its program faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Report the fault back as a `WORKER_ERROR` envelope and keep the unit
    /// alive.
    #[default]
    Report,
    /// Log the fault and stop the unit.
    Crash,
}

/// Everything needed to load the driver program and, later, every worker.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program_path: String,
    pub module_name: String,
    /// Driver port the core subscribes to.
    pub send_port: String,
    /// Driver port the core pushes into.
    pub receive_port: String,
    pub args: Value,
    pub fault_policy: FaultPolicy,
}

impl SupervisorConfig {
    pub fn new(program_path: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            program_path: program_path.into(),
            module_name: module_name.into(),
            send_port: DEFAULT_SEND_PORT.to_string(),
            receive_port: DEFAULT_RECEIVE_PORT.to_string(),
            args: Value::Null,
            fault_policy: FaultPolicy::default(),
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_send_port(mut self, name: impl Into<String>) -> Self {
        self.send_port = name.into();
        self
    }

    pub fn with_receive_port(mut self, name: impl Into<String>) -> Self {
        self.receive_port = name.into();
        self
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Blob handed to every worker in its `INIT_WORKER` envelope.
    pub(crate) fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program_path: self.program_path.clone(),
            module_name: self.module_name.clone(),
            send_port_name: self.send_port.clone(),
            receive_port_name: self.receive_port.clone(),
            args: self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkerConfig {
    pub program_path: String,
    pub module_name: String,
    pub send_port_name: String,
    pub receive_port_name: String,
    #[serde(default)]
    pub args: Value,
}
