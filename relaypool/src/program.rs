//! Boundary to the opaque programs run by the driver and by every worker.
//!
//! A [`Program`] is instantiated with an args blob and hands back a set of
//! named [`Ports`]. The core never looks inside a program: it subscribes to
//! an [`OutgoingPort`] to receive batches of raw envelopes and pushes single
//! [`Inbound`] messages into an [`IncomingPort`].

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::message::Inbound;
use error::{PortError, ProgramError};

/// Batch of raw envelopes emitted by a program in one go.
pub type Batch = Vec<Value>;

/// Program → core. The core subscribes by owning the receiving end.
#[derive(Debug)]
pub struct OutgoingPort {
    rx: UnboundedReceiver<Batch>,
}

impl OutgoingPort {
    /// Creates the port and the sender the program emits batches with.
    pub fn channel() -> (Self, UnboundedSender<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }

    /// Next batch, or `None` once the program dropped its sender.
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }
}

/// Core → program. Cheap to clone; the program owns the receiving end.
#[derive(Debug, Clone)]
pub struct IncomingPort {
    tx: UnboundedSender<Inbound>,
}

impl IncomingPort {
    /// Creates the port and the receiver the program reads inbound messages from.
    pub fn channel() -> (Self, UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Pushes one message. Hands the message back when the program is gone.
    pub fn send(&self, message: Inbound) -> Result<(), Inbound> {
        self.tx.send(message).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Outgoing,
    Incoming,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Outgoing => f.write_str("outgoing"),
            PortKind::Incoming => f.write_str("incoming"),
        }
    }
}

#[derive(Debug)]
pub enum Port {
    Outgoing(OutgoingPort),
    Incoming(IncomingPort),
}

impl Port {
    pub fn kind(&self) -> PortKind {
        match self {
            Port::Outgoing(_) => PortKind::Outgoing,
            Port::Incoming(_) => PortKind::Incoming,
        }
    }
}

/// Named ports exposed by one program instance.
#[derive(Debug, Default)]
pub struct Ports {
    inner: HashMap<String, Port>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a port, replacing any previous port with the same name.
    pub fn with(mut self, name: impl Into<String>, port: Port) -> Self {
        self.inner.insert(name.into(), port);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, port: Port) {
        self.inner.insert(name.into(), port);
    }

    pub fn kind(&self, name: &str) -> Option<PortKind> {
        self.inner.get(name).map(Port::kind)
    }

    /// Checks that `name` exists with the `expected` direction without
    /// consuming it.
    pub fn check(&self, name: &str, expected: PortKind) -> Result<(), PortError> {
        match self.kind(name) {
            None => Err(PortError::Missing {
                name: name.to_string(),
            }),
            Some(found) if found != expected => Err(PortError::Shape {
                name: name.to_string(),
                expected,
                found,
            }),
            Some(_) => Ok(()),
        }
    }

    pub fn take_outgoing(&mut self, name: &str) -> Result<OutgoingPort, PortError> {
        self.check(name, PortKind::Outgoing)?;
        match self.inner.remove(name) {
            Some(Port::Outgoing(port)) => Ok(port),
            _ => Err(PortError::Missing {
                name: name.to_string(),
            }),
        }
    }

    pub fn take_incoming(&mut self, name: &str) -> Result<IncomingPort, PortError> {
        self.check(name, PortKind::Incoming)?;
        match self.inner.remove(name) {
            Some(Port::Incoming(port)) => Ok(port),
            _ => Err(PortError::Missing {
                name: name.to_string(),
            }),
        }
    }
}

/// An opaque program the driver and the workers run.
///
/// Implementations are expected to spawn whatever they need on the current
/// Tokio runtime and to stop once their incoming port is closed.
pub trait Program: Send + Sync + 'static {
    fn instantiate(&self, args: &Value) -> Result<Ports, ProgramError>;
}

impl<F> Program for F
where
    F: Fn(&Value) -> Result<Ports, ProgramError> + Send + Sync + 'static,
{
    fn instantiate(&self, args: &Value) -> Result<Ports, ProgramError> {
        self(args)
    }
}

/// Resolves a program reference to something that can be instantiated.
pub trait Loader: Send + Sync + 'static {
    fn load(&self, path: &str, module: &str) -> Result<Arc<dyn Program>, ProgramError>;
}

/// In-process [`Loader`] keyed by `(path, module)`.
#[derive(Default, Clone)]
pub struct Library {
    modules: HashMap<(String, String), Arc<dyn Program>>,
}

impl Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(
        mut self,
        path: impl Into<String>,
        module: impl Into<String>,
        program: impl Program,
    ) -> Self {
        self.register(path, module, program);
        self
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        module: impl Into<String>,
        program: impl Program,
    ) {
        self.modules
            .insert((path.into(), module.into()), Arc::new(program));
    }
}

impl Loader for Library {
    fn load(&self, path: &str, module: &str) -> Result<Arc<dyn Program>, ProgramError> {
        self.modules
            .get(&(path.to_string(), module.to_string()))
            .cloned()
            .ok_or_else(|| ProgramError::UnknownModule {
                path: path.to_string(),
                module: module.to_string(),
            })
    }
}

pub mod error {
    //! Program and port related errors

    use super::PortKind;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ProgramError {
        #[error("no module `{module}` found at `{path}`")]
        UnknownModule { path: String, module: String },

        #[error("program failed to initialize: {0}")]
        Init(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum PortError {
        #[error("the program does not have a port called `{name}`")]
        Missing { name: String },

        #[error("port `{name}` is {found}, expected an {expected} port")]
        Shape {
            name: String,
            expected: PortKind,
            found: PortKind,
        },
    }
}
