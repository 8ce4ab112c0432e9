use std::{ops::ControlFlow, sync::Arc};

use serde_json::Value;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::{FaultPolicy, WorkerConfig},
    message::{Command, Envelope, Inbound},
    program::{Batch, IncomingPort, Loader, OutgoingPort},
    WorkerId,
};
use error::{InvalidTransition, WorkerFault};

/// Everything a new worker unit needs, shared by every worker the router
/// spawns.
#[derive(Clone)]
pub(crate) struct Spawner {
    pub loader: Arc<dyn Loader>,
    /// Serialized [`WorkerConfig`], sent verbatim in `INIT_WORKER`.
    pub config: Arc<str>,
    pub events: UnboundedSender<Envelope>,
    pub policy: FaultPolicy,
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Router-side handle on one worker unit.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: WorkerId,
    state: Lifecycle,
    mailbox: UnboundedSender<Envelope>,
    join: JoinHandle<()>,
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

impl WorkerHandle {
    /// Spawns the unit for `id` and posts `INIT_WORKER` followed by `first`.
    ///
    /// Both land in the unit's FIFO mailbox before this returns, so nothing
    /// posted later can overtake the init envelope.
    pub fn spawn(id: WorkerId, spawner: &Spawner, first: Value) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let unit = WorkerUnit::new(id.clone(), spawner, rx);
        let join = tokio::spawn(unit.run());

        let mut handle = Self {
            id,
            state: Lifecycle::Uninitialized,
            mailbox: tx,
            join,
        };

        // The mailbox does the holding: `first` waits behind the init
        // envelope until the unit has answered it.
        handle.post(Envelope::init_worker(spawner.config.to_string()));
        handle.transition(Transition::Spawned);
        handle.post(Envelope::send_to_worker(first));
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Forwards `data` to the unit. Dropped with a warning once the unit is
    /// terminated or gone.
    pub fn send(&mut self, data: Value) {
        if self.state == Lifecycle::Terminated {
            tracing::warn!(worker_id = %self.id, "dropping message for terminated worker");
            return;
        }

        self.post(Envelope::send_to_worker(data));
    }

    fn post(&self, envelope: Envelope) {
        if self.mailbox.send(envelope).is_err() {
            tracing::warn!(worker_id = %self.id, "worker unit is gone, message dropped");
        }
    }

    /// Records that the unit has shown signs of life.
    pub fn acknowledge(&mut self) {
        self.transition(Transition::Acknowledged);
    }

    /// Asks the unit to stop. The mailbox is left to drop with the handle.
    pub fn terminate(&mut self) {
        tracing::debug!(worker_id = %self.id, "terminating worker");
        self.transition(Transition::Terminate);
        self.join.abort();
    }

    fn transition(&mut self, transition: Transition) {
        match self.state.next(transition) {
            Ok(state) => {
                tracing::trace!(worker_id = %self.id, "transitioned to state {state:?}");
                self.state = state;
            }
            Err(e) => tracing::debug!(worker_id = %self.id, "ignoring {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Spawned,
    Acknowledged,
    Terminate,
}

impl Lifecycle {
    //   ┌───────────────┐ spawned  ┌──────────────┐  ack   ┌─────────┐
    //   │ UNINITIALIZED ├──────────► INITIALIZING ├────────►  READY  ├─┐ack
    //   └───────┬───────┘          └──────┬───────┘        └──┬──▲───┘ │
    //           │                         │                   │  └─────┘
    //           │        terminate        ▼        terminate  │
    //           └────────────────► ┌────────────┐ ◄───────────┘
    //                              │ TERMINATED │
    //                              └────────────┘
    pub fn next(self, transition: Transition) -> Result<Lifecycle, InvalidTransition> {
        match (self, transition) {
            (Lifecycle::Uninitialized, Transition::Spawned) => Ok(Lifecycle::Initializing),
            (Lifecycle::Initializing | Lifecycle::Ready, Transition::Acknowledged) => {
                Ok(Lifecycle::Ready)
            }
            (Lifecycle::Terminated, Transition::Terminate) => Err(InvalidTransition {
                state: self,
                transition,
            }),
            (_, Transition::Terminate) => Ok(Lifecycle::Terminated),
            _ => Err(InvalidTransition {
                state: self,
                transition,
            }),
        }
    }
}

struct Loaded {
    incoming: IncomingPort,
    // `None` once the program closed its outgoing port.
    outgoing: Option<OutgoingPort>,
}

/// The isolated execution unit: hosts one program instance and talks to the
/// router only through envelopes.
struct WorkerUnit {
    id: WorkerId,
    instance: Uuid,
    loader: Arc<dyn Loader>,
    mailbox: UnboundedReceiver<Envelope>,
    events: UnboundedSender<Envelope>,
    policy: FaultPolicy,
    program: Option<Loaded>,
}

impl WorkerUnit {
    fn new(id: WorkerId, spawner: &Spawner, mailbox: UnboundedReceiver<Envelope>) -> Self {
        Self {
            id,
            instance: Uuid::new_v4(),
            loader: spawner.loader.clone(),
            mailbox,
            events: spawner.events.clone(),
            policy: spawner.policy,
            program: None,
        }
    }

    #[tracing::instrument(skip(self), fields(worker_id = %self.id, instance = %self.instance))]
    async fn run(mut self) {
        // Let the unit finish loading before it reads its mailbox.
        tokio::task::yield_now().await;

        loop {
            let flow = tokio::select! {
                envelope = self.mailbox.recv() => match envelope {
                    Some(envelope) => {
                        tracing::trace!("received {cmd}", cmd = envelope.cmd);
                        self.handle(envelope).await
                    }
                    None => {
                        tracing::debug!("mailbox closed: shutting down");
                        ControlFlow::Break(())
                    }
                },
                batch = next_batch(&mut self.program) => match batch {
                    Some(batch) => self.report(Envelope::message_from_worker(&self.id, batch)),
                    None => {
                        tracing::debug!("program closed its outgoing port");
                        if let Some(loaded) = self.program.as_mut() {
                            loaded.outgoing = None;
                        }
                        ControlFlow::Continue(())
                    }
                },
            };

            if flow.is_break() {
                break;
            }
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> ControlFlow<()> {
        let result = match envelope.cmd {
            Command::InitWorker => match self.initialize(&envelope.data) {
                Ok(()) => {
                    let flow = self.report(Envelope::initialized(&self.id));
                    // One tick between init and the first work message.
                    tokio::task::yield_now().await;
                    return flow;
                }
                Err(e) => Err(e),
            },
            Command::SendToWorker => self.deliver(envelope.data),
            cmd => Err(WorkerFault::UnrecognizedCommand(cmd)),
        };

        match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(fault) => self.fault(fault),
        }
    }

    fn initialize(&mut self, data: &Value) -> Result<(), WorkerFault> {
        if self.program.is_some() {
            return Err(WorkerFault::AlreadyInitialized);
        }

        let blob = data.as_str().ok_or(WorkerFault::MissingConfig)?;
        let config: WorkerConfig = serde_json::from_str(blob)?;

        let program = self
            .loader
            .load(&config.program_path, &config.module_name)?;
        let mut ports = program.instantiate(&config.args)?;
        let outgoing = ports.take_outgoing(&config.send_port_name)?;
        let incoming = ports.take_incoming(&config.receive_port_name)?;

        tracing::debug!(module = %config.module_name, "program initialized");
        self.program = Some(Loaded {
            incoming,
            outgoing: Some(outgoing),
        });

        Ok(())
    }

    fn deliver(&self, data: Value) -> Result<(), WorkerFault> {
        let loaded = self.program.as_ref().ok_or(WorkerFault::NotInitialized)?;

        loaded
            .incoming
            .send(Inbound::for_worker(data))
            .map_err(|_| WorkerFault::ProgramGone)
    }

    fn fault(&self, fault: WorkerFault) -> ControlFlow<()> {
        match self.policy {
            FaultPolicy::Report => self.report(Envelope::worker_error(&self.id, fault.to_string())),
            FaultPolicy::Crash => {
                tracing::error!("worker crashed: {fault}");
                ControlFlow::Break(())
            }
        }
    }

    fn report(&self, envelope: Envelope) -> ControlFlow<()> {
        match self.events.send(envelope) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => {
                tracing::debug!("router is gone: shutting down");
                ControlFlow::Break(())
            }
        }
    }
}

async fn next_batch(program: &mut Option<Loaded>) -> Option<Batch> {
    match program.as_mut().and_then(|loaded| loaded.outgoing.as_mut()) {
        Some(outgoing) => outgoing.recv().await,
        None => std::future::pending().await,
    }
}

pub mod error {
    //! Worker related errors

    use crate::{
        message::Command,
        program::error::{PortError, ProgramError},
    };

    use super::{Lifecycle, Transition};

    /// Faults raised inside a worker unit. Under the default fault policy they
    /// travel back to the router as `WORKER_ERROR`.
    #[derive(Debug, thiserror::Error)]
    pub enum WorkerFault {
        #[error("INIT_WORKER carried no configuration")]
        MissingConfig,

        #[error("invalid worker configuration: {0}")]
        InvalidConfig(#[from] serde_json::Error),

        #[error(transparent)]
        Program(#[from] ProgramError),

        #[error(transparent)]
        Port(#[from] PortError),

        #[error("worker attempted to initialize twice")]
        AlreadyInitialized,

        #[error("cannot send to a worker that has not been initialized")]
        NotInitialized,

        #[error("worker program is no longer accepting messages")]
        ProgramGone,

        #[error("unrecognized worker command: {0}")]
        UnrecognizedCommand(Command),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    #[error("invalid transition {transition:?} from state {state:?}")]
    pub struct InvalidTransition {
        pub(crate) state: Lifecycle,
        pub(crate) transition: Transition,
    }
}
