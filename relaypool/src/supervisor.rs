use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    bus::ListenerBus,
    config::SupervisorConfig,
    message::Inbound,
    program::{IncomingPort, Loader, OutgoingPort, PortKind},
    queue::SendQueue,
    registry::Registry,
    router::{error::RoutingError, Router},
    worker::Spawner,
};
use error::{SetupError, UsageError};

/// Façade over a pool of workers driven by a single driver program.
///
/// The driver program is loaded and validated on construction. Nothing is
/// routed until [`Supervisor::start`]; sends issued before that are queued
/// and delivered, in order, right after start.
pub struct Supervisor {
    id: Uuid,
    config: SupervisorConfig,
    loader: Arc<dyn Loader>,
    listeners: ListenerBus,

    // Driver's incoming port; every `send` ends up here.
    driver: IncomingPort,

    // Driver's outgoing port, handed to the router on start.
    outgoing: Option<OutgoingPort>,

    // Failed deliveries to `driver`, turned into `close` by the router.
    failures: UnboundedSender<RoutingError>,
    failures_rx: Option<UnboundedReceiver<RoutingError>>,

    queue: Arc<SendQueue>,
    router: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("listeners", &self.listeners)
            .field("started", &self.is_started())
            .field("queue_retired", &self.queue.is_retired())
            .finish_non_exhaustive()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Aborting the router drops the registry, which stops every worker.
        if let Some(router) = &self.router {
            router.abort();
        }
    }
}

impl Supervisor {
    /// Loads the driver program and checks its ports.
    pub fn new(config: SupervisorConfig, loader: Arc<dyn Loader>) -> Result<Self, SetupError> {
        for name in [&config.send_port, &config.receive_port] {
            if name.is_empty() {
                return Err(SetupError::InvalidPortName(name.clone()));
            }
        }

        let program = loader.load(&config.program_path, &config.module_name)?;
        let mut ports = program.instantiate(&config.args)?;

        // Both ports are checked before either is taken so the error names
        // the first problem in config order.
        ports.check(&config.send_port, PortKind::Outgoing)?;
        ports.check(&config.receive_port, PortKind::Incoming)?;
        let outgoing = ports.take_outgoing(&config.send_port)?;
        let driver = ports.take_incoming(&config.receive_port)?;

        let id = Uuid::new_v4();
        let (failures, failures_rx) = mpsc::unbounded_channel();
        tracing::debug!(supervisor_id = %id, module = %config.module_name, "driver loaded");

        Ok(Self {
            id,
            config,
            loader,
            listeners: ListenerBus::new(),
            driver,
            outgoing: Some(outgoing),
            failures,
            failures_rx: Some(failures_rx),
            queue: Arc::new(SendQueue::new()),
            router: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registers `callback` for `topic`, after any callbacks already there.
    pub fn on<F>(&self, topic: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners.on(topic, callback);
    }

    /// Removes every callback registered for `topic`.
    pub fn off(&self, topic: &str) {
        self.listeners.off(topic);
    }

    /// Wires the router to the driver's ports and schedules the drain of
    /// everything sent so far.
    ///
    /// Must be called from within a Tokio runtime, and only once.
    pub fn start(&mut self) -> Result<(), UsageError> {
        if self.is_started() {
            return Err(UsageError::AlreadyStarted);
        }

        tokio::runtime::Handle::try_current().map_err(|_| UsageError::NoRuntime)?;

        let worker_config = serde_json::to_string(&self.config.worker_config())
            .map_err(|e| UsageError::WorkerConfig(e.to_string()))?;
        let (Some(outgoing), Some(failures_rx)) = (self.outgoing.take(), self.failures_rx.take())
        else {
            return Err(UsageError::AlreadyStarted);
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let spawner = Spawner {
            loader: self.loader.clone(),
            config: worker_config.into(),
            events: events_tx,
            policy: self.config.fault_policy,
        };

        let router = Router::new(
            self.id,
            Registry::new(spawner),
            self.listeners.clone(),
            self.driver.clone(),
            events_rx,
            failures_rx,
        );

        self.router = Some(tokio::spawn(router.run(outgoing)));

        let queue = self.queue.clone();
        let driver = self.driver.clone();
        let failures = self.failures.clone();
        tokio::spawn(async move {
            // Deliver after the current phase, never inline with `start`.
            tokio::task::yield_now().await;

            let drained = queue.drain(|data| deliver(&driver, &failures, data));
            tracing::trace!(drained, "send queue drained");
        });

        tracing::debug!(supervisor_id = %self.id, "supervisor started");
        Ok(())
    }

    /// Sends `data` to the driver, or queues it until the supervisor started.
    ///
    /// Never fails: if the driver is gone the message is dropped and the
    /// failure surfaces through the `close` topic.
    pub fn send(&self, data: Value) {
        if let Some(data) = self.queue.defer(data) {
            deliver(&self.driver, &self.failures, data);
        }
    }

    pub fn is_started(&self) -> bool {
        self.router.is_some()
    }

    /// `true` once the router stopped, after `close` was emitted.
    pub fn is_terminated(&self) -> bool {
        self.router.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Waits until the pool terminated. Returns straight away if the
    /// supervisor was never started.
    pub async fn closed(&mut self) {
        let Some(router) = self.router.as_mut() else {
            return;
        };

        if !router.is_finished() {
            if let Err(e) = router.await {
                if e.is_panic() {
                    tracing::error!(supervisor_id = %self.id, "router panicked: {e}");
                }
            }
        }
    }
}

fn deliver(driver: &IncomingPort, failures: &UnboundedSender<RoutingError>, data: Value) {
    if driver.send(Inbound::for_driver(None, data)).is_err() {
        tracing::warn!("driver is no longer accepting messages, message dropped");

        // Only fails once the router stopped, after `close`.
        let _ = failures.send(RoutingError::DriverDisconnected);
    }
}

pub mod error {
    //! Supervisor related errors

    use crate::program::error::{PortError, ProgramError};

    /// Problems loading or validating the driver program.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum SetupError {
        #[error("invalid port name `{0}`")]
        InvalidPortName(String),

        #[error(transparent)]
        Program(#[from] ProgramError),

        #[error(transparent)]
        Port(#[from] PortError),
    }

    /// Misuse of the supervisor API.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum UsageError {
        #[error("attempted to start a supervisor that was already started")]
        AlreadyStarted,

        #[error("supervisor must be started from within a Tokio runtime")]
        NoRuntime,

        #[error("could not serialize the worker configuration: {0}")]
        WorkerConfig(String),
    }
}
