//! Single dispatch point for every envelope in the pool.
//!
//! The router owns the worker registry and runs on one task, handling one
//! envelope at a time from the driver's outgoing port, the shared worker
//! event channel, or the supervisor's delivery failures. It stops for good on `TERMINATE` or on the first
//! routing error, terminating every worker and emitting `close` exactly once.

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::{
    bus::{self, ListenerBus},
    message::{Command, Envelope, Inbound, RawEnvelope},
    program::{Batch, IncomingPort, OutgoingPort},
    registry::{Dispatch, Registry},
    worker::Lifecycle,
};
use error::RoutingError;

/// Outcome of handling a single driver envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

#[derive(Debug)]
pub(crate) struct Router {
    supervisor_id: Uuid,
    registry: Registry,
    listeners: ListenerBus,
    driver: IncomingPort,
    events: UnboundedReceiver<Envelope>,
    // Sends the supervisor could not hand to the driver.
    failures: UnboundedReceiver<RoutingError>,
}

impl Router {
    pub fn new(
        supervisor_id: Uuid,
        registry: Registry,
        listeners: ListenerBus,
        driver: IncomingPort,
        events: UnboundedReceiver<Envelope>,
        failures: UnboundedReceiver<RoutingError>,
    ) -> Self {
        Self {
            supervisor_id,
            registry,
            listeners,
            driver,
            events,
            failures,
        }
    }

    #[tracing::instrument(skip_all, fields(supervisor_id = %self.supervisor_id))]
    pub async fn run(mut self, mut outgoing: OutgoingPort) {
        tracing::debug!("router started");

        loop {
            // Driver batches go first so a TERMINATE is never starved by
            // chatty workers.
            let flow = tokio::select! {
                biased;

                batch = outgoing.recv() => match batch {
                    Some(batch) => self.handle_batch(batch),
                    None => Err(RoutingError::DriverDisconnected),
                },
                Some(e) = self.failures.recv() => Err(e),
                Some(envelope) = self.events.recv() => self.handle_worker(envelope),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Terminate) => {
                    self.shutdown(None);
                    break;
                }
                Err(e) => {
                    self.shutdown(Some(e));
                    break;
                }
            }
        }

        tracing::debug!("router stopped");
    }

    /// Handles a driver batch in order, abandoning the rest of it at the first
    /// error or `TERMINATE`. Work already done is not rolled back.
    fn handle_batch(&mut self, batch: Batch) -> Result<Flow, RoutingError> {
        tracing::trace!(size = batch.len(), "received batch from driver");

        for raw in batch {
            if self.handle_driver(RawEnvelope::parse(raw))? == Flow::Terminate {
                return Ok(Flow::Terminate);
            }
        }

        Ok(Flow::Continue)
    }

    fn handle_driver(&mut self, raw: RawEnvelope) -> Result<Flow, RoutingError> {
        let cmd = raw
            .command()
            .map_err(|e| RoutingError::UnrecognizedCommand(e.0))?;

        match cmd {
            Command::Terminate => Ok(Flow::Terminate),
            Command::Emit => {
                self.listeners.emit(bus::EMIT, &raw.data);
                Ok(Flow::Continue)
            }
            Command::SendToWorker => {
                let id = match &raw.worker_id {
                    Value::String(id) if !id.is_empty() => id.as_str(),
                    other => {
                        return Err(RoutingError::InvalidWorkerId {
                            worker_id: other.to_string(),
                            data: raw.data.to_string(),
                        })
                    }
                };

                match self.registry.dispatch(id, raw.data)? {
                    Dispatch::Spawned => tracing::debug!(worker_id = id, "created worker"),
                    Dispatch::Forwarded => tracing::trace!(worker_id = id, "forwarded to worker"),
                }
                Ok(Flow::Continue)
            }
            cmd => Err(RoutingError::UnrecognizedCommand(cmd.to_string())),
        }
    }

    fn handle_worker(&mut self, envelope: Envelope) -> Result<Flow, RoutingError> {
        let Some(id) = envelope.worker_id else {
            tracing::warn!(cmd = %envelope.cmd, "dropping worker envelope without a worker id");
            return Ok(Flow::Continue);
        };

        match self.registry.state(&id) {
            None => {
                tracing::debug!(worker_id = %id, "dropping envelope from released worker");
                return Ok(Flow::Continue);
            }
            Some(Lifecycle::Terminated) => {
                tracing::debug!(worker_id = %id, "dropping envelope from terminated worker");
                return Ok(Flow::Continue);
            }
            Some(_) => {}
        }

        match envelope.cmd {
            Command::Initialized => {
                self.registry.acknowledge(&id);
            }
            Command::WorkerError => {
                self.registry.acknowledge(&id);

                let error = match &envelope.data {
                    Value::String(error) => error.clone(),
                    other => other.to_string(),
                };
                tracing::error!(worker_id = %id, "error in worker: {error}");
                self.listeners.emit(
                    bus::WORKER_ERROR,
                    &json!({"workerId": id, "error": error}),
                );
            }
            Command::MessageFromWorker => {
                self.registry.acknowledge(&id);

                let messages = match envelope.data {
                    Value::Null => {
                        tracing::error!(worker_id = %id, "received an empty message from worker");
                        return Ok(Flow::Continue);
                    }
                    Value::Array(messages) => messages,
                    message => vec![message],
                };

                for data in messages {
                    // Tag with the worker id so the driver knows who answered.
                    self.driver
                        .send(Inbound::for_driver(Some(id.clone()), data))
                        .map_err(|_| RoutingError::DriverDisconnected)?;
                }
            }
            cmd => {
                // Fatal for this worker only; the rest of the pool keeps going.
                let e = RoutingError::UnrecognizedWorkerCommand {
                    worker_id: id.clone(),
                    cmd: cmd.to_string(),
                };
                tracing::error!("{e}");
                self.registry.terminate(&id);
            }
        }

        Ok(Flow::Continue)
    }

    fn shutdown(&mut self, reason: Option<RoutingError>) {
        let stopped = self.registry.terminate_all();

        let payload = match reason {
            None => {
                tracing::debug!(workers = stopped, "pool terminated");
                Value::Null
            }
            Some(e) => {
                tracing::error!(workers = stopped, "pool terminated: {e}");
                Value::String(e.to_string())
            }
        };

        self.listeners.emit(bus::CLOSE, &payload);
    }
}

pub mod error {
    //! Routing related errors

    use crate::registry::error::RegistryError;

    /// Errors that are fatal to the whole pool, except
    /// [`RoutingError::UnrecognizedWorkerCommand`] which only ends the worker
    /// that sent it.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RoutingError {
        #[error("supervisor attempted to handle unrecognized command: {0}")]
        UnrecognizedCommand(String),

        #[error("cannot send message {data} to workerId `{worker_id}`")]
        InvalidWorkerId { worker_id: String, data: String },

        #[error("received unrecognized command from worker[{worker_id}]: {cmd}")]
        UnrecognizedWorkerCommand { worker_id: String, cmd: String },

        #[error("driver disconnected")]
        DriverDisconnected,

        #[error(transparent)]
        Registry(#[from] RegistryError),
    }
}
