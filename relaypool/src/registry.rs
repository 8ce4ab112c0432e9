//! Worker handles keyed by their caller-supplied identifier.
//!
//! Workers are created on first reference and only ever released all at once
//! by [`Registry::terminate_all`], after which the registry refuses to create
//! new workers.

use std::collections::{btree_map::Entry, BTreeMap};

use serde_json::Value;

use crate::{
    worker::{Lifecycle, Spawner, WorkerHandle},
    WorkerId,
};
use error::RegistryError;

/// What [`Registry::dispatch`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Worker was unknown: spawned, initialized, and handed the message.
    Spawned,
    /// Worker already existed: message forwarded to its mailbox.
    Forwarded,
}

#[derive(Debug)]
pub(crate) struct Registry {
    spawner: Spawner,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    closed: bool,
}

impl Registry {
    pub fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            workers: BTreeMap::new(),
            closed: false,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<Lifecycle> {
        self.workers.get(id).map(WorkerHandle::state)
    }

    /// Sends `data` to worker `id`, creating the worker first if needed.
    pub fn dispatch(&mut self, id: &str, data: Value) -> Result<Dispatch, RegistryError> {
        if self.closed {
            return Err(RegistryError::Closed);
        }

        match self.workers.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().send(data);
                Ok(Dispatch::Forwarded)
            }
            Entry::Vacant(entry) => {
                tracing::debug!(worker_id = id, "spawning worker");
                let handle = WorkerHandle::spawn(id.to_string(), &self.spawner, data);
                entry.insert(handle);
                Ok(Dispatch::Spawned)
            }
        }
    }

    /// Marks worker `id` as alive. Unknown identifiers are ignored.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(handle) => {
                handle.acknowledge();
                true
            }
            None => false,
        }
    }

    /// Stops a single worker but keeps its entry, so the identifier is not
    /// re-created by a later send.
    pub fn terminate(&mut self, id: &str) {
        if let Some(handle) = self.workers.get_mut(id) {
            handle.terminate();
        }
    }

    /// Stops and releases every worker, then closes the registry. Returns the
    /// number of workers that were stopped.
    pub fn terminate_all(&mut self) -> usize {
        self.closed = true;

        let workers = std::mem::take(&mut self.workers);
        let count = workers.len();

        for (_, mut handle) in workers {
            if handle.state() != Lifecycle::Terminated {
                handle.terminate();
            }
            tracing::trace!(worker_id = handle.id(), "worker released");
        }

        count
    }
}

pub mod error {
    //! Registry related errors

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum RegistryError {
        /// The pool was terminated; no new workers may be created.
        #[error("worker registry is closed")]
        Closed,
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::FaultPolicy,
        message::{Command, Envelope},
        testing::{self, Harness},
    };

    fn registry(harness: &Harness) -> (Registry, mpsc::UnboundedReceiver<Envelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let spawner = Spawner {
            loader: harness.loader(),
            config: testing::worker_config().into(),
            events,
            policy: FaultPolicy::Report,
        };

        (Registry::new(spawner), rx)
    }

    #[tokio::test]
    async fn creates_on_first_reference_only() {
        let harness = Harness::new();
        let (mut registry, mut events) = registry(&harness);

        assert_eq!(registry.dispatch("w1", json!(1)), Ok(Dispatch::Spawned));
        assert_eq!(registry.dispatch("w1", json!(2)), Ok(Dispatch::Forwarded));
        assert!(registry.contains("w1"));
        assert_eq!(registry.state("w1"), Some(Lifecycle::Initializing));

        let initialized = testing::recv(&mut events).await;
        assert_eq!(initialized.cmd, Command::Initialized);
        assert!(registry.acknowledge("w1"));
        assert!(!registry.acknowledge("nobody"));
        assert_eq!(registry.state("w1"), Some(Lifecycle::Ready));

        for expected in [1, 2] {
            let echoed = testing::recv(&mut events).await;
            assert_eq!(echoed.data[0]["data"], json!(expected));
        }
        assert_eq!(harness.instances(), 1);
    }

    #[tokio::test]
    async fn terminate_all_closes_the_registry() {
        let harness = Harness::new();
        let (mut registry, _events) = registry(&harness);

        registry.dispatch("w1", json!(1)).unwrap();
        registry.dispatch("w2", json!(1)).unwrap();
        harness.wait_for_instances(2).await;

        assert_eq!(registry.terminate_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch("w3", json!(1)), Err(RegistryError::Closed));

        harness.wait_for_stopped(2).await;
    }

    #[tokio::test]
    async fn terminated_worker_is_not_recreated() {
        let harness = Harness::new();
        let (mut registry, _events) = registry(&harness);

        registry.dispatch("w1", json!(1)).unwrap();
        registry.terminate("w1");

        assert_eq!(registry.dispatch("w1", json!(2)), Ok(Dispatch::Forwarded));
        assert!(registry.contains("w1"));
        assert_eq!(registry.state("w1"), Some(Lifecycle::Terminated));
    }
}
