//! Scripted program used across the crate's tests.
//!
//! Every instance is a worker that echoes each inbound message back as a
//! one-message batch, unless the harness was built with
//! [`Harness::with_driver`], in which case the first instance is the driver
//! and its port ends are handed to the test instead.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    config::SupervisorConfig,
    message::Inbound,
    program::{
        error::ProgramError, Batch, IncomingPort, Library, Loader, OutgoingPort, Port, Ports,
        Program,
    },
};

pub(crate) const PATH: &str = "harness.wasm";
pub(crate) const MODULE: &str = "Harness";

const DEADLINE: Duration = Duration::from_secs(5);

pub(crate) fn config() -> SupervisorConfig {
    SupervisorConfig::new(PATH, MODULE)
}

pub(crate) fn worker_config() -> String {
    serde_json::to_string(&config().worker_config()).unwrap()
}

/// Driver-side ends kept by the test: push batches as the driver, observe what
/// the core pushes into the driver.
#[derive(Debug)]
pub(crate) struct DriverEnds {
    pub batches: UnboundedSender<Batch>,
    pub inbound: UnboundedReceiver<Inbound>,
}

#[derive(Debug, Default)]
struct State {
    with_driver: bool,
    fail_workers: AtomicBool,
    instances: AtomicUsize,
    stopped: AtomicUsize,
    driver: Mutex<Option<DriverEnds>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Harness {
    state: Arc<State>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State::default()),
        }
    }

    pub fn with_driver() -> Self {
        Self {
            state: Arc::new(State {
                with_driver: true,
                ..State::default()
            }),
        }
    }

    pub fn loader(&self) -> Arc<dyn Loader> {
        Arc::new(self.library())
    }

    pub fn library(&self) -> Library {
        Library::new().with_module(PATH, MODULE, self.clone())
    }

    /// Makes every later worker instance fail to initialize.
    pub fn fail_workers(&self) {
        self.state.fail_workers.store(true, Ordering::SeqCst);
    }

    pub fn driver(&self) -> DriverEnds {
        self.state
            .driver
            .lock()
            .unwrap()
            .take()
            .expect("driver was not instantiated")
    }

    /// Instantiations so far, driver included.
    pub fn instances(&self) -> usize {
        self.state.instances.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait_for_instances(&self, n: usize) {
        within(async {
            while self.instances() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    pub async fn wait_for_stopped(&self, n: usize) {
        within(async {
            while self.stopped() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }
}

impl Program for Harness {
    fn instantiate(&self, _args: &Value) -> Result<Ports, ProgramError> {
        let (outgoing, batches) = OutgoingPort::channel();
        let (incoming, mut inbound) = IncomingPort::channel();
        let ports = Ports::new()
            .with("send", Port::Outgoing(outgoing))
            .with("receive", Port::Incoming(incoming));

        let first = self.state.instances.load(Ordering::SeqCst) == 0;
        if self.state.with_driver && first {
            self.state.instances.fetch_add(1, Ordering::SeqCst);
            *self.state.driver.lock().unwrap() = Some(DriverEnds { batches, inbound });
            return Ok(ports);
        }

        if self.state.fail_workers.load(Ordering::SeqCst) {
            return Err(ProgramError::Init("harness told to fail".to_string()));
        }

        self.state.instances.fetch_add(1, Ordering::SeqCst);
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let echo = serde_json::to_value(&message).unwrap();
                if batches.send(vec![echo]).is_err() {
                    break;
                }
            }
            state.stopped.fetch_add(1, Ordering::SeqCst);
        });

        Ok(ports)
    }
}

/// Next value from `rx`, failing the test if nothing arrives in time.
pub(crate) async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    within(rx.recv()).await.expect("channel closed")
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(DEADLINE, future)
        .await
        .expect("timed out")
}
