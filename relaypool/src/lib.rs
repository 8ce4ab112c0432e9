pub mod bus;
pub mod config;
pub mod message;
pub mod program;
mod queue;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::{
    bus::ListenerBus,
    config::{FaultPolicy, SupervisorConfig},
    message::{Command, Envelope, Inbound},
    program::{Library, Loader, Port, Ports, Program},
    router::error::RoutingError,
    supervisor::{
        error::{SetupError, UsageError},
        Supervisor,
    },
    worker::error::WorkerFault,
};

// Worker identifiers are chosen by the driver, never generated by the pool.
pub type WorkerId = String;
