use std::sync::Arc;

use anyhow::Context;
use relaypool::{
    bus,
    program::{error::ProgramError, Batch, IncomingPort, OutgoingPort},
    Inbound, Library, Port, Ports, Program, Supervisor, SupervisorConfig,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROGRAM: &str = "echo";
const MODULE: &str = "Example";

/// Plays both roles: the driver, and every worker it spawns.
#[derive(Debug)]
struct Example;

impl Program for Example {
    fn instantiate(&self, _args: &Value) -> Result<Ports, ProgramError> {
        let (outgoing, batches) = OutgoingPort::channel();
        let (incoming, mut inbound) = IncomingPort::channel();

        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if batches.send(respond(message)).is_err() {
                    break;
                }
            }
        });

        Ok(Ports::new()
            .with("send", Port::Outgoing(outgoing))
            .with("receive", Port::Incoming(incoming)))
    }
}

fn respond(message: Inbound) -> Batch {
    match message {
        // Worker role: whatever we send out goes back to the driver.
        Inbound {
            for_worker: true,
            data,
            ..
        } => vec![json!(format!("hello, {data}!"))],

        // Driver role, answer relayed from one of our workers.
        Inbound {
            worker_id: Some(id),
            data,
            ..
        } => vec![json!({"cmd": "EMIT", "data": format!("worker[{id}] says {data}")})],

        // Driver role, message from the embedder.
        Inbound { data, .. } => match data["msgType"].as_str() {
            Some("echo") => vec![json!({"cmd": "EMIT", "data": data["data"]})],
            Some("spawn") => vec![json!({
                "cmd": "SEND_TO_WORKER",
                "workerId": data["data"],
                "data": "greet",
            })],
            Some("quit") => vec![json!({"cmd": "TERMINATE"})],
            _ => vec![json!({"cmd": "EMIT", "data": format!("unknown message {data}")})],
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("starting echo example...");

    let library = Library::new().with_module(PROGRAM, MODULE, Example);
    let mut supervisor = Supervisor::new(SupervisorConfig::new(PROGRAM, MODULE), Arc::new(library))
        .context("error loading the driver program")?;

    supervisor.on(bus::EMIT, |msg: &Value| println!("[supervisor]: {msg}"));
    supervisor.on(bus::CLOSE, |msg: &Value| println!("Closed with message: {msg}"));

    // Queued until the supervisor has started.
    supervisor.send(json!({"msgType": "echo", "data": "Spawning some workers..."}));
    for _ in 0..3 {
        supervisor.send(json!({"msgType": "spawn", "data": uuid::Uuid::new_v4().to_string()}));
    }

    supervisor.start()?;

    println!("Enter a line to echo it, or `quit` to stop: ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line.context("error reading stdin")? {
                Some(line) if line.trim() == "quit" => supervisor.send(json!({"msgType": "quit"})),
                Some(line) => supervisor.send(json!({"msgType": "echo", "data": line})),
                None => {
                    stdin_open = false;
                    supervisor.send(json!({"msgType": "quit"}));
                }
            },
            () = supervisor.closed() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
