//! Worker threads and the worker-side server loop.
//!
//! A worker is a thread running [`run_server`] with its own [`Node`]; the
//! registry it receives is the same one every other participant holds,
//! which is the identical-code requirement that makes function ids
//! portable. The mesh talks to a worker over a dedicated pair of global
//! channels: commands flow in ([`Frame::MainPort`],
//! [`Frame::StartScheduler`]) and every message the worker posts back is
//! treated as an acknowledgement.
//!
//! There is no forced termination: a worker stops when its command
//! channel disconnects or its node is cancelled, closing its command
//! ports on the way out.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Error};
use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::call::FunctionRegistry;
use crate::node::{Node, Role};
use crate::port::MessagePort;
use crate::proto::Frame;

/// Handle owned by the mesh for one spawned worker.
pub(crate) struct WorkerHandle {
    id: Uuid,
    node: Node,
    commands: Option<Sender<Frame>>,
    acks: Receiver<Frame>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Worker id, used in logs and status reports.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The worker's runtime context, observed for status reports.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Post a bootstrap command to the worker's global channel.
    pub fn post(&self, frame: Frame) -> Result<(), Error> {
        match &self.commands {
            Some(commands) if commands.send(frame).is_ok() => Ok(()),
            _ => bail!("worker {} is no longer reachable", self.id),
        }
    }

    /// Wait for the next message from the worker; anything it posts
    /// counts as an acknowledgement.
    pub fn wait_ack(&self, timeout: Duration, what: &'static str) -> Result<(), Error> {
        match self.acks.recv_timeout(timeout) {
            Ok(_) => Ok(()),
            Err(RecvTimeoutError::Timeout) => bail!(
                "timed out after {:?} waiting for {} from worker {}",
                timeout,
                what,
                self.id
            ),
            Err(RecvTimeoutError::Disconnected) => {
                bail!("worker {} exited while waiting for {}", self.id, what)
            }
        }
    }

    /// Stop the worker: cancel its node and disconnect its command
    /// channel. The server loop winds down on its own.
    pub fn terminate(&mut self) {
        debug!("terminating worker {}", self.id);
        self.node.cancel();
        self.commands = None;
    }

    /// Join the worker thread after termination.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("worker {} thread panicked", self.id);
            }
        }
    }
}

/// Spawn a worker thread running [`run_server`] and return its handle.
pub(crate) fn spawn(
    registry: Arc<FunctionRegistry>,
    ready_timeout: Duration,
) -> Result<WorkerHandle, Error> {
    let id = Uuid::new_v4();
    let node = Node::with_ready_timeout(registry, Role::Worker, ready_timeout);
    let (command_tx, command_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    let server_node = node.clone();
    let join = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || {
            if let Err(err) = run_server(server_node, command_rx, ack_tx) {
                error!("worker {} server loop failed: {:#}", id, err);
            }
        })
        .context("failed to spawn worker thread")?;
    Ok(WorkerHandle {
        id,
        node,
        commands: Some(command_tx),
        acks: ack_rx,
        join: Some(join),
    })
}

/// Worker-side entry point: serve bootstrap commands until the mesh
/// disconnects or the node is cancelled.
///
/// The first `main_port` message installs the command channel from the
/// main thread (a worker never schedules calls back to the main thread);
/// every later `start_scheduler` message starts one scheduling loop
/// towards another participant. Each handled message, and the boot
/// itself, is acknowledged on the global channel.
pub fn run_server(
    node: Node,
    commands: Receiver<Frame>,
    acks: Sender<Frame>,
) -> Result<(), Error> {
    debug!("worker started");
    acks.send(Frame::Ack)
        .context("mesh went away before the worker booted")?;
    let cancelled = node.cancelled();
    let mut command_ports = Vec::new();
    loop {
        select! {
            recv(commands) -> frame => match frame {
                Ok(Frame::MainPort(raw)) => {
                    let port = MessagePort::bind(&node, raw);
                    debug!("command channel {} installed", port.id());
                    command_ports.push(port);
                    let _ = acks.send(Frame::Ack);
                }
                Ok(Frame::StartScheduler(raw)) => {
                    let port = MessagePort::bind(&node, raw);
                    let loop_node = node.clone();
                    thread::Builder::new()
                        .name(format!("link-{}", port.id()))
                        .spawn(move || {
                            let id = port.id();
                            if let Err(err) =
                                loop_node.scheduler().run_on_port(&loop_node, port)
                            {
                                debug!("scheduling loop on link {} stopped: {}", id, err);
                            }
                        })
                        .context("failed to spawn link scheduler thread")?;
                    let _ = acks.send(Frame::Ack);
                }
                Ok(other) => warn!("ignoring unexpected {} command", other.name()),
                Err(_) => break,
            },
            recv(cancelled) -> _ => break,
        }
    }
    for port in command_ports {
        let _ = port.close();
    }
    debug!("worker stopped");
    Ok(())
}
