//! The per-participant runtime context and the pipeline primitives.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use crossbeam_channel::Receiver;
use uuid::Uuid;

use crate::call::{Call, FuncId, FunctionRegistry};
use crate::port::MessagePort;
use crate::proto::raw_channel;
use crate::scheduler::Scheduler;
use crate::signal::{CancellationToken, Never};

/// Default wait for the remote end of a pumped pipe to become ready.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// The role a participant plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The thread that builds the mesh and submits work; it never
    /// executes calls itself.
    Main,
    /// A spawned worker; executes at most one call at a time and pushes
    /// the excess back for redistribution.
    Worker,
}

struct NodeShared {
    registry: Arc<FunctionRegistry>,
    scheduler: Scheduler,
    role: Role,
    token: CancellationToken,
    active_calls: AtomicU64,
    redistributions: AtomicU64,
    ready_timeout: Duration,
}

/// Runtime context of one mesh participant.
///
/// Each participant (the main thread and every worker) owns its own
/// scheduler queue, lifecycle token and call accounting; the function
/// registry is shared by all of them, so a registry id resolves to the
/// same function everywhere. Executing functions receive their worker's
/// `Node` and may schedule further calls through it.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Create a standalone runtime context.
    ///
    /// [`Mesh`](crate::Mesh) creates one per participant; constructing one
    /// directly is only needed when driving
    /// [`run_server`](crate::run_server) by hand.
    pub fn new(registry: Arc<FunctionRegistry>, role: Role) -> Node {
        Self::with_ready_timeout(registry, role, DEFAULT_READY_TIMEOUT)
    }

    pub(crate) fn with_ready_timeout(
        registry: Arc<FunctionRegistry>,
        role: Role,
        ready_timeout: Duration,
    ) -> Node {
        Node {
            shared: Arc::new(NodeShared {
                registry,
                scheduler: Scheduler::new(),
                role,
                token: CancellationToken::new(),
                active_calls: AtomicU64::new(0),
                redistributions: AtomicU64::new(0),
                ready_timeout,
            }),
        }
    }

    /// The role of this participant.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Calls currently executing on this participant.
    pub fn active_calls(&self) -> u64 {
        self.shared.active_calls.load(Ordering::SeqCst)
    }

    /// Calls this participant has pushed back for redistribution.
    pub fn redistributions(&self) -> u64 {
        self.shared.redistributions.load(Ordering::SeqCst)
    }

    /// Create a fresh duplex channel: two endpoints such that bytes
    /// written on one are readable on the other.
    pub fn pipe(&self) -> (MessagePort, MessagePort) {
        let (a, b) = raw_channel();
        (MessagePort::bind(self, a), MessagePort::bind(self, b))
    }

    /// Schedule one remote call.
    ///
    /// The call runs on the first idle worker link to pick it up; the
    /// function may itself call [`Node::go`], so chains of streams stay
    /// concurrently active across the mesh. Endpoints are passed through
    /// unchanged; plain readers and writers are pumped through internal
    /// pipes by dedicated threads. Unknown function ids fail
    /// synchronously; later failures reach the caller as an early end of
    /// the output stream plus diagnostics on the executing worker.
    pub fn go(
        &self,
        input: Option<CallInput>,
        output: CallOutput,
        func: FuncId,
    ) -> Result<(), Error> {
        self.shared
            .registry
            .resolve(func)
            .with_context(|| format!("cannot schedule a call to {func}"))?;
        let input = match input {
            None => None,
            Some(CallInput::Port(port)) => Some(port),
            Some(CallInput::Reader(reader)) => Some(self.pump_input(reader)?),
        };
        let output = match output {
            CallOutput::Port(port) => port,
            CallOutput::Writer(writer) => self.pump_output(writer)?,
        };
        let call = Call {
            id: Uuid::new_v4(),
            func,
            input,
            output,
        };
        debug!("scheduling call {} ({})", call.id, func);
        let node = self.clone();
        thread::Builder::new()
            .name(format!("submit-{}", call.id))
            .spawn(move || {
                let id = call.id;
                if let Err(err) = node.shared.scheduler.submit(&node, call) {
                    warn!("submission of call {} aborted: {}", id, err);
                }
            })
            .context("failed to spawn submission thread")?;
        Ok(())
    }

    /// Schedule a linear pipeline of calls.
    ///
    /// Stage `i` writes into an intermediate pipe whose other end is stage
    /// `i + 1`'s input; the last stage writes to `output`. Every stage is
    /// dispatched independently, so the stages of one chain may run on
    /// distinct workers at the same time.
    pub fn go_chain(
        &self,
        input: Option<CallInput>,
        output: CallOutput,
        funcs: &[FuncId],
    ) -> Result<(), Error> {
        let Some((&last, rest)) = funcs.split_last() else {
            bail!("a chain needs at least one function");
        };
        let mut upstream = input;
        for &func in rest {
            let (reader, writer) = self.pipe();
            self.go(upstream, CallOutput::Port(writer), func)?;
            upstream = Some(CallInput::Port(reader));
        }
        self.go(upstream, output, last)
    }

    /// Copy a plain reader into the call through an internal pipe.
    fn pump_input(&self, mut reader: Box<dyn Read + Send>) -> Result<MessagePort, Error> {
        let (remote, mut local) = self.pipe();
        let timeout = self.shared.ready_timeout;
        thread::Builder::new()
            .name(format!("input-pump-{}", local.id()))
            .spawn(move || {
                if let Err(err) = local.wait_remote_ready(timeout) {
                    warn!("input pump: {}", err);
                    return;
                }
                match io::copy(&mut reader, &mut local) {
                    Ok(n) => trace!("input pump: copied {} bytes", n),
                    Err(err) => warn!("input pump: copy failed: {}", err),
                }
                if let Err(err) = local.close() {
                    trace!("input pump: close: {}", err);
                }
            })
            .context("failed to spawn input pump")?;
        Ok(remote)
    }

    /// Copy the call's output into a plain writer through an internal
    /// pipe; the writer is closed (dropped) when the stream ends.
    fn pump_output(&self, mut writer: Box<dyn Write + Send>) -> Result<MessagePort, Error> {
        let (mut local, remote) = self.pipe();
        thread::Builder::new()
            .name(format!("output-pump-{}", local.id()))
            .spawn(move || {
                match io::copy(&mut local, &mut writer) {
                    Ok(n) => trace!("output pump: copied {} bytes", n),
                    Err(err) => warn!("output pump: copy failed: {}", err),
                }
                if let Err(err) = writer.flush() {
                    warn!("output pump: flush failed: {}", err);
                }
            })
            .context("failed to spawn output pump")?;
        Ok(remote)
    }

    pub(crate) fn registry(&self) -> &FunctionRegistry {
        &self.shared.registry
    }

    pub(crate) fn registry_handle(&self) -> Arc<FunctionRegistry> {
        self.shared.registry.clone()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub(crate) fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub(crate) fn cancelled(&self) -> Receiver<Never> {
        self.shared.token.observer()
    }

    pub(crate) fn note_call_accepted(&self) -> u64 {
        self.shared.active_calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn note_call_redistributed(&self) {
        self.shared.active_calls.fetch_sub(1, Ordering::SeqCst);
        self.shared.redistributions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_call_finished(&self) {
        self.shared.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Input of a scheduled call.
pub enum CallInput {
    /// Pass the endpoint through unchanged; ownership moves with the
    /// call.
    Port(MessagePort),
    /// Pump the reader into the call through an internal pipe.
    Reader(Box<dyn Read + Send>),
}

impl From<MessagePort> for CallInput {
    fn from(port: MessagePort) -> CallInput {
        CallInput::Port(port)
    }
}

impl From<Vec<u8>> for CallInput {
    fn from(bytes: Vec<u8>) -> CallInput {
        CallInput::Reader(Box::new(io::Cursor::new(bytes)))
    }
}

/// Output of a scheduled call. A call always has one: results can only be
/// observed through the output stream.
pub enum CallOutput {
    /// Pass the endpoint through unchanged; ownership moves with the
    /// call.
    Port(MessagePort),
    /// Pump the call's output into the writer through an internal pipe.
    Writer(Box<dyn Write + Send>),
}

impl From<MessagePort> for CallOutput {
    fn from(port: MessagePort) -> CallOutput {
        CallOutput::Port(port)
    }
}
