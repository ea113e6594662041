//! Call records, the function registry and the dispatch path.

use std::fmt;
use std::thread;

use anyhow::Error;
use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::error::PortError;
use crate::node::{Node, Role};
use crate::port::MessagePort;
use crate::proto::Frame;

/// Identifier of a registered function: the only representation of a
/// function that ever crosses a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub(crate) u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Signature of every remotely callable function.
///
/// `input` is `None` when the call was scheduled without an input stream.
/// The function should close `output` once it stops writing; an output
/// that is still open when the function returns is acknowledged and then
/// closed on its behalf. Errors are logged on the executing worker and
/// reach the caller as an early end of the output stream.
pub type RemoteFn =
    fn(&Node, Option<&mut MessagePort>, &mut MessagePort) -> Result<(), Error>;

/// Startup-time table mapping small integer ids to functions.
///
/// Every participant of a mesh shares one registry, which is what makes
/// an id resolvable to the same function on every worker. Functions are
/// registered before the mesh starts and never removed.
#[derive(Default)]
pub struct FunctionRegistry {
    funcs: Vec<RemoteFn>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> FunctionRegistry {
        FunctionRegistry { funcs: Vec::new() }
    }

    /// Register a function and return its id.
    pub fn register(&mut self, func: RemoteFn) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(func);
        id
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    /// Whether no functions have been registered.
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub(crate) fn resolve(&self, id: FuncId) -> Result<RemoteFn, PortError> {
        self.funcs
            .get(id.0 as usize)
            .copied()
            .ok_or(PortError::UnknownFunction(id))
    }
}

/// An in-flight unit of work travelling through the mesh.
///
/// Once a call has been posted, its endpoints belong to the receiver; a
/// call dropped in transit closes them, which surfaces downstream as an
/// early end of stream.
pub(crate) struct Call {
    pub id: Uuid,
    pub func: FuncId,
    pub input: Option<MessagePort>,
    pub output: MessagePort,
}

impl Call {
    pub fn into_frame(self) -> Frame {
        Frame::Call {
            id: self.id,
            func: self.func,
            input: self.input,
            output: self.output,
        }
    }
}

/// How long a busy worker waits before pushing a call back into its
/// queue, so an all-busy mesh circulates calls instead of spinning.
const RESCHEDULE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(1);

/// Dispatch a call frame received on a link.
///
/// Runs on the link's handler thread, so it never blocks: execution
/// happens on a fresh thread, and a redistribution hands the blocking
/// rendezvous to a detached thread as well. The link is acknowledged as
/// soon as this side has taken responsibility for the call (dispatched
/// it or decided to push it back), which frees the link for the next
/// call and keeps link acknowledgements independent of each other.
pub(crate) fn dispatch(node: &Node, call: Call, link: &Sender<Frame>) {
    if node.role() != Role::Worker {
        warn!(
            "dropping call {} delivered to a non-worker participant",
            call.id
        );
        return;
    }
    let active = node.note_call_accepted();
    if active > 1 {
        // Admission control: one call per worker. Push the excess back
        // through the local queue so the first idle link steals it.
        node.note_call_redistributed();
        debug!(
            "worker busy ({} active): rescheduling call {}",
            active, call.id
        );
        let _ = link.send(Frame::Ack);
        let node = node.clone();
        let id = call.id;
        thread::Builder::new()
            .name(format!("resched-{id}"))
            .spawn(move || {
                thread::sleep(RESCHEDULE_BACKOFF);
                if let Err(err) = node.scheduler().submit(&node, call) {
                    warn!("dropping rescheduled call {}: {}", id, err);
                }
            })
            .expect("failed to spawn reschedule thread");
        return;
    }
    let func = match node.registry().resolve(call.func) {
        Ok(func) => func,
        Err(err) => {
            error!("cannot dispatch call {}: {}", call.id, err);
            node.note_call_finished();
            let _ = link.send(Frame::Ack);
            let _ = call.output.close();
            return;
        }
    };
    if let Some(input) = &call.input {
        // Tell the caller its input now has an attached consumer.
        input.notify_ready();
    }
    let _ = link.send(Frame::Ack);
    let node = node.clone();
    thread::Builder::new()
        .name(format!("call-{}", call.id))
        .spawn(move || run_call(node, call, func))
        .expect("failed to spawn call thread");
}

/// Execute a dispatched call on its own thread.
fn run_call(node: Node, call: Call, func: RemoteFn) {
    let Call {
        id,
        func: func_id,
        mut input,
        mut output,
    } = call;
    defer! {
        node.note_call_finished();
    }
    debug!("running call {} ({})", id, func_id);
    match func(&node, input.as_mut(), &mut output) {
        Ok(()) => trace!("call {} finished", id),
        Err(err) => warn!("call {} ({}) failed: {:#}", id, func_id, err),
    }
    // Completion acknowledgement on the output; an output the function
    // already closed implies it.
    output.ack_unless_closed();
    // Dropping the endpoints closes whatever the function left open.
}
