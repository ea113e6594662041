//! First-idle-link scheduling over a rendezvous queue.

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::call::Call;
use crate::error::PortError;
use crate::node::Node;
use crate::port::MessagePort;

/// The rendezvous queue of pending calls shared by every outgoing link
/// loop of one participant.
///
/// The queue has no capacity: a submission parks until some loop is idle
/// enough to take it, and exactly one loop receives each call. Placement
/// is therefore "first idle link wins" without any central decision.
pub(crate) struct Scheduler {
    tx: Sender<Call>,
    rx: Receiver<Call>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let (tx, rx) = bounded(0);
        Scheduler { tx, rx }
    }

    /// Hand a call to the first idle link loop.
    ///
    /// Blocks until a loop takes the call; fails when the node shuts down
    /// first, in which case the call is dropped and its endpoints close.
    pub fn submit(&self, node: &Node, call: Call) -> Result<(), PortError> {
        if node.is_cancelled() {
            return Err(PortError::Cancelled);
        }
        let cancelled = node.cancelled();
        select! {
            send(self.tx, call) -> sent => sent.map_err(|_| PortError::Cancelled),
            recv(cancelled) -> _ => Err(PortError::Cancelled),
        }
    }

    /// Scheduling loop bound to one outgoing link.
    ///
    /// Each dequeued call is posted on the port, endpoints moving with the
    /// frame, and the loop then waits for the link acknowledgement (the
    /// remote side dispatched the call, or took it over for
    /// redistribution) before taking the next call. Cancelling the port or
    /// the node stops the loop on its next iteration; a call already
    /// posted runs to completion regardless.
    pub fn run_on_port(&self, node: &Node, port: MessagePort) -> Result<(), PortError> {
        let cancelled = node.cancelled();
        let port_cancelled = port.cancelled();
        loop {
            select! {
                recv(self.rx) -> call => {
                    let call = call.map_err(|_| PortError::Cancelled)?;
                    let id = call.id;
                    trace!("link {}: posting call {}", port.id(), id);
                    port.post(call.into_frame())?;
                    port.wait_ack()?;
                    trace!("link {}: call {} accepted remotely", port.id(), id);
                }
                recv(port_cancelled) -> _ => return Err(PortError::Cancelled),
                recv(cancelled) -> _ => return Err(PortError::Cancelled),
            }
        }
    }
}
