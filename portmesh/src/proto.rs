//! The frames and raw ports of the mesh protocol.
//!
//! # Protocol
//!
//! Every connection in the mesh is a pair of crossed channels carrying
//! [`Frame`] values; posting a frame whose payload contains a port or an
//! endpoint moves ownership with the message, the way a transferable
//! object moves between browser workers. Delivery is reliable and FIFO
//! per direction, so control frames never overtake the data they follow.
//!
//! Three kinds of connections speak this protocol:
//!
//! - the *global channel* of a worker, used only during bootstrap: the
//!   mesh sends [`Frame::MainPort`] once and [`Frame::StartScheduler`]
//!   once per mesh link, and the worker answers every handled message
//!   with [`Frame::Ack`];
//! - *link ports* between two participants' schedulers, carrying
//!   [`Frame::Call`] dispatches and their acknowledgements;
//! - *data ports*, one per call input or output, carrying [`Frame::Ready`]
//!   handshakes, [`Frame::Data`] chunks, their [`Frame::Ack`]s and the
//!   final [`Frame::Eof`].
//!
//! Flow control is credit based: at most one unacknowledged `data` frame
//! per direction of a data port, and at most one unacknowledged `call`
//! frame per link.

use crossbeam_channel::{unbounded, Receiver, Sender};
use portmesh_bytes::Buffer;
use uuid::Uuid;

use crate::call::FuncId;
use crate::port::MessagePort;

/// One half of a raw transport channel.
///
/// A raw port delivers frames in posting order and buffers them until the
/// receiving side installs handlers, so a port may be posted onward
/// before anyone listens on it without losing messages. Each raw port is
/// owned by at most one endpoint.
#[derive(Debug)]
pub struct RawPort {
    pub(crate) tx: Sender<Frame>,
    pub(crate) rx: Receiver<Frame>,
}

/// Create a crossed pair of raw ports: frames posted on either half are
/// delivered, in order, to the other.
pub fn raw_channel() -> (RawPort, RawPort) {
    let (tx_a, rx_b) = unbounded();
    let (tx_b, rx_a) = unbounded();
    (RawPort { tx: tx_a, rx: rx_a }, RawPort { tx: tx_b, rx: rx_b })
}

/// A single message posted on a raw port.
#[derive(Debug)]
pub enum Frame {
    /// Handshake: the sending endpoint has installed its handlers.
    Ready,
    /// Flow-control acknowledgement of a prior data or call frame.
    Ack,
    /// One binary chunk; ownership of the buffer moves with the frame.
    Data(Buffer),
    /// The sending side will post no more data.
    Eof,
    /// A remote call dispatch; the endpoints move with the frame.
    Call {
        /// Identity of the call while it travels the mesh, for logs.
        id: Uuid,
        /// Registry id of the function to run.
        func: FuncId,
        /// Endpoint the callee reads its input from, when there is one.
        input: Option<MessagePort>,
        /// Endpoint the callee writes its result to.
        output: MessagePort,
    },
    /// Bootstrap: the control port handed to a worker as its first
    /// message.
    MainPort(RawPort),
    /// Bootstrap: start a scheduling loop on the transferred port.
    StartScheduler(RawPort),
}

impl Frame {
    /// Short frame name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Ready => "ready",
            Frame::Ack => "ack",
            Frame::Data(_) => "data",
            Frame::Eof => "eof",
            Frame::Call { .. } => "call",
            Frame::MainPort(_) => "main_port",
            Frame::StartScheduler(_) => "start_scheduler",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_channel_is_crossed_and_ordered() {
        let (a, b) = raw_channel();
        a.tx.send(Frame::Ready).unwrap();
        a.tx.send(Frame::Ack).unwrap();
        b.tx.send(Frame::Eof).unwrap();

        assert_eq!(b.rx.recv().unwrap().name(), "ready");
        assert_eq!(b.rx.recv().unwrap().name(), "ack");
        assert_eq!(a.rx.recv().unwrap().name(), "eof");
    }

    #[test]
    fn frames_buffer_until_received() {
        let (a, b) = raw_channel();
        for _ in 0..16 {
            a.tx.send(Frame::Data(portmesh_bytes::Buffer::from_slice(&[1u8]))).unwrap();
        }
        drop(a);
        // All sixteen chunks survive the sender side going away.
        assert_eq!(b.rx.iter().count(), 16);
    }
}
