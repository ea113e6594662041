//! Duplex byte streams over raw frame ports.
//!
//! A [`MessagePort`] is one side of a reliable, ordered byte stream. Each
//! endpoint runs a handler thread that demultiplexes incoming frames:
//! `ready` opens the remote-ready gate, `ack` grants a flow-control
//! credit, `data` is copied into the receive queue and acknowledged,
//! `eof` closes the reading side, and `call` enters the dispatch path of
//! the owning node.
//!
//! Writes are credit gated: a write posts exactly one `data` frame and
//! blocks until the peer acknowledges it, so at most one chunk per
//! direction is ever in flight. The receive queue is a rendezvous, so the
//! acknowledgement is only emitted once the local reader has taken the
//! chunk; a slow reader therefore holds the remote writer back.
//!
//! Close notifies the peer with `eof`, cancels the endpoint's lifecycle
//! token (which stops scheduling loops pinned to the port) and releases
//! the handler thread. Dropping an endpoint that was never closed closes
//! it, so teardown is deterministic.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use portmesh_bytes::Buffer;
use uuid::Uuid;

use crate::call::{self, Call};
use crate::error::PortError;
use crate::node::Node;
use crate::proto::{Frame, RawPort};
use crate::signal::{AckGate, CancellationToken, Never, Signal};

/// One side of a duplex byte stream over a raw port.
///
/// An endpoint supports exactly one reader and one writer (`Read` and
/// `Write` take `&mut self`), may be closed from either side, and moves
/// as a whole when posted inside a call frame: whoever receives the frame
/// owns the endpoint from then on.
pub struct MessagePort {
    shared: Arc<PortShared>,
}

struct PortShared {
    id: Uuid,
    tx: Sender<Frame>,
    remote_ready: Signal,
    acks: AckGate,
    token: CancellationToken,
    remote_closed: AtomicBool,
    local_closed: AtomicBool,
    reader: Mutex<ReadHalf>,
    write_lock: Mutex<()>,
}

struct ReadHalf {
    queue: Receiver<Bytes>,
    pending: Bytes,
}

impl PortShared {
    /// Close this side: mark it closed, notify the peer with `eof` and
    /// cancel the lifecycle token.
    fn close_local(&self) -> Result<(), PortError> {
        if self.remote_closed.load(Ordering::SeqCst) {
            return Err(PortError::EndOfStream);
        }
        if self.local_closed.swap(true, Ordering::SeqCst) {
            return Err(PortError::ClosedPipe);
        }
        let _ = self.tx.send(Frame::Eof);
        self.token.cancel();
        trace!("port {}: closed locally", self.id);
        Ok(())
    }
}

impl MessagePort {
    /// Wrap a raw port: install the handler thread and announce readiness
    /// to the peer.
    pub(crate) fn bind(node: &Node, raw: RawPort) -> MessagePort {
        let RawPort { tx, rx } = raw;
        let (data_tx, data_rx) = bounded::<Bytes>(0);
        let shared = Arc::new(PortShared {
            id: Uuid::new_v4(),
            tx,
            remote_ready: Signal::new(),
            acks: AckGate::new(),
            token: CancellationToken::new(),
            remote_closed: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
            reader: Mutex::new(ReadHalf {
                queue: data_rx,
                pending: Bytes::new(),
            }),
            write_lock: Mutex::new(()),
        });
        let listener = Listener {
            shared: shared.clone(),
            node: node.clone(),
            rx,
            data_tx,
            cancelled: shared.token.observer(),
        };
        thread::Builder::new()
            .name(format!("port-{}", shared.id))
            .spawn(move || listener.run())
            .expect("failed to spawn port handler thread");
        // Tell the peer our handlers are installed.
        let _ = shared.tx.send(Frame::Ready);
        MessagePort { shared }
    }

    /// Identity of this endpoint, used in logs.
    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Block until the remote endpoint has installed its handlers.
    pub fn wait_remote_ready(&self, timeout: Duration) -> Result<(), PortError> {
        if self.shared.remote_ready.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(PortError::Timeout {
                what: "remote endpoint ready",
                after: timeout,
            })
        }
    }

    /// Close this side of the port.
    ///
    /// Notifies the peer with `eof`, cancels the lifecycle token and
    /// releases the handler thread. A second close fails with
    /// [`PortError::ClosedPipe`] and has no further effect; closing after
    /// the peer already closed fails with [`PortError::EndOfStream`].
    pub fn close(&self) -> Result<(), PortError> {
        self.shared.close_local()
    }

    /// Post a frame on the underlying port.
    pub(crate) fn post(&self, frame: Frame) -> Result<(), PortError> {
        self.shared
            .tx
            .send(frame)
            .map_err(|_| PortError::EndOfStream)
    }

    /// Post an `ack` unless this side already closed the port; a closed
    /// port implies the acknowledgement.
    pub(crate) fn ack_unless_closed(&self) {
        if !self.shared.local_closed.load(Ordering::SeqCst) {
            let _ = self.shared.tx.send(Frame::Ack);
        }
    }

    /// Re-announce readiness to the peer.
    ///
    /// The remote-ready gate is level triggered, so repeats are harmless.
    /// This is deliberately a `ready` frame and not an `ack`: an `ack`
    /// would bank a flow-control credit on the peer and let its writer
    /// run a chunk ahead of the ingest acknowledgements.
    pub(crate) fn notify_ready(&self) {
        if !self.shared.local_closed.load(Ordering::SeqCst) {
            let _ = self.shared.tx.send(Frame::Ready);
        }
    }

    /// Block until the peer acknowledges the frame posted last, or the
    /// port lifecycle ends.
    pub(crate) fn wait_ack(&self) -> Result<(), PortError> {
        let credits = self.shared.acks.credits();
        let cancelled = self.shared.token.observer();
        select! {
            recv(credits) -> credit => credit.map_err(|_| PortError::Cancelled),
            recv(cancelled) -> _ => Err(self.lifecycle_error()),
        }
    }

    /// A receiver that becomes ready when the port lifecycle ends.
    pub(crate) fn cancelled(&self) -> Receiver<Never> {
        self.shared.token.observer()
    }

    fn lifecycle_error(&self) -> PortError {
        if self.shared.remote_closed.load(Ordering::SeqCst) {
            PortError::EndOfStream
        } else if self.shared.local_closed.load(Ordering::SeqCst) {
            PortError::ClosedPipe
        } else {
            PortError::Cancelled
        }
    }

    fn write_chunk(&self, data: &[u8]) -> Result<usize, PortError> {
        if data.is_empty() {
            return Err(PortError::ZeroWrite);
        }
        // One writer at a time; the lock is held across the ack wait so a
        // second chunk can never overtake the first.
        let _guard = self.shared.write_lock.lock().unwrap();
        if self.shared.remote_closed.load(Ordering::SeqCst) {
            return Err(PortError::EndOfStream);
        }
        if self.shared.local_closed.load(Ordering::SeqCst) {
            return Err(PortError::ClosedPipe);
        }
        let chunk = Buffer::from_slice(data);
        trace!("port {}: posting {} byte chunk", self.shared.id, data.len());
        self.shared
            .tx
            .send(Frame::Data(chunk))
            .map_err(|_| PortError::EndOfStream)?;
        self.wait_ack()?;
        Ok(data.len())
    }
}

impl Read for MessagePort {
    /// Drain the receive queue, blocking while it is empty. Returns
    /// `Ok(0)` exactly once all buffered bytes have been delivered and
    /// the stream has ended.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut half = self.shared.reader.lock().unwrap();
        if half.pending.is_empty() {
            match half.queue.recv() {
                Ok(chunk) => half.pending = chunk,
                // The handler thread is gone: every queued chunk has been
                // delivered and the stream is over.
                Err(_) => return Ok(0),
            }
        }
        let n = half.pending.len().min(buf.len());
        let chunk = half.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

impl Write for MessagePort {
    /// Post one `data` frame and block until the peer acknowledges it.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf).map_err(io::Error::from)
    }

    /// Frames are posted synchronously; nothing to flush.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MessagePort {
    fn drop(&mut self) {
        // Deterministic teardown for endpoints dropped without close.
        if !self.shared.local_closed.load(Ordering::SeqCst)
            && !self.shared.remote_closed.load(Ordering::SeqCst)
        {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagePort({})", self.shared.id)
    }
}

/// Per-endpoint frame handler; runs on its own thread until the port
/// lifecycle ends.
struct Listener {
    shared: Arc<PortShared>,
    node: Node,
    rx: Receiver<Frame>,
    data_tx: Sender<Bytes>,
    cancelled: Receiver<Never>,
}

impl Listener {
    fn run(self) {
        loop {
            select! {
                recv(self.rx) -> frame => match frame {
                    Ok(frame) => {
                        if !self.handle(frame) {
                            break;
                        }
                    }
                    Err(_) => {
                        // The peer went away without an eof; treat it as a
                        // remote close.
                        self.shared.remote_closed.store(true, Ordering::SeqCst);
                        self.shared.token.cancel();
                        break;
                    }
                },
                recv(self.cancelled) -> _ => break,
            }
        }
        trace!("port {}: handlers released", self.shared.id);
        // Dropping the listener drops the receive queue sender (waking
        // blocked readers with end-of-stream) and the underlying port.
    }

    /// Handle one frame; returns `false` when the handler loop must stop.
    fn handle(&self, frame: Frame) -> bool {
        match frame {
            Frame::Ready => {
                self.shared.remote_ready.open();
                true
            }
            Frame::Ack => {
                self.shared.acks.grant();
                true
            }
            Frame::Data(chunk) => self.ingest(chunk),
            Frame::Eof => {
                trace!("port {}: remote side closed", self.shared.id);
                self.shared.remote_closed.store(true, Ordering::SeqCst);
                self.shared.token.cancel();
                false
            }
            Frame::Call { id, func, input, output } => {
                call::dispatch(
                    &self.node,
                    Call {
                        id,
                        func,
                        input,
                        output,
                    },
                    &self.shared.tx,
                );
                true
            }
            other @ (Frame::MainPort(_) | Frame::StartScheduler(_)) => {
                error!(
                    "port {}: unexpected {} frame on a data port",
                    self.shared.id,
                    other.name()
                );
                let _ = self.shared.close_local();
                false
            }
        }
    }

    /// Copy a received chunk into the receive queue and acknowledge it.
    fn ingest(&self, chunk: Buffer) -> bool {
        let bytes = match chunk.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("port {}: malformed data frame: {}", self.shared.id, err);
                self.shared.token.cancel();
                return false;
            }
        };
        let len = bytes.len();
        select! {
            send(self.data_tx, bytes) -> delivered => match delivered {
                Ok(()) => {
                    trace!("port {}: ingested {} byte chunk", self.shared.id, len);
                    let _ = self.shared.tx.send(Frame::Ack);
                    true
                }
                Err(_) => false,
            },
            recv(self.cancelled) -> _ => {
                // The local reader closed while the chunk was in hand;
                // tell the peer to stop sending.
                let _ = self.shared.tx.send(Frame::Eof);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::call::FunctionRegistry;
    use crate::node::Role;

    fn test_node() -> Node {
        Node::new(Arc::new(FunctionRegistry::new()), Role::Worker)
    }

    #[test]
    fn bytes_arrive_in_order_with_eof_after_close() {
        let node = test_node();
        let (mut a, mut b) = node.pipe();

        let writer = thread::spawn(move || {
            a.write_all(b"hello ").unwrap();
            a.write_all(b"world").unwrap();
            a.close().unwrap();
        });

        let mut received = Vec::new();
        b.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello world");
        // End of stream is sticky once delivered.
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        writer.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_in_the_documented_way() {
        let node = test_node();
        let (a, _b) = node.pipe();
        a.close().unwrap();
        assert!(matches!(a.close(), Err(PortError::ClosedPipe)));
        assert!(matches!(a.close(), Err(PortError::ClosedPipe)));
    }

    #[test]
    fn close_before_any_write_yields_immediate_eof() {
        let node = test_node();
        let (a, mut b) = node.pipe();
        a.close().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn zero_byte_write_is_rejected_without_posting() {
        let node = test_node();
        let (mut a, mut b) = node.pipe();
        let err = a.write(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        drop(a);
        // The peer saw the eof from the drop but never a data frame.
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_after_peer_close_reports_end_of_stream() {
        let node = test_node();
        let (mut a, b) = node.pipe();
        b.close().unwrap();
        // The peer will never acknowledge; the eof it posted unblocks the
        // writer instead.
        let err = a.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn close_after_peer_close_reports_end_of_stream() {
        let node = test_node();
        let (mut a, b) = node.pipe();
        b.close().unwrap();
        // Drain until the eof has demonstrably been observed.
        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).unwrap(), 0);
        assert!(matches!(a.close(), Err(PortError::EndOfStream)));
    }

    #[test]
    fn partial_reads_preserve_chunk_bytes() {
        let node = test_node();
        let (mut a, mut b) = node.pipe();
        let writer = thread::spawn(move || {
            a.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
            a.close().unwrap();
        });
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, &[1, 2, 3, 4]);
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[5, 6]);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        writer.join().unwrap();
    }

    #[test]
    fn both_ends_report_ready() {
        let node = test_node();
        let (a, b) = node.pipe();
        a.wait_remote_ready(Duration::from_secs(1)).unwrap();
        b.wait_remote_ready(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn dropping_an_endpoint_closes_it() {
        let node = test_node();
        let (a, mut b) = node.pipe();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
