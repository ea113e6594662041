//! Gates and cancellation built on channel disconnection.
//!
//! Dropping the `Sender` of a channel disconnects its `Receiver`, and a
//! disconnected receiver is immediately ready in `select!`. Both
//! primitives here exploit that: opening a gate or cancelling a token
//! drops the held sender, which wakes every current and future waiter and
//! keeps the signal observable alongside frame arrivals in the same
//! `select!` block.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Channels of `Never` carry no values; they signal only by
/// disconnecting.
pub(crate) enum Never {}

struct SignalInner {
    guard: Mutex<Option<Sender<Never>>>,
    rx: Receiver<Never>,
}

/// A one-shot, level-triggered gate: once opened it stays open and every
/// waiter, current or future, observes it.
#[derive(Clone)]
pub(crate) struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Signal {
        let (tx, rx) = bounded::<Never>(0);
        Signal {
            inner: Arc::new(SignalInner {
                guard: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Open the gate. Idempotent.
    pub fn open(&self) {
        self.inner.guard.lock().unwrap().take();
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// A receiver that becomes ready once the gate opens; usable as a
    /// `recv` arm in `select!`.
    pub fn observer(&self) -> Receiver<Never> {
        self.inner.rx.clone()
    }

    /// Block until the gate opens, up to `timeout`. Returns whether the
    /// gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(never) => match never {},
        }
    }
}

/// Cancellation handle tied to one lifecycle (a port, a node). Observers
/// select on it next to their frame channels.
#[derive(Clone)]
pub(crate) struct CancellationToken {
    sig: Signal,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken { sig: Signal::new() }
    }

    /// Cancel the lifecycle. Idempotent.
    pub fn cancel(&self) {
        self.sig.open();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sig.is_open()
    }

    /// A receiver that becomes ready once cancelled.
    pub fn observer(&self) -> Receiver<Never> {
        self.sig.observer()
    }
}

/// Credit gate for flow control: the peer grants one credit per
/// acknowledged frame and a blocked sender takes one per posted frame.
pub(crate) struct AckGate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl AckGate {
    pub fn new() -> AckGate {
        let (tx, rx) = unbounded();
        AckGate { tx, rx }
    }

    /// Bank one credit, waking a blocked sender if there is one.
    pub fn grant(&self) {
        let _ = self.tx.send(());
    }

    /// The credit stream, for use in `select!`.
    pub fn credits(&self) -> Receiver<()> {
        self.rx.clone()
    }
}
