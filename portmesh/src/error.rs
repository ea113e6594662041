use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::call::FuncId;

/// Errors surfaced by ports and the mesh runtime.
///
/// `ClosedPipe` and `EndOfStream` are ordinary lifecycle conditions and
/// never indicate a bug; the rest terminate the operation that observed
/// them. Protocol violations have no caller to report to and are logged
/// by the endpoint handler instead, which then cancels and closes the
/// port.
#[derive(Debug, Error)]
pub enum PortError {
    /// This side of the port was already closed.
    #[error("closed pipe: port already closed on this side")]
    ClosedPipe,
    /// The remote side closed the port; no more data will flow.
    #[error("end of stream: remote side closed the port")]
    EndOfStream,
    /// An empty chunk was handed to `write`; empty chunks never cross a
    /// port.
    #[error("zero length write")]
    ZeroWrite,
    /// The operation was interrupted by lifecycle cancellation.
    #[error("operation cancelled")]
    Cancelled,
    /// A signal did not arrive in time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// How long the wait lasted.
        after: Duration,
    },
    /// The function id could not be resolved by the registry.
    #[error("unknown function id {0}")]
    UnknownFunction(FuncId),
}

impl From<PortError> for io::Error {
    fn from(err: PortError) -> io::Error {
        let kind = match err {
            PortError::ClosedPipe => io::ErrorKind::BrokenPipe,
            PortError::EndOfStream => io::ErrorKind::UnexpectedEof,
            PortError::ZeroWrite => io::ErrorKind::InvalidInput,
            // Not `Interrupted`: io::copy would retry a cancelled port.
            PortError::Cancelled => io::ErrorKind::ConnectionAborted,
            PortError::Timeout { .. } => io::ErrorKind::TimedOut,
            PortError::UnknownFunction(_) => io::ErrorKind::NotFound,
        };
        io::Error::new(kind, err)
    }
}
