//! Streaming remote calls over an in-process mesh of worker threads.
//!
//! This crate runs a pool of workers, connects every pair of them with a
//! dedicated duplex channel and dispatches *calls* (a registered
//! function plus a streaming input and a streaming output) to the first
//! worker that is ready to take one. A running function receives its
//! worker's [`Node`] and may schedule further calls, so computations
//! compose into pipelines whose stages stream into each other while
//! running on distinct workers.
//!
//! ## Components
//!
//! - [`MessagePort`] is one side of a reliable ordered byte stream over a
//!   pair of crossed frame channels. Writes are credit gated (one
//!   unacknowledged chunk per direction), reads block on an internal
//!   rendezvous queue, and `close` tells the peer to surface end of
//!   stream once everything buffered has been drained.
//! - [`FunctionRegistry`] maps small integer ids ([`FuncId`]) to static
//!   function pointers. Every participant holds the same registry, which
//!   is what makes an id resolvable everywhere; ids are the only
//!   representation of a function that ever crosses a port.
//! - The scheduler of each participant is an unbuffered rendezvous queue
//!   multiplexed over one loop per outgoing link: whichever loop is idle
//!   first takes the next call and posts it, endpoints moving with the
//!   frame.
//! - [`Mesh`] spawns workers, performs the bootstrap handshake, links
//!   every worker pair and runs one main-side scheduling loop per worker.
//!   A worker executes one call at a time; a call arriving at a busy
//!   worker is pushed back into that worker's queue so another link can
//!   steal it.
//!
//! ## Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//!
//! use portmesh::{CallOutput, FunctionRegistry, Mesh, MessagePort, Node};
//!
//! fn upper(
//!     _node: &Node,
//!     input: Option<&mut MessagePort>,
//!     output: &mut MessagePort,
//! ) -> anyhow::Result<()> {
//!     let input = input.ok_or_else(|| anyhow::anyhow!("upper needs an input"))?;
//!     let mut text = Vec::new();
//!     input.read_to_end(&mut text)?;
//!     text.make_ascii_uppercase();
//!     output.write_all(&text)?;
//!     output.close()?;
//!     Ok(())
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut registry = FunctionRegistry::new();
//!     let upper_id = registry.register(upper);
//!
//!     let mut mesh = Mesh::new(registry);
//!     mesh.spawn_workers(2)?;
//!
//!     let (mut result, sink) = mesh.pipe();
//!     mesh.go(Some(b"hello".to_vec().into()), CallOutput::Port(sink), upper_id)?;
//!
//!     let mut out = Vec::new();
//!     result.read_to_end(&mut out)?;
//!     assert_eq!(out, b"HELLO");
//!     mesh.shutdown()
//! }
//! ```
//!
//! ## Implementation details
//!
//! Everything is intra-process by design: a worker is an OS thread, a raw
//! port is a pair of crossed channels, and "transferring" a port or an
//! endpoint means moving it inside a frame. The wire protocol is
//! documented in [`proto`]; frames posted on one half of a channel arrive
//! on the other half in order, so `eof` never overtakes the data it
//! follows.
//!
//! The participants and their duties:
//!
//! - the *main thread* owns the [`Mesh`]: it spawns workers, builds
//!   links, submits calls and never executes one;
//! - a *worker* serves its global channel (see
//!   [`run_server`]) and executes dispatched calls, at most one at a
//!   time;
//! - a *scheduling loop* binds one participant's queue to one outgoing
//!   link: post a call, wait for the link acknowledgement, repeat;
//! - a *pump* copies a plain reader or writer into or out of an internal
//!   pipe so user streams and endpoints compose freely.
//!
//! Failures follow two regimes: closed pipes and end-of-stream are
//! ordinary lifecycle results every stream consumer must expect, while
//! missed handshake acknowledgements and protocol violations terminate
//! the offending worker or endpoint and are logged.

#![deny(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use(defer)]
extern crate scopeguard;

mod call;
mod error;
mod mesh;
mod node;
mod port;
pub mod proto;
mod scheduler;
mod signal;
mod worker;

pub use call::{FuncId, FunctionRegistry, RemoteFn};
pub use error::PortError;
pub use mesh::{Mesh, MeshConfig, MeshStatus};
pub use node::{CallInput, CallOutput, Node, Role};
pub use port::MessagePort;
pub use worker::run_server;
