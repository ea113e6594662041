//! Mesh construction: spawning workers and linking every pair.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Error};
use uuid::Uuid;

use crate::call::{FuncId, FunctionRegistry};
use crate::node::{CallInput, CallOutput, Node, Role};
use crate::port::MessagePort;
use crate::proto::{raw_channel, Frame};
use crate::worker::{self, WorkerHandle};

/// Tunables of a mesh runtime.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Wait for each acknowledgement of the worker spawn handshake.
    pub spawn_timeout: Duration,
    /// Wait for each side of a new mesh link to acknowledge.
    pub link_timeout: Duration,
    /// Wait of input pumps for the remote endpoint to become ready.
    pub ready_timeout: Duration,
    /// Wait of [`Mesh::shutdown`] for in-flight calls to drain.
    pub drain_timeout: Duration,
    /// Pool size used by [`Mesh::spawn_default_workers`].
    pub worker_count: usize,
}

impl Default for MeshConfig {
    fn default() -> MeshConfig {
        MeshConfig {
            spawn_timeout: Duration::from_secs(10),
            link_timeout: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(5),
            worker_count: num_cpus::get(),
        }
    }
}

/// A point-in-time snapshot of the mesh.
#[derive(Debug, Clone)]
pub struct MeshStatus {
    /// Live workers.
    pub workers: usize,
    /// Live links between worker pairs.
    pub links: usize,
    /// Calls currently executing, per worker.
    pub active_calls: Vec<(Uuid, u64)>,
    /// Calls pushed back for redistribution, per worker.
    pub redistributions: Vec<(Uuid, u64)>,
}

impl MeshStatus {
    /// Total redistributions across all workers.
    pub fn total_redistributions(&self) -> u64 {
        self.redistributions.iter().map(|(_, n)| n).sum()
    }
}

/// The mesh runtime owned by the main thread.
///
/// Spawning a worker links it to every existing worker before returning,
/// so `n` workers always hold `n·(n−1)/2` links; the main thread also
/// runs one scheduling loop per worker, so submitted calls enter the
/// mesh through the first idle worker.
pub struct Mesh {
    node: Node,
    workers: Vec<WorkerHandle>,
    links: usize,
    config: MeshConfig,
}

impl Mesh {
    /// Create a mesh with the default configuration.
    pub fn new(registry: FunctionRegistry) -> Mesh {
        Mesh::with_config(registry, MeshConfig::default())
    }

    /// Create a mesh with an explicit configuration.
    pub fn with_config(registry: FunctionRegistry, config: MeshConfig) -> Mesh {
        let node = Node::with_ready_timeout(
            Arc::new(registry),
            Role::Main,
            config.ready_timeout,
        );
        Mesh {
            node,
            workers: Vec::new(),
            links: 0,
            config,
        }
    }

    /// Spawn one worker, link it to every existing worker and start
    /// scheduling to it, all before returning.
    ///
    /// A missed handshake or link acknowledgement terminates the new
    /// worker and fails the spawn.
    pub fn spawn_worker(&mut self) -> Result<Uuid, Error> {
        let mut handle = worker::spawn(self.node.registry_handle(), self.config.ready_timeout)
            .context("failed to spawn worker")?;
        if let Err(err) = self.connect(&handle) {
            handle.terminate();
            handle.join();
            return Err(err);
        }
        let id = handle.id();
        self.workers.push(handle);
        info!(
            "worker {} joined the mesh ({} workers, {} links)",
            id,
            self.workers.len(),
            self.links
        );
        Ok(id)
    }

    /// Spawn `count` workers.
    pub fn spawn_workers(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Spawn the configured default pool, one worker per CPU unless the
    /// configuration says otherwise.
    pub fn spawn_default_workers(&mut self) -> Result<(), Error> {
        self.spawn_workers(self.config.worker_count)
    }

    /// Handshake with a freshly spawned worker, link it to the existing
    /// workers and start the main-side scheduling loop on its control
    /// endpoint.
    fn connect(&mut self, handle: &WorkerHandle) -> Result<(), Error> {
        handle.wait_ack(self.config.spawn_timeout, "boot ack")?;

        // Hand the worker its command channel; keep our side as the
        // control endpoint.
        let (local, remote) = raw_channel();
        let control = MessagePort::bind(&self.node, local);
        handle.post(Frame::MainPort(remote))?;
        handle.wait_ack(self.config.spawn_timeout, "command channel ack")?;

        // One fresh channel per existing worker; both sides start a
        // scheduling loop on their half. The link count is committed only
        // once every side has acked, so a failed spawn never leaves a
        // partial count behind.
        let mut new_links = 0;
        for existing in &self.workers {
            let (to_new, to_old) = raw_channel();
            handle.post(Frame::StartScheduler(to_new))?;
            existing.post(Frame::StartScheduler(to_old))?;
            handle
                .wait_ack(self.config.link_timeout, "link ack")
                .with_context(|| format!("linking to worker {}", existing.id()))?;
            existing
                .wait_ack(self.config.link_timeout, "link ack")
                .with_context(|| format!("linking worker {}", existing.id()))?;
            new_links += 1;
            trace!("linked workers {} and {}", handle.id(), existing.id());
        }

        // Calls submitted on the main thread reach the mesh through this
        // worker as well.
        let loop_node = self.node.clone();
        thread::Builder::new()
            .name(format!("sched-{}", handle.id()))
            .spawn(move || {
                let id = control.id();
                if let Err(err) = loop_node.scheduler().run_on_port(&loop_node, control) {
                    debug!("main scheduling loop on {} stopped: {}", id, err);
                }
            })
            .context("failed to spawn main scheduling loop")?;
        self.links += new_links;
        Ok(())
    }

    /// The main-thread runtime context.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Live mesh links, one per worker pair.
    pub fn links(&self) -> usize {
        self.links
    }

    /// Live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Create a fresh duplex channel on the main node.
    pub fn pipe(&self) -> (MessagePort, MessagePort) {
        self.node.pipe()
    }

    /// Schedule one remote call; see [`Node::go`].
    pub fn go(
        &self,
        input: Option<CallInput>,
        output: CallOutput,
        func: FuncId,
    ) -> Result<(), Error> {
        self.node.go(input, output, func)
    }

    /// Schedule a linear pipeline of calls; see [`Node::go_chain`].
    pub fn go_chain(
        &self,
        input: Option<CallInput>,
        output: CallOutput,
        funcs: &[FuncId],
    ) -> Result<(), Error> {
        self.node.go_chain(input, output, funcs)
    }

    /// Snapshot of workers, links and call accounting.
    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            workers: self.workers.len(),
            links: self.links,
            active_calls: self
                .workers
                .iter()
                .map(|w| (w.id(), w.node().active_calls()))
                .collect(),
            redistributions: self
                .workers
                .iter()
                .map(|w| (w.id(), w.node().redistributions()))
                .collect(),
        }
    }

    /// Stop the mesh: refuse new submissions, wait for in-flight calls to
    /// drain (bounded by the configured drain timeout), then stop the
    /// workers and join their threads.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.shutdown_in_place();
        Ok(())
    }

    fn shutdown_in_place(&mut self) {
        if self.workers.is_empty() {
            self.node.cancel();
            return;
        }
        debug!("stopping the mesh");
        self.node.cancel();
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let active: u64 = self.workers.iter().map(|w| w.node().active_calls()).sum();
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutting down with {} calls still active", active);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        for mut worker in self.workers.drain(..) {
            worker.terminate();
            worker.join();
        }
        self.links = 0;
        debug!("mesh stopped");
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}
