//! End-to-end scenarios over a small in-process mesh.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use itertools::Itertools;
use portmesh::{CallInput, CallOutput, FuncId, FunctionRegistry, Mesh, MessagePort, Node};
use pretty_assertions::assert_eq;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Registered functions. Registration order is fixed so ids are stable
// across every test in this binary.
// ---------------------------------------------------------------------------

static INNER_ID: OnceLock<FuncId> = OnceLock::new();

struct TestFns {
    echo: FuncId,
    upper: FuncId,
    reverse: FuncId,
    nap: FuncId,
    outer: FuncId,
    drain: FuncId,
}

fn test_registry() -> (FunctionRegistry, TestFns) {
    let mut registry = FunctionRegistry::new();
    let fns = TestFns {
        echo: registry.register(echo),
        upper: registry.register(upper),
        reverse: registry.register(reverse),
        nap: registry.register(nap),
        outer: registry.register(outer),
        drain: registry.register(counting_drain),
    };
    let inner = registry.register(inner);
    let _ = INNER_ID.set(inner);
    (registry, fns)
}

fn echo(
    _node: &Node,
    input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    if let Some(input) = input {
        io::copy(input, output)?;
    }
    output.close()?;
    Ok(())
}

fn upper(
    _node: &Node,
    input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    let input = input.expect("upper needs an input");
    let mut buf = [0u8; 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut chunk = buf[..n].to_vec();
        chunk.make_ascii_uppercase();
        output.write_all(&chunk)?;
    }
    output.close()?;
    Ok(())
}

fn reverse(
    _node: &Node,
    input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    let input = input.expect("reverse needs an input");
    let mut all = Vec::new();
    input.read_to_end(&mut all)?;
    all.reverse();
    output.write_all(&all)?;
    output.close()?;
    Ok(())
}

/// Sleeps long enough for concurrent submissions to find the worker busy.
fn nap(
    _node: &Node,
    _input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    thread::sleep(Duration::from_millis(30));
    output.write_all(b"done")?;
    output.close()?;
    Ok(())
}

/// Schedules a nested call and relays its output.
fn outer(
    node: &Node,
    _input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    let inner_id = *INNER_ID.get().expect("registry not built");
    let (mut reader, writer) = node.pipe();
    node.go(None, CallOutput::Port(writer), inner_id)?;
    let mut relayed = Vec::new();
    reader.read_to_end(&mut relayed)?;
    output.write_all(&relayed)?;
    output.close()?;
    Ok(())
}

fn inner(
    _node: &Node,
    _input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    output.write_all(b"nested")?;
    output.close()?;
    Ok(())
}

static DRAINED_READS: AtomicU64 = AtomicU64::new(0);

/// Drains its input one slow read at a time, counting reads, and reports
/// the byte total.
fn counting_drain(
    _node: &Node,
    input: Option<&mut MessagePort>,
    output: &mut MessagePort,
) -> anyhow::Result<()> {
    let input = input.expect("counting_drain needs an input");
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        DRAINED_READS.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
    }
    output.write_all(&total.to_be_bytes())?;
    output.close()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sink plumbing: a writer that forwards every chunk to a channel and
// signals end of stream by disconnecting.
// ---------------------------------------------------------------------------

struct Sink {
    tx: Sender<Vec<u8>>,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn sink() -> (CallOutput, Receiver<Vec<u8>>) {
    let (tx, rx) = unbounded();
    (CallOutput::Writer(Box::new(Sink { tx })), rx)
}

/// Collect everything the sink receives until end of stream.
fn collect(rx: &Receiver<Vec<u8>>) -> Vec<u8> {
    let mut all = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(chunk) => all.extend(chunk),
            Err(RecvTimeoutError::Disconnected) => return all,
            Err(RecvTimeoutError::Timeout) => panic!("sink never saw end of stream"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn echo_through_one_worker() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_worker().unwrap();

    let (output, received) = sink();
    mesh.go(Some(b"hello".to_vec().into()), output, fns.echo)
        .unwrap();

    assert_eq!(collect(&received), b"hello");
    mesh.shutdown().unwrap();
}

#[test]
fn echo_large_random_payload() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_worker().unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|_| fastrand::u8(..)).collect();
    let (output, received) = sink();
    mesh.go(Some(payload.clone().into()), output, fns.echo)
        .unwrap();

    let got = collect(&received);
    assert_eq!(got.len(), payload.len());
    assert_eq!(got, payload);
}

#[test]
fn chain_runs_stages_on_two_workers() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_workers(2).unwrap();

    let (output, received) = sink();
    mesh.go_chain(
        Some(b"ab".to_vec().into()),
        output,
        &[fns.upper, fns.reverse],
    )
    .unwrap();

    assert_eq!(collect(&received), b"BA");
    mesh.shutdown().unwrap();
}

#[test]
fn burst_of_calls_is_redistributed() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_workers(2).unwrap();

    let receivers: Vec<_> = (0..5)
        .map(|_| {
            let (output, received) = sink();
            mesh.go(None, output, fns.nap).unwrap();
            received
        })
        .collect();

    for received in &receivers {
        assert_eq!(collect(received), b"done");
    }

    let status = mesh.status();
    assert!(
        status.total_redistributions() >= 1,
        "no call was ever pushed back: {status:?}"
    );
    mesh.shutdown().unwrap();
}

#[test]
fn closing_one_end_surfaces_eof_on_the_other() {
    init_logger();
    let (registry, _fns) = test_registry();
    let mesh = Mesh::new(registry);

    let (a, mut b) = mesh.pipe();
    a.close().unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(b.read(&mut buf).unwrap(), 0);
}

#[test]
fn four_workers_form_six_links() {
    init_logger();
    let (registry, _fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    for expected_links in [0, 1, 3, 6] {
        mesh.spawn_worker().unwrap();
        assert_eq!(mesh.links(), expected_links);
    }
    assert_eq!(mesh.worker_count(), 4);
    // One link per worker pair.
    assert_eq!(mesh.links(), (0..4).tuple_combinations::<(_, _)>().count());
    mesh.shutdown().unwrap();
}

#[test]
fn slow_consumer_holds_the_writer_back() {
    init_logger();
    let (registry, _fns) = test_registry();
    let mesh = Mesh::new(registry);

    const CHUNKS: u64 = 100;
    const CHUNK_LEN: usize = 4096;

    let (mut writer, mut reader) = mesh.pipe();
    let written = Arc::new(AtomicU64::new(0));
    let writer_side = written.clone();

    let producer = thread::spawn(move || {
        for i in 0..CHUNKS {
            let chunk = vec![(i % 251) as u8; CHUNK_LEN];
            writer.write_all(&chunk).unwrap();
            writer_side.fetch_add(1, Ordering::SeqCst);
        }
        writer.close().unwrap();
    });

    let mut total = 0usize;
    let mut consumed = 0u64;
    let mut buf = vec![0u8; CHUNK_LEN];
    for i in 0..CHUNKS {
        reader.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == (i % 251) as u8), "chunk {i} corrupted");
        total += buf.len();
        consumed += 1;
        // A completed write implies the reader already took the chunk, so
        // the producer can never be more than one chunk ahead.
        let produced = written.load(Ordering::SeqCst);
        assert!(
            produced <= consumed + 1,
            "writer ran ahead: {produced} written vs {consumed} consumed"
        );
        if i % 10 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }
    assert_eq!(total, CHUNKS as usize * CHUNK_LEN);
    let mut end = [0u8; 1];
    assert_eq!(reader.read(&mut end).unwrap(), 0);
    producer.join().unwrap();
}

#[test]
fn call_input_writes_stay_lockstepped() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_worker().unwrap();

    DRAINED_READS.store(0, Ordering::SeqCst);
    const CHUNKS: u64 = 32;
    const CHUNK_LEN: usize = 512;

    let (mut feed, remote) = mesh.pipe();
    let (output, received) = sink();
    mesh.go(Some(CallInput::Port(remote)), output, fns.drain)
        .unwrap();

    for i in 0..CHUNKS {
        feed.write_all(&vec![i as u8; CHUNK_LEN]).unwrap();
        // A completed write means the consumer took the chunk, so the
        // readiness handshake must never grant the writer a head start.
        let drained = DRAINED_READS.load(Ordering::SeqCst);
        assert!(
            i <= drained,
            "writer ran ahead: {} writes completed vs {} reads finished",
            i + 1,
            drained
        );
    }
    feed.close().unwrap();

    assert_eq!(
        collect(&received),
        (CHUNKS * CHUNK_LEN as u64).to_be_bytes()
    );
    mesh.shutdown().unwrap();
}

#[test]
fn functions_can_schedule_nested_calls() {
    init_logger();
    let (registry, fns) = test_registry();
    let mut mesh = Mesh::new(registry);
    mesh.spawn_workers(2).unwrap();

    let (output, received) = sink();
    mesh.go(None, output, fns.outer).unwrap();

    assert_eq!(collect(&received), b"nested");
    mesh.shutdown().unwrap();
}

#[test]
fn unknown_function_is_rejected_before_submission() {
    init_logger();
    let (registry, _fns) = test_registry();
    let mesh = Mesh::new(registry);
    let (_keep, sink_port) = mesh.pipe();
    // No function was ever registered under this id.
    let bogus = {
        let mut other = FunctionRegistry::new();
        for _ in 0..32 {
            other.register(echo);
        }
        other.register(echo)
    };
    let err = mesh
        .go(None, CallOutput::Port(sink_port), bogus)
        .unwrap_err();
    assert!(err.to_string().contains("cannot schedule"));
}
