//! Primary/worker connection acceptor.
//!
//! One thread owns the listening socket and does nothing but accept and
//! hand connections off; a fixed pool of worker threads each drive their
//! own event loop. The primary thread blocks in
//! `std::net::TcpListener::accept()` (no `Poll` of its own — it has nothing
//! else to multiplex) and round-robins raw streams to workers over a
//! `crossbeam_channel::Sender`; each worker owns a full [`Reactor`] and
//! wakes it via [`Remote::execute`] rather than a bare `Waker`, since the
//! reactor already has a queue to post into.
//!
//! This module is ambient scaffolding: something external is needed to
//! actually exercise a `Reactor` across more than one core.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use mio::net::TcpStream as MioTcpStream;
use mio::Events;

use crate::config::Config;
use crate::reactor::{EventTarget, Handle, Reactor, Remote};

/// Builds the per-connection `EventTarget` (typically a freshly-wrapped
/// `TcpSocket` or `TlsSocket` with an `HttpServerConnection` attached) for
/// each accepted stream. Runs on the worker thread that owns the
/// connection, never on the primary thread. The [`Handle`] is the owning
/// worker's reactor handle, for connections that need to schedule
/// background work (e.g. a keep-alive sweep) from inside the factory.
pub type ConnectionFactory =
    dyn Fn(MioTcpStream, SocketAddr, &Config, &Handle) -> Option<Box<dyn EventTarget>> + Send + Sync;

/// A running primary/worker acceptor. Dropping this detaches the threads;
/// there is no graceful shutdown protocol — neither the primary nor worker
/// loop returns short of a channel disconnect.
pub struct Acceptor {
    primary: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Acceptor {
    /// Binds `addr` and spawns `worker_count` reactor-owning worker threads,
    /// plus one primary thread that blocks in `accept()` and distributes
    /// connections to them round-robin. `make_connection` is invoked once
    /// per accepted connection, on the worker thread that will own it.
    pub fn spawn(
        addr: SocketAddr,
        worker_count: usize,
        reactor_config: Config,
        make_connection: Arc<ConnectionFactory>,
    ) -> std::io::Result<Self> {
        assert!(worker_count > 0, "acceptor needs at least one worker");
        let listener = StdTcpListener::bind(addr)?;

        let mut senders = Vec::with_capacity(worker_count);
        let mut remotes = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (tx, rx) = bounded::<(MioTcpStream, SocketAddr)>(1024);
            let reactor = Reactor::new(reactor_config.clone())?;
            let remote = reactor.remote();
            let factory = make_connection.clone();
            let config = reactor_config.clone();

            let join = thread::Builder::new()
                .name(format!("vortex-worker-{id}"))
                .spawn(move || worker_loop(reactor, rx, factory, config))
                .expect("failed to spawn worker thread");

            senders.push(tx);
            remotes.push(remote);
            workers.push(join);
        }

        let primary = thread::Builder::new()
            .name("vortex-acceptor".to_string())
            .spawn(move || primary_loop(listener, senders, remotes))
            .expect("failed to spawn acceptor thread");

        Ok(Self { primary, workers })
    }

    /// Blocks until every worker thread and the primary thread exit. Since
    /// neither loop currently has a shutdown path, this only returns if a
    /// thread panics.
    pub fn join(self) {
        let _ = self.primary.join();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn primary_loop(
    listener: StdTcpListener,
    senders: Vec<Sender<(MioTcpStream, SocketAddr)>>,
    remotes: Vec<Remote>,
) {
    let mut next = 0usize;
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("acceptor: accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("acceptor: set_nodelay failed: {e}");
        }
        let mio_stream = MioTcpStream::from_std(stream);

        let worker = next % senders.len();
        next = next.wrapping_add(1);

        if senders[worker].send((mio_stream, addr)).is_err() {
            log::warn!("acceptor: worker {worker} channel closed, dropping connection");
            continue;
        }
        remotes[worker].execute(|| {});
    }
}

fn worker_loop(
    mut reactor: Reactor,
    rx: crossbeam_channel::Receiver<(MioTcpStream, SocketAddr)>,
    make_connection: Arc<ConnectionFactory>,
    config: Config,
) {
    let mut events = Events::with_capacity(1024);
    let handle = reactor.handle();
    loop {
        reactor.tick(&mut events);
        loop {
            match rx.try_recv() {
                Ok((stream, addr)) => {
                    if let Some(target) = make_connection(stream, addr, &config, &handle) {
                        if let Err(e) = reactor.register_target(target) {
                            log::warn!("acceptor: failed to register connection from {addr}: {e}");
                        }
                    }
                }
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => return,
            }
        }
    }
}
