//! TLS-adapted byte socket over `rustls`.
//!
//! A `Socket`/`SocketHandler` adapter built around `read_tls`/
//! `process_new_packets`/`event_set`-style driving of a `rustls` connection,
//! draining the engine to a fixpoint after every event and presenting the
//! same four-event/four-command contract a plain
//! [`super::tcp_socket::TcpSocket`] does.
//!
//! `TlsSocket` never registers its own `mio` source. It holds its own
//! `TcpSocket` behind a second, private `Rc<RefCell<_>>` cell and is that
//! socket's handler, so events flow `Reactor -> TcpSocket::on_readable ->
//! TlsSocket::on_read (ciphertext) -> app_handler::on_read (plaintext)` and
//! the reverse on write. The inner `TcpSocket` cell and the outer
//! `TlsSocket` cell must stay distinct: `TcpSocket::on_readable` borrows its
//! own cell for the duration of the read loop and, from inside that
//! borrow, calls back into its handler (the `TlsSocket`) — if the two sat
//! behind the same `RefCell`, that callback would re-enter a cell already
//! borrowed mutably one frame up and panic. [`TlsSocket::into_event_target`]
//! hands the reactor an `EventTarget` over the *inner* `TcpSocket` cell
//! directly (the same wrapper [`TcpSocket::into_event_target`] builds),
//! never over the `TlsSocket` cell itself.
//!
//! Splitting the cells isn't enough on its own: `TcpSocket::on_readable`
//! still calls `TlsSocket::on_read` while the inner cell is borrowed, and
//! driving the handshake forward (`drain`) writes the next flight straight
//! back into that same inner socket. Every `SocketHandler` entry point
//! (`on_registered`, `on_read`, `on_write`, `on_closed_with_error`)
//! therefore posts its real work onto the reactor's local task queue via
//! its `Handle` instead of running inline, so the inner-socket borrow the
//! dispatcher holds has already been released by the time this socket
//! touches it. The same goes the other way: notifying the application
//! handler is always posted too, so a handler that writes back into this
//! socket from inside its callback never re-enters this socket's own cell.

use std::cell::RefCell;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use mio::net::TcpStream as MioTcpStream;
use mio::Token;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use threadpool::ThreadPool;

use crate::config::Config;
use crate::error::TlsError;
use crate::reactor::{BufferPool, EventTarget, Handle, PoolBuffer, Reactor};

use super::socket::{Socket, SocketHandler};
use super::tcp_socket::TcpSocket;

/// Wraps the two concrete `rustls` connection types behind one set of method
/// calls. Both deref to `rustls::ConnectionCommon`, so every method below
/// exists identically on each side; there is no shared public trait to hang
/// a single delegating impl off, so the match is written out by hand.
enum TlsEngine {
    Server(Box<ServerConnection>),
    Client(Box<ClientConnection>),
}

impl TlsEngine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.read_tls(rd),
            TlsEngine::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.write_tls(wr),
            TlsEngine::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsEngine::Server(c) => c.process_new_packets(),
            TlsEngine::Client(c) => c.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.wants_write(),
            TlsEngine::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.is_handshaking(),
            TlsEngine::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsEngine::Server(c) => c.send_close_notify(),
            TlsEngine::Client(c) => c.send_close_notify(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsEngine::Server(c) => c.alpn_protocol(),
            TlsEngine::Client(c) => c.alpn_protocol(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsEngine::Server(c) => c.writer(),
            TlsEngine::Client(c) => c.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsEngine::Server(c) => c.reader(),
            TlsEngine::Client(c) => c.reader(),
        }
    }
}

pub struct TlsSocket {
    inner: Rc<RefCell<TcpSocket>>,
    engine: TlsEngine,
    app_handler: Option<Rc<RefCell<dyn SocketHandler>>>,
    pool: BufferPool,
    receive_buffer_size: usize,
    closed: bool,
    write_end_requested: bool,
    half_closed_out: bool,
    app_registered: bool,
    /// Re-entrancy guard around `drain`: nothing here currently calls back
    /// into `drain` synchronously from within itself, but a certificate
    /// verifier that hands off to `tls_executor` and resumes asynchronously
    /// could re-enter mid-handshake, so the guard is held even though
    /// ordinary handshakes never trip it.
    handshake_locked: bool,
    /// Executor `rustls::ServerCertVerifier`/`ClientCertVerifier`
    /// implementations may hand blocking work to. Unused by the handshakes
    /// this crate drives itself; kept as a real extension point.
    #[allow(dead_code)]
    tls_executor: Arc<ThreadPool>,
    handle: Handle,
    self_weak: Weak<RefCell<TlsSocket>>,
}

impl TlsSocket {
    fn wrap(stream: MioTcpStream, engine: TlsEngine, config: Config, handle: Handle) -> Rc<RefCell<Self>> {
        let tls_executor = config.tls_executor.clone();
        let receive_buffer_size = config.receive_buffer_size;
        let inner = TcpSocket::from_accepted(stream, config.clone()).into_shared();
        let socket = Rc::new(RefCell::new(Self {
            inner: inner.clone(),
            engine,
            app_handler: None,
            pool: BufferPool::new(config.buf_pool_cap),
            receive_buffer_size,
            closed: false,
            write_end_requested: false,
            half_closed_out: false,
            app_registered: false,
            handshake_locked: false,
            tls_executor,
            handle,
            self_weak: Weak::new(),
        }));
        socket.borrow_mut().self_weak = Rc::downgrade(&socket);
        // `inner` keeps its own cell, separate from `socket`'s: see the
        // module docs for why the two must never collapse into one.
        let inner_handler: Rc<RefCell<dyn SocketHandler>> = socket.clone();
        inner.borrow_mut().set_handler(inner_handler);
        socket
    }

    /// Server-side handshake over an accepted stream.
    pub fn new_server(
        stream: MioTcpStream,
        tls_config: Arc<ServerConfig>,
        config: Config,
        handle: Handle,
    ) -> Result<Rc<RefCell<Self>>, rustls::Error> {
        let conn = ServerConnection::new(tls_config)?;
        Ok(Self::wrap(stream, TlsEngine::Server(Box::new(conn)), config, handle))
    }

    /// Client-side handshake over a connected stream.
    pub fn new_client(
        stream: MioTcpStream,
        tls_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        config: Config,
        handle: Handle,
    ) -> Result<Rc<RefCell<Self>>, rustls::Error> {
        let conn = ClientConnection::new(tls_config, server_name)?;
        Ok(Self::wrap(stream, TlsEngine::Client(Box::new(conn)), config, handle))
    }

    /// Registers `socket` with the reactor, returning the assigned token.
    pub fn register(reactor: &mut Reactor, socket: Rc<RefCell<Self>>) -> io::Result<Token> {
        reactor.register_target(Self::into_event_target(socket))
    }

    /// Wraps `socket`'s inner `TcpSocket` as an `EventTarget` without
    /// registering it yet — the same wrapper a plain, non-TLS socket gets
    /// (see `TcpSocket::into_event_target`), over the inner cell rather than
    /// the `TlsSocket` cell itself (see module docs).
    pub fn into_event_target(socket: Rc<RefCell<Self>>) -> Box<dyn EventTarget> {
        let inner = socket.borrow().inner.clone();
        TcpSocket::into_event_target(inner)
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.engine.alpn_protocol().map(|p| p.to_vec())
    }

    fn fail_io(&mut self, err: io::Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        let handler = self.app_handler.take();
        self.inner.borrow_mut().close();
        if let Some(handler) = handler {
            self.handle.post(move || {
                handler.borrow_mut().on_closed_with_error(err);
            });
        }
    }

    fn fail_tls(&mut self, err: TlsError) {
        self.fail_io(io::Error::new(io::ErrorKind::Other, err));
    }

    /// Pushes every pending engine2net byte the engine currently has queued
    /// (handshake flight or encrypted application data) onto the inner
    /// socket's own write queue, which owns the actual non-blocking send.
    fn flush_engine_to_wire(&mut self) {
        loop {
            if !self.engine.wants_write() {
                return;
            }
            let mut out = Vec::new();
            match self.engine.write_tls(&mut out) {
                Ok(0) => return,
                Ok(_) => {
                    let mut buf = self.pool.allocate(out.len());
                    buf.extend_from_slice(&out);
                    self.inner.borrow_mut().write(buf);
                }
                Err(e) => {
                    self.fail_io(e);
                    return;
                }
            }
        }
    }

    /// Copies every currently-available plaintext byte out of the engine's
    /// internal buffer and up to the application handler.
    fn deliver_plaintext(&mut self) {
        loop {
            if self.app_handler.is_none() {
                return;
            }
            let mut buf = self.pool.allocate(self.receive_buffer_size);
            match self.engine.reader().read(buf.as_write_slice_mut()) {
                Ok(0) => {
                    self.pool.recycle(buf);
                    return;
                }
                Ok(n) => {
                    buf.mark_written(n);
                    if let Some(handler) = self.app_handler.clone() {
                        let handle = self.handle.clone();
                        handle.post(move || {
                            handler.borrow_mut().on_read(buf);
                        });
                    } else {
                        self.pool.recycle(buf);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.pool.recycle(buf);
                    return;
                }
                Err(e) => {
                    self.pool.recycle(buf);
                    self.fail_io(e);
                    return;
                }
            }
        }
    }

    fn maybe_signal_registered(&mut self) {
        if self.app_registered || self.engine.is_handshaking() {
            return;
        }
        self.app_registered = true;
        if let Some(handler) = self.app_handler.clone() {
            let handle = self.handle.clone();
            handle.post(move || {
                handler.borrow_mut().on_registered();
            });
        }
    }

    /// Drains the engine to a fixpoint: deliver whatever plaintext is ready,
    /// flush whatever ciphertext is queued, signal handshake completion
    /// exactly once, and finish any pending half-close. Called after every
    /// event the inner socket delivers and after every application write.
    fn drain(&mut self) {
        if self.closed || self.handshake_locked {
            return;
        }
        self.handshake_locked = true;
        self.deliver_plaintext();
        self.flush_engine_to_wire();
        self.maybe_signal_registered();
        if self.write_end_requested && !self.half_closed_out && !self.engine.wants_write() {
            self.engine.send_close_notify();
            self.flush_engine_to_wire();
            self.inner.borrow_mut().write_end_of_stream();
            self.half_closed_out = true;
        }
        self.handshake_locked = false;
    }
}

impl Socket for TlsSocket {
    fn set_handler(&mut self, handler: Rc<RefCell<dyn SocketHandler>>) {
        self.app_handler = Some(handler);
    }

    fn read(&mut self) {
        self.inner.borrow_mut().read();
    }

    fn write(&mut self, buf: PoolBuffer) {
        if self.closed || self.write_end_requested {
            return;
        }
        if let Err(e) = self.engine.writer().write_all(buf.as_read_slice()) {
            self.pool.recycle(buf);
            self.fail_io(e);
            return;
        }
        self.pool.recycle(buf);
        self.flush_engine_to_wire();
    }

    fn write_end_of_stream(&mut self) {
        self.write_end_requested = true;
        self.drain();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.app_handler = None;
        self.inner.borrow_mut().close();
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().remote_addr()
    }
}

impl SocketHandler for TlsSocket {
    // Every method here is entered synchronously from `TcpSocket`'s own
    // dispatch, with the inner socket's cell already borrowed (see the
    // module docs) — so none of these run their real body inline. Each
    // posts it, via its own `Handle`, to run once that borrow is gone.

    fn on_registered(&mut self) {
        let weak = self.self_weak.clone();
        self.handle.post(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            let mut this = cell.borrow_mut();
            // Declare read interest so the rest of the handshake flight
            // (or, for a client, the server's flight) can arrive; a
            // client's ClientHello goes out below via `drain`'s
            // `flush_engine_to_wire`.
            this.inner.borrow_mut().read();
            this.drain();
        });
    }

    fn on_read(&mut self, buf: PoolBuffer) {
        let weak = self.self_weak.clone();
        self.handle.post(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            let mut this = cell.borrow_mut();
            if this.closed {
                return;
            }
            let mut cursor = Cursor::new(buf.as_read_slice());
            let read_result = this.engine.read_tls(&mut cursor);
            this.pool.recycle(buf);

            if let Err(e) = read_result {
                this.fail_io(e);
                return;
            }

            match this.engine.process_new_packets() {
                Ok(_) => this.drain(),
                Err(e) => {
                    // rustls may have queued a fatal alert in response; give
                    // it a chance onto the wire before tearing down.
                    this.flush_engine_to_wire();
                    this.fail_tls(e.into());
                }
            }
        });
    }

    fn on_read_end_of_stream(&mut self) {
        let weak = self.self_weak.clone();
        self.handle.post(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            let mut this = cell.borrow_mut();
            if this.closed {
                return;
            }
            if this.engine.is_handshaking() {
                this.fail_tls(TlsError::HandshakeAborted);
                return;
            }
            // A TCP close without a prior close_notify is still reported as
            // an orderly end of stream, never as `on_closed_with_error`.
            if let Some(handler) = this.app_handler.clone() {
                let handle = this.handle.clone();
                handle.post(move || {
                    handler.borrow_mut().on_read_end_of_stream();
                });
            }
        });
    }

    fn on_write(&mut self) {
        let weak = self.self_weak.clone();
        self.handle.post(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            let mut this = cell.borrow_mut();
            if this.closed {
                return;
            }
            this.drain();
            if !this.engine.wants_write() {
                if let Some(handler) = this.app_handler.clone() {
                    let handle = this.handle.clone();
                    handle.post(move || {
                        handler.borrow_mut().on_write();
                    });
                }
            }
        });
    }

    fn on_closed_with_error(&mut self, err: io::Error) {
        let weak = self.self_weak.clone();
        self.handle.post(move || {
            let Some(cell) = weak.upgrade() else {
                return;
            };
            cell.borrow_mut().fail_io(err);
        });
    }
}

/// A [`Socket`] handle over a `TlsSocket` registered via
/// [`TlsSocket::register`]. Cheap to clone; every clone forwards to the same
/// underlying adapter. Symmetric with
/// [`super::tcp_socket::SharedTcpSocket`], letting an `HttpConnection` hold
/// a uniform `Box<dyn Socket>` regardless of whether TLS is in play.
#[derive(Clone)]
pub struct SharedTlsSocket(pub Rc<RefCell<TlsSocket>>);

impl Socket for SharedTlsSocket {
    fn set_handler(&mut self, handler: Rc<RefCell<dyn SocketHandler>>) {
        self.0.borrow_mut().set_handler(handler);
    }

    fn read(&mut self) {
        self.0.borrow_mut().read();
    }

    fn write(&mut self, buf: PoolBuffer) {
        self.0.borrow_mut().write(buf);
    }

    fn write_end_of_stream(&mut self) {
        self.0.borrow_mut().write_end_of_stream();
    }

    fn close(&mut self) {
        self.0.borrow_mut().close();
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.0.borrow().remote_addr()
    }
}
