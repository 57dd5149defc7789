//! Plain (non-TLS) byte socket over `mio::net::TcpStream`.
//!
//! Edge-triggered read-until-`WouldBlock`, a write queue drained on
//! writable, and an `Interest` computed from queue occupancy. Parsing lives
//! a layer up, in `crate::http` — this layer only ever hands raw bytes to
//! whatever `SocketHandler` is attached.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

use crate::config::Config;
use crate::reactor::{BufferPool, EventTarget, PoolBuffer, Reactor};

use super::socket::{Socket, SocketHandler};

pub struct TcpSocket {
    stream: MioTcpStream,
    token: Option<Token>,
    handler: Option<Rc<RefCell<dyn SocketHandler>>>,
    read_interest: bool,
    write_queue: VecDeque<PoolBuffer>,
    write_end_requested: bool,
    write_shutdown_done: bool,
    read_ended: bool,
    closed: bool,
    pool: BufferPool,
    receive_buffer_size: usize,
    merge_limit: usize,
}

impl TcpSocket {
    /// Wraps a freshly-accepted or freshly-connected stream. No handler is
    /// attached yet; callers (a `TlsSocket`, an `HttpConnection`, or a demo)
    /// call `set_handler` before the socket is registered with the reactor.
    pub fn from_accepted(stream: MioTcpStream, config: Config) -> Self {
        Self {
            stream,
            token: None,
            handler: None,
            read_interest: false,
            write_queue: VecDeque::new(),
            write_end_requested: false,
            write_shutdown_done: false,
            read_ended: false,
            closed: false,
            pool: BufferPool::new(config.buf_pool_cap),
            receive_buffer_size: config.receive_buffer_size,
            merge_limit: config.merge_limit.max(1),
        }
    }

    fn wanted_interest(&self) -> Interest {
        let want_write = !self.write_queue.is_empty()
            || (self.write_end_requested && !self.write_shutdown_done);
        match (self.read_interest, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE, // park on readable to notice peer close/errors
        }
    }

    fn handler(&self) -> Option<Rc<RefCell<dyn SocketHandler>>> {
        self.handler.clone()
    }

    fn fail(&mut self, err: io::Error) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(handler) = self.handler() {
            handler.borrow_mut().on_closed_with_error(err);
        }
    }

    /// Drains what's pending, attempting each queued buffer until the socket
    /// would block or the queue empties.
    fn drain_write_queue(&mut self) {
        while let Some(mut buf) = self.write_queue.pop_front() {
            match self.stream.write(buf.as_read_slice()) {
                Ok(0) => {
                    self.write_queue.push_front(buf);
                    break;
                }
                Ok(n) => {
                    buf.mark_read(n);
                    if buf.remaining() > 0 {
                        self.write_queue.push_front(buf);
                        break;
                    }
                    self.pool.recycle(buf);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.write_queue.push_front(buf);
                    break;
                }
                Err(e) => {
                    self.write_queue.push_front(buf);
                    self.fail(e);
                    return;
                }
            }
        }

        if self.write_queue.is_empty() && self.write_end_requested && !self.write_shutdown_done {
            match self.stream.shutdown(Shutdown::Write) {
                Ok(()) | Err(_) => self.write_shutdown_done = true,
            }
        }

        // Signal drained-ness here rather than only from `on_writable`, so
        // a write that completes inline (the common case for small
        // payloads) doesn't wait on a kernel writable event that may never
        // come once there's nothing left to register interest for.
        if !self.closed && self.write_queue.is_empty() {
            if let Some(handler) = self.handler() {
                handler.borrow_mut().on_write();
            }
        }
    }
}

impl Socket for TcpSocket {
    fn set_handler(&mut self, handler: Rc<RefCell<dyn SocketHandler>>) {
        self.handler = Some(handler);
    }

    fn read(&mut self) {
        self.read_interest = true;
    }

    fn write(&mut self, buf: PoolBuffer) {
        if self.closed || self.write_end_requested {
            return;
        }
        if buf.remaining() <= self.merge_limit {
            if let Some(tail) = self.write_queue.back_mut() {
                if tail.remaining() + buf.remaining() <= tail.capacity() {
                    let bytes: Vec<u8> = buf.as_read_slice().to_vec();
                    tail.extend_from_slice(&bytes);
                    self.pool.recycle(buf);
                    // Optimistic first-attempt write, mirroring `read`'s
                    // immediate-try: most writes succeed inline without ever
                    // waiting on a WRITABLE event.
                    self.drain_write_queue();
                    return;
                }
            }
        }
        self.write_queue.push_back(buf);
        self.drain_write_queue();
    }

    fn write_end_of_stream(&mut self) {
        self.write_end_requested = true;
        self.drain_write_queue();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handler = None;
        for buf in self.write_queue.drain(..) {
            self.pool.recycle(buf);
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl EventTarget for TcpSocket {
    fn on_readable(&mut self) {
        loop {
            if self.closed || self.read_ended {
                return;
            }
            let mut buf = self.pool.allocate(self.receive_buffer_size);
            match self.stream.read(buf.as_write_slice_mut()) {
                Ok(0) => {
                    self.pool.recycle(buf);
                    self.read_ended = true;
                    self.read_interest = false;
                    if let Some(handler) = self.handler() {
                        handler.borrow_mut().on_read_end_of_stream();
                    }
                    return;
                }
                Ok(n) => {
                    buf.mark_written(n);
                    if let Some(handler) = self.handler() {
                        handler.borrow_mut().on_read(buf);
                    } else {
                        self.pool.recycle(buf);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.pool.recycle(buf);
                    return;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                    self.pool.recycle(buf);
                    continue;
                }
                Err(e) => {
                    self.pool.recycle(buf);
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn on_writable(&mut self) {
        if self.closed {
            return;
        }
        // `drain_write_queue` itself signals the handler once the queue
        // empties; nothing further to do here.
        self.drain_write_queue();
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.token = Some(token);
        registry.register(&mut self.stream, token, self.wanted_interest())?;
        if let Some(handler) = self.handler() {
            handler.borrow_mut().on_registered();
        }
        Ok(())
    }

    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let Some(token) = self.token else {
            return Ok(());
        };
        registry.reregister(&mut self.stream, token, self.wanted_interest())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl TcpSocket {
    /// Moves this socket behind an `Rc<RefCell<_>>` so it can be registered
    /// with the reactor (via [`TcpSocket::register`]) while an
    /// [`HttpConnection`](crate::http::connection) or similar owner keeps a
    /// second, [`Socket`]-typed handle to the same instance — the same cell
    /// this wrapper's own `inner` is built from when [`super::tls::TlsSocket`]
    /// sits on top of it, with [`super::tls::SharedTlsSocket`] handed to
    /// whatever sits above that.
    pub fn into_shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Registers `socket` with `reactor`, returning the assigned token.
    pub fn register(reactor: &mut Reactor, socket: Rc<RefCell<Self>>) -> io::Result<Token> {
        reactor.register_target(Self::into_event_target(socket))
    }

    /// Wraps `socket` as an `EventTarget` without registering it yet, for
    /// callers (e.g. `HttpClient::send`'s connect callback) that only learn
    /// they need to register a target from inside a reactor callback that
    /// itself hands the target back rather than taking `&mut Reactor`
    /// directly — see `Reactor::connect`.
    pub fn into_event_target(socket: Rc<RefCell<Self>>) -> Box<dyn EventTarget> {
        Box::new(TcpEventTarget(socket))
    }
}

/// Thin `EventTarget` handed to the reactor in place of `TcpSocket` itself,
/// so a second `Rc` clone can remain outside the slab as a `Socket` handle.
/// See [`TcpSocket::into_shared`].
struct TcpEventTarget(Rc<RefCell<TcpSocket>>);

impl EventTarget for TcpEventTarget {
    fn on_readable(&mut self) {
        self.0.borrow_mut().on_readable();
    }

    fn on_writable(&mut self) {
        self.0.borrow_mut().on_writable();
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.0.borrow_mut().register(registry, token)
    }

    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.borrow_mut().reregister(registry)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.borrow_mut().deregister(registry)
    }

    fn is_closed(&self) -> bool {
        self.0.borrow().is_closed()
    }
}

/// A [`Socket`] handle over a `TcpSocket` registered via
/// [`TcpSocket::register`]. Cheap to clone; every clone forwards to the same
/// underlying socket.
#[derive(Clone)]
pub struct SharedTcpSocket(pub Rc<RefCell<TcpSocket>>);

impl Socket for SharedTcpSocket {
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
