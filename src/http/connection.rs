//! Server-side HTTP/1.1 connection state machine: read, parse, hand off to
//! application code, write a response. Runs entirely on the owning
//! reactor's thread, since `HttpConnection` is itself a
//! [`crate::net::SocketHandler`] sitting directly on top of a
//! [`crate::net::Socket`] (plain or TLS) the same way `TlsSocket` sits on
//! top of a `TcpSocket`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::config::Config;
use crate::net::{Socket, SocketHandler};
use crate::reactor::{BufferPool, Handle, PoolBuffer};

use super::gzip;
use super::keepalive::{Handle as KeepAliveHandle, KeepAlivePool};
use super::message::{Request, Response};
use super::parser::{ParserLimits, RequestParser};
use super::status::Status;

/// What a server hands to application code for each parsed request.
/// `respond` must be called exactly once, with either a response or an
/// error to be rendered via the installed [`ExceptionFormatter`].
pub trait Servlet {
    fn serve(&self, request: Request, respond: ServletReply);
}

/// One-shot callback a [`Servlet`] invokes to complete a request.
pub struct ServletReply {
    inner: Box<dyn FnOnce(Result<Response, Box<dyn std::error::Error>>)>,
}

impl ServletReply {
    fn new(inner: Box<dyn FnOnce(Result<Response, Box<dyn std::error::Error>>)>) -> Self {
        Self { inner }
    }

    pub fn respond(self, response: Response) {
        (self.inner)(Ok(response));
    }

    pub fn fail(self, error: impl std::error::Error + 'static) {
        (self.inner)(Err(Box::new(error)));
    }
}

/// Maps a servlet-thrown error to an HTTP response. Default: 500 for
/// anything, since application errors at this layer carry no more specific
/// classification.
pub trait ExceptionFormatter {
    fn format(&self, error: &(dyn std::error::Error + 'static)) -> Response;
}

pub struct DefaultExceptionFormatter;

impl ExceptionFormatter for DefaultExceptionFormatter {
    fn format(&self, error: &(dyn std::error::Error + 'static)) -> Response {
        Response::new(Status::INTERNAL_SERVER_ERROR).body(format!("{error}").into_bytes())
    }
}

/// Shared, per-listener keep-alive bookkeeping: the intrusive pool plus a
/// lookup from pool id back to the connection, so the background sweep
/// (runs roughly once a second) can close whatever it evicts.
pub struct KeepAliveRegistry {
    pool: KeepAlivePool,
    connections: slab::Slab<Weak<RefCell<HttpServerConnection>>>,
    timeout: Duration,
}

impl KeepAliveRegistry {
    pub fn new(timeout: Duration) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            pool: KeepAlivePool::new(),
            connections: slab::Slab::new(),
            timeout,
        }))
    }

    /// Schedules the periodic sweep on `handle`'s reactor, roughly once a
    /// second. The task reschedules itself as long as
    /// the registry is still reachable, and runs as a background task so it
    /// never by itself keeps an otherwise-idle reactor alive.
    ///
    /// Takes `registry` by reference rather than as a `self` receiver:
    /// stable Rust only special-cases `Rc<Self>`/`Arc<Self>` (not
    /// `&Rc<RefCell<Self>>`) as a `self` type, so this stays a plain
    /// associated function.
    pub fn start_sweeping(registry: &Rc<RefCell<Self>>, handle: Handle) {
        let weak = Rc::downgrade(registry);
        Self::schedule_tick(handle, weak);
    }

    fn schedule_tick(handle: Handle, weak: std::rc::Weak<RefCell<Self>>) {
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let next_handle = handle.clone();
        handle.schedule_background(deadline, move || {
            if let Some(registry) = weak.upgrade() {
                registry.borrow_mut().sweep_now();
                Self::schedule_tick(next_handle, Rc::downgrade(&registry));
            }
        });
    }

    fn sweep_now(&mut self) {
        let now = std::time::Instant::now();
        for id in self.pool.sweep_expired(now) {
            if let Some(weak) = self.connections.try_remove(id) {
                if let Some(conn) = weak.upgrade() {
                    conn.borrow_mut().close();
                }
            }
        }
    }

    fn park(&mut self, conn: Weak<RefCell<HttpServerConnection>>, now: std::time::Instant) -> (usize, KeepAliveHandle) {
        let id = self.connections.insert(conn);
        let handle = self.pool.insert(id, now + self.timeout);
        (id, handle)
    }

    fn unpark(&mut self, id: usize, handle: KeepAliveHandle) {
        self.pool.remove(handle);
        self.connections.try_remove(id);
    }
}

enum ParkedState {
    Active,
    Idle { id: usize, handle: KeepAliveHandle },
}

/// One accepted server-side connection. Implements [`SocketHandler`] for
/// whatever [`Socket`] it sits on (plain or TLS — see
/// [`crate::net::SharedTcpSocket`]/[`crate::net::SharedTlsSocket`]) and owns
/// that socket in turn, mirroring the cyclic socket/handler relationship
/// `Socket`/`SocketHandler` implementations generally share.
pub struct HttpServerConnection {
    socket: Box<dyn Socket>,
    parser: RequestParser,
    servlet: Rc<dyn Servlet>,
    formatter: Rc<dyn ExceptionFormatter>,
    pool: BufferPool,
    keepalive: Option<Rc<RefCell<KeepAliveRegistry>>>,
    parked: ParkedState,
    awaiting_servlet: bool,
    closing: bool,
    self_weak: Weak<RefCell<HttpServerConnection>>,
    min_gzip_size: Option<usize>,
    handle: Handle,
}

impl HttpServerConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        socket: Box<dyn Socket>,
        servlet: Rc<dyn Servlet>,
        formatter: Rc<dyn ExceptionFormatter>,
        config: &Config,
        keepalive: Option<Rc<RefCell<KeepAliveRegistry>>>,
        min_gzip_size: Option<usize>,
        handle: Handle,
    ) -> Rc<RefCell<Self>> {
        let limits = ParserLimits {
            max_header_line_size: config.max_header_line_size,
            max_headers: config.max_headers,
            max_message_size: config.max_http_message_size,
        };
        let conn = Rc::new(RefCell::new(Self {
            socket,
            parser: RequestParser::new(limits),
            servlet,
            formatter,
            pool: BufferPool::new(config.buf_pool_cap),
            keepalive,
            parked: ParkedState::Active,
            awaiting_servlet: false,
            closing: false,
            self_weak: Weak::new(),
            min_gzip_size,
            handle,
        }));
        conn.borrow_mut().self_weak = Rc::downgrade(&conn);
        let handler: Rc<RefCell<dyn SocketHandler>> = conn.clone();
        conn.borrow_mut().socket.set_handler(handler);
        conn
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.unpark();
        self.socket.close();
    }

    fn unpark(&mut self) {
        if let ParkedState::Idle { id, handle } = std::mem::replace(&mut self.parked, ParkedState::Active) {
            if let Some(registry) = &self.keepalive {
                registry.borrow_mut().unpark(id, handle);
            }
        }
    }

    fn pump_parser(&mut self) {
        loop {
            if self.closing || self.awaiting_servlet {
                return;
            }
            match self.parser.advance() {
                Ok(Some(request)) => self.dispatch(request),
                Ok(None) => return,
                Err(_err) => {
                    // Protocol errors close without a synthesized response.
                    log::warn!("http: protocol error, closing connection");
                    self.close();
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, request: Request) {
        self.unpark();
        self.awaiting_servlet = true;
        let keep_alive = request.wants_keep_alive();
        let accept_encoding = request.headers.get("accept-encoding").map(str::to_owned);
        let Some(weak) = self.self_weak.upgrade() else {
            return;
        };
        let weak_ref = Rc::downgrade(&weak);
        let handle = self.handle.clone();
        // A synchronous servlet calls `respond` before `serve` returns,
        // which would otherwise re-enter this connection's `RefCell` (still
        // borrowed by the `on_read` frame further up the stack) and the
        // underlying socket's `RefCell` (still borrowed by the reactor's
        // dispatch of the readable event). Posting defers the reply to the
        // next tick, once both borrows have been released.
        let reply = ServletReply::new(Box::new(move |result| {
            handle.post(move || {
                let Some(conn) = weak_ref.upgrade() else {
                    return;
                };
                conn.borrow_mut()
                    .on_servlet_reply(result, keep_alive, accept_encoding.as_deref());
            });
        }));
        self.servlet.serve(request, reply);
    }

    fn on_servlet_reply(
        &mut self,
        result: Result<Response, Box<dyn std::error::Error>>,
        keep_alive: bool,
        accept_encoding: Option<&str>,
    ) {
        if self.closing {
            return;
        }
        self.awaiting_servlet = false;
        let response = match result {
            Ok(r) => r,
            Err(e) => self.formatter.format(e.as_ref()),
        };
        let response = match self.min_gzip_size {
            Some(min) => gzip::compress_if_acceptable(response, accept_encoding, min)
                .unwrap_or_else(|_| Response::new(Status::INTERNAL_SERVER_ERROR)),
            None => response,
        };
        self.send_response(response, keep_alive);
    }

    fn send_response(&mut self, mut response: Response, keep_alive: bool) {
        if keep_alive {
            response = response.header("connection", "keep-alive");
        } else {
            response = response.header("connection", "close");
        }
        let bytes = response.serialize();
        let mut buf = self.pool.allocate(bytes.len());
        buf.extend_from_slice(&bytes);
        self.socket.write(buf);

        if !keep_alive {
            self.socket.write_end_of_stream();
            self.closing = true; // no further requests accepted; socket closes once the write drains.
            return;
        }

        if let Some(registry) = self.keepalive.clone() {
            let now = std::time::Instant::now();
            let (id, handle) = registry.borrow_mut().park(self.self_weak.clone(), now);
            self.parked = ParkedState::Idle { id, handle };
        }
        self.pump_parser();
    }
}

impl SocketHandler for HttpServerConnection {
    fn on_registered(&mut self) {
        self.socket.read();
    }

    fn on_read(&mut self, buf: PoolBuffer) {
        if self.closing {
            return;
        }
        self.parser.feed(buf.as_read_slice());
        self.pool.recycle(buf);
        self.pump_parser();
        if !self.closing {
            self.socket.read();
        }
    }

    fn on_read_end_of_stream(&mut self) {
        self.close();
    }

    fn on_write(&mut self) {
        if self.closing && !self.awaiting_servlet {
            // Non-keep-alive response has drained; tear down.
            self.socket.close();
        }
    }

    fn on_closed_with_error(&mut self, err: std::io::Error) {
        log::debug!("http: connection closed with error: {err}");
        self.closing = true;
        self.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::method::Method;

    struct EchoServlet;
    impl Servlet for EchoServlet {
        fn serve(&self, request: Request, respond: ServletReply) {
            let body = request.target.into_bytes();
            respond.respond(Response::new(Status::OK).body(body));
        }
    }

    #[test]
    fn servlet_reply_carries_response_through_closure() {
        let servlet = EchoServlet;
        let (tx, rx) = std::sync::mpsc::channel();
        let reply = ServletReply::new(Box::new(move |result| {
            tx.send(result.is_ok()).unwrap();
        }));
        servlet.serve(
            Request {
                method: Method::Get,
                target: "/abc".into(),
                version: super::super::version::Version::Http11,
                headers: super::super::message::Headers::new(),
                body: Vec::new(),
            },
            reply,
        );
        assert!(rx.recv().unwrap());
    }
}
