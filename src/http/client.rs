//! HTTP/1.1 client connection, plus [`HttpClient`], the address-indexed
//! front door that reuses keep-alive connections instead of reconnecting per
//! request.
//!
//! Driven by [`Socket`]/[`SocketHandler`] rather than talking to a stream
//! directly, the same way the server side is, so plain and TLS connections
//! are indistinguishable once established. The shape here follows
//! [`super::connection::HttpServerConnection`]'s read/parse/dispatch loop
//! mirrored for the opposite direction.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;

use crate::config::Config;
use crate::error::RequestError;
use crate::net::{Socket, SocketHandler, SharedTcpSocket, SharedTlsSocket, TcpSocket, TlsSocket};
use crate::reactor::{BufferPool, CancelHandle, Handle, PoolBuffer, Reactor};

use super::message::{Request, Response};
use super::method::Method;
use super::parser::ParserLimits;
use super::response_parser::ResponseParser;

/// TLS parameters for an outbound connection. Absent means plain TCP.
#[derive(Clone)]
pub struct ClientTlsTarget {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

type ResponseCallback = Box<dyn FnOnce(Result<Response, RequestError>)>;
type IdleBucket = Rc<RefCell<VecDeque<Weak<RefCell<HttpClientConnection>>>>>;

/// Address-indexed front door for outbound HTTP requests. Connections that
/// complete a keep-alive response are parked here, reset and ready to reuse,
/// and handed back out before a fresh `connect()` is attempted.
pub struct HttpClient {
    config: Config,
    idle: HashMap<SocketAddr, IdleBucket>,
}

impl HttpClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            idle: HashMap::new(),
        }
    }

    fn bucket(&mut self, addr: SocketAddr) -> IdleBucket {
        self.idle
            .entry(addr)
            .or_insert_with(|| Rc::new(RefCell::new(VecDeque::new())))
            .clone()
    }

    /// Takes a still-usable parked connection for `addr`, if any. Entries
    /// that closed while idle (remote hung up on a pooled connection) are
    /// dropped as encountered rather than handed back.
    fn take_idle(&mut self, addr: SocketAddr) -> Option<Rc<RefCell<HttpClientConnection>>> {
        let bucket = self.idle.get(&addr)?;
        loop {
            let weak = bucket.borrow_mut().pop_front()?;
            if let Some(conn) = weak.upgrade() {
                if !conn.borrow().closing {
                    return Some(conn);
                }
            }
        }
    }

    /// Sends `request` to `addr`, reusing a pooled keep-alive connection
    /// when one is available and connecting fresh otherwise. `callback`
    /// fires exactly once: with the response, a timeout, or a connection
    /// error.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        reactor: &mut Reactor,
        handle: Handle,
        addr: SocketAddr,
        tls: Option<ClientTlsTarget>,
        request: Request,
        timeout: Duration,
        callback: impl FnOnce(Result<Response, RequestError>) + 'static,
    ) {
        if let Some(conn) = self.take_idle(addr) {
            conn.borrow_mut()
                .start_request(handle, request, timeout, Box::new(callback));
            return;
        }

        let bucket = self.bucket(addr);
        let config = self.config.clone();
        let connect_timeout = self.config.connect_timeout;
        let connect_result = reactor.connect(addr, connect_timeout, move |result| {
            let stream = match result {
                Ok(stream) => stream,
                Err(e) => {
                    callback(Err(RequestError::Io(e)));
                    return None;
                }
            };

            let (socket, target): (Box<dyn Socket>, Box<dyn crate::reactor::EventTarget>) =
                match build_client_socket(stream, &tls, &config, handle.clone()) {
                    Ok(pair) => pair,
                    Err(e) => {
                        callback(Err(RequestError::Io(e)));
                        return None;
                    }
                };

            let conn = HttpClientConnection::new(socket, &config, bucket, addr);
            let app_handler: Rc<RefCell<dyn SocketHandler>> = conn.clone();
            conn.borrow_mut().socket.set_handler(app_handler);
            conn.borrow_mut()
                .start_request(handle, request, timeout, Box::new(callback));
            Some(target)
        });

        if let Err(e) = connect_result {
            log::warn!("http client: connect to {addr} failed immediately: {e}");
        }
    }
}

fn build_client_socket(
    stream: MioTcpStream,
    tls: &Option<ClientTlsTarget>,
    config: &Config,
    handle: Handle,
) -> std::io::Result<(Box<dyn Socket>, Box<dyn crate::reactor::EventTarget>)> {
    match tls {
        Some(target) => {
            let tls_socket = TlsSocket::new_client(
                stream,
                target.config.clone(),
                target.server_name.clone(),
                config.clone(),
                handle,
            )
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let socket = Box::new(SharedTlsSocket(tls_socket.clone()));
            let event_target = TlsSocket::into_event_target(tls_socket);
            Ok((socket, event_target))
        }
        None => {
            let tcp_socket = TcpSocket::from_accepted(stream, config.clone()).into_shared();
            let socket = Box::new(SharedTcpSocket(tcp_socket.clone()));
            let event_target = TcpSocket::into_event_target(tcp_socket);
            Ok((socket, event_target))
        }
    }
}

struct PendingRequest {
    head_request: bool,
    callback: ResponseCallback,
}

/// One outbound connection driving zero-or-one requests at a time: no
/// pipelining on the client side — a request completes before the
/// connection either parks or serves the next `send`.
struct HttpClientConnection {
    socket: Box<dyn Socket>,
    parser: ResponseParser,
    pool: BufferPool,
    pending: Option<PendingRequest>,
    timeout_handle: Option<CancelHandle>,
    idle_bucket: IdleBucket,
    addr: SocketAddr,
    awaiting_first_write: bool,
    closing: bool,
    self_weak: Weak<RefCell<HttpClientConnection>>,
}

impl HttpClientConnection {
    fn new(
        socket: Box<dyn Socket>,
        config: &Config,
        idle_bucket: IdleBucket,
        addr: SocketAddr,
    ) -> Rc<RefCell<Self>> {
        let limits = ParserLimits {
            max_header_line_size: config.max_header_line_size,
            max_headers: config.max_headers,
            max_message_size: config.max_http_message_size,
        };
        let conn = Rc::new(RefCell::new(Self {
            socket,
            parser: ResponseParser::new(limits),
            pool: BufferPool::new(config.buf_pool_cap),
            pending: None,
            timeout_handle: None,
            idle_bucket,
            addr,
            awaiting_first_write: false,
            closing: false,
            self_weak: Weak::new(),
        }));
        conn.borrow_mut().self_weak = Rc::downgrade(&conn);
        conn
    }

    fn start_request(
        &mut self,
        handle: Handle,
        request: Request,
        timeout: Duration,
        callback: ResponseCallback,
    ) {
        let head_request = request.method == Method::Head;
        self.parser.begin_request(head_request);
        self.pending = Some(PendingRequest {
            head_request,
            callback,
        });

        let bytes = request.serialize();
        let mut buf = self.pool.allocate(bytes.len());
        buf.extend_from_slice(&bytes);
        self.socket.write(buf);
        self.awaiting_first_write = true;

        let weak = self.self_weak.clone();
        let deadline = std::time::Instant::now() + timeout;
        self.timeout_handle = Some(handle.schedule(deadline, move || {
            if let Some(conn) = weak.upgrade() {
                conn.borrow_mut().on_timeout();
            }
        }));
    }

    fn on_timeout(&mut self) {
        if self.pending.is_none() {
            return;
        }
        self.complete_with(Err(RequestError::Timeout));
        self.close();
    }

    fn complete_with(&mut self, result: Result<Response, RequestError>) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.cancel();
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        let keep_alive = match &result {
            Ok(resp) if !self.closing => {
                !resp.headers.connection_close()
                    && (resp.version.keep_alive_by_default() || resp.headers.connection_keep_alive())
            }
            _ => false,
        };
        (pending.callback)(result);
        if keep_alive {
            self.park();
        } else {
            self.close();
        }
    }

    fn park(&mut self) {
        self.idle_bucket.borrow_mut().push_back(self.self_weak.clone());
        self.socket.read();
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        if let Some(handle) = self.timeout_handle.take() {
            handle.cancel();
        }
        self.socket.close();
    }

    fn pump_parser(&mut self) {
        loop {
            match self.parser.advance() {
                Ok(Some(response)) => {
                    self.complete_with(Ok(response));
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    self.complete_with(Err(RequestError::Parse(e)));
                    self.close();
                    return;
                }
            }
        }
    }
}

impl SocketHandler for HttpClientConnection {
    fn on_registered(&mut self) {}

    fn on_read(&mut self, buf: PoolBuffer) {
        if self.closing {
            return;
        }
        self.parser.feed(buf.as_read_slice());
        self.pool.recycle(buf);
        self.pump_parser();
    }

    fn on_read_end_of_stream(&mut self) {
        if let Some(response) = self.parser.notify_eof() {
            self.complete_with(Ok(response));
            self.close();
            return;
        }
        if self.pending.is_some() {
            self.complete_with(Err(RequestError::ConnectionClosed));
        }
        self.close();
    }

    fn on_write(&mut self) {
        if self.closing {
            return;
        }
        if self.awaiting_first_write {
            self.awaiting_first_write = false;
            self.socket.read();
        }
    }

    fn on_closed_with_error(&mut self, err: std::io::Error) {
        if self.pending.is_some() {
            self.complete_with(Err(RequestError::Io(err)));
        }
        self.closing = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::status::Status;

    #[test]
    fn idle_bucket_round_trips_a_weak_handle() {
        let bucket: IdleBucket = Rc::new(RefCell::new(VecDeque::new()));
        let config = Config::default();
        let socket = Box::new(NullSocket);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = HttpClientConnection::new(socket, &config, bucket.clone(), addr);
        conn.borrow_mut().park();
        assert_eq!(bucket.borrow().len(), 1);
        let got = bucket.borrow_mut().pop_front().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&got, &conn));
    }

    #[test]
    fn completing_a_close_response_does_not_park() {
        let bucket: IdleBucket = Rc::new(RefCell::new(VecDeque::new()));
        let config = Config::default();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = HttpClientConnection::new(Box::new(NullSocket), &config, bucket.clone(), addr);
        conn.borrow_mut().pending = Some(PendingRequest {
            head_request: false,
            callback: Box::new(|_| {}),
        });
        let response = Response::new(Status::OK).header("connection", "close");
        conn.borrow_mut().complete_with(Ok(response));
        assert!(bucket.borrow().is_empty());
        assert!(conn.borrow().closing);
    }

    struct NullSocket;
    impl Socket for NullSocket {
        fn set_handler(&mut self, _handler: Rc<RefCell<dyn SocketHandler>>) {}
        fn read(&mut self) {}
        fn write(&mut self, _buf: PoolBuffer) {}
        fn write_end_of_stream(&mut self) {}
        fn close(&mut self) {}
        fn remote_addr(&self) -> std::io::Result<SocketAddr> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "null"))
        }
    }
}
