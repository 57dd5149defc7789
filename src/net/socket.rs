//! The byte-socket interface: four events delivered to a handler, and four
//! commands a handler (or application code) issues.
//!
//! Two concrete implementations share this interface: [`super::tcp_socket::TcpSocket`]
//! talks to the kernel directly; [`super::tls::TlsSocket`] wraps an inner
//! `Socket` (almost always a `TcpSocket`) and presents the identical
//! contract to whatever sits above it. An `HttpConnection` never needs to
//! know which one it has. The socket holds the handler, the handler holds
//! the socket — modeled here as two distinct traits over the same
//! connection object rather than one type implementing both (which would
//! make "the socket calls its own methods" an accidental possibility).

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::reactor::PoolBuffer;

/// Events delivered to whatever is registered via [`Socket::set_handler`].
///
/// Invariant: the sequence of calls any handler sees matches
/// `on_registered (on_read | on_write)* (on_read_end_of_stream)?
/// (on_closed_with_error)?`, with at most one terminal
/// `on_closed_with_error` and nothing after it.
pub trait SocketHandler {
    fn on_registered(&mut self);
    fn on_read(&mut self, buf: PoolBuffer);
    fn on_read_end_of_stream(&mut self);
    fn on_write(&mut self);
    fn on_closed_with_error(&mut self, err: io::Error);
}

/// Commands a handler (or application code holding a `Socket` directly, e.g.
/// a freshly-accepted connection before any handler is attached) can issue.
pub trait Socket {
    /// Attaches the handler that will receive this socket's events. Called
    /// once, before the socket is registered with the reactor.
    fn set_handler(&mut self, handler: Rc<RefCell<dyn SocketHandler>>);

    /// Declares read interest. A later event (`on_read`, `on_read_end_of_stream`,
    /// or `on_closed_with_error`) delivers the result.
    fn read(&mut self);

    /// Takes ownership of `buf` and queues it for writing. Call order is
    /// preserved on the wire.
    fn write(&mut self, buf: PoolBuffer);

    /// Requests the output half be shut down once queued writes drain.
    fn write_end_of_stream(&mut self);

    /// Tears the connection down. Idempotent — closing twice is a no-op the
    /// second time. No further events fire after this returns.
    fn close(&mut self);

    fn remote_addr(&self) -> io::Result<SocketAddr>;
}
