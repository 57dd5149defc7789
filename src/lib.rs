//! Single-threaded cooperative event loop, TLS adapter, and HTTP/1.1
//! connection state machine.
//!
//! [`reactor`] drives everything: one `mio::Poll`, a local task queue, a
//! mutex-guarded cross-thread queue, and a scheduled-task heap, all serviced
//! from one thread. [`net`] supplies the plain and TLS byte-socket
//! abstraction the reactor multiplexes. [`http`] builds the HTTP/1.1
//! request/response parsers and connection state machines (both server and
//! client) on top of that socket layer. [`acceptor`] wires a blocking accept
//! loop to a pool of reactor-owning worker threads, generalizing the way the
//! original single-reactor design scales past one core.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod reactor;

pub use config::Config;
pub use reactor::{Handle, Reactor, Remote};
