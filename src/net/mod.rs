//! Byte-socket layer: the `Socket`/`SocketHandler` contract and the two
//! concrete sockets (`TcpSocket`, `TlsSocket`) that implement it.
//!
//! An earlier draft of this crate carried a generic `TcpStream`/
//! `TcpListener` trait pair abstracting over `mio::net` and `std::net`
//! alike. Nothing here ends up needing that genericity — `TcpSocket` drives
//! `mio::net::TcpStream` directly, and the loopback integration tests
//! exercise it the same way production code does, over a real `Reactor` —
//! so the trait pair was dropped rather than carried as unused indirection.
//! See `DESIGN.md`.

pub mod socket;
pub mod tcp_socket;
pub mod tls;

pub use socket::{Socket, SocketHandler};
pub use tcp_socket::{SharedTcpSocket, TcpSocket};
pub use tls::{SharedTlsSocket, TlsSocket};
