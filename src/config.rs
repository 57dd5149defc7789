//! Construction-time configuration knobs.
//!
//! There is no environment or CLI parsing at this layer; surrounding shells
//! are expected to build a `Config` from whatever source they like and hand
//! it to a [`crate::reactor::Reactor`] or [`crate::acceptor::Acceptor`].

use std::sync::Arc;
use std::time::Duration;

use threadpool::ThreadPool;

const KB: usize = 1024;

/// Runtime-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-read allocation for a plain TCP socket.
    pub receive_buffer_size: usize,
    /// Max small-buffer coalesce size on a socket write.
    pub merge_limit: usize,
    /// Idle-in-pool cutoff for server-side keep-alive connections.
    pub keep_alive_timeout: Duration,
    /// Reject requests/responses larger than this with a protocol error.
    pub max_http_message_size: usize,
    /// Per-line cap while scanning headers.
    pub max_header_line_size: usize,
    /// Maximum number of headers accepted per message.
    pub max_headers: usize,
    /// Client connect cutoff.
    pub connect_timeout: Duration,
    /// Upper bound on bytes retained by the reactor's buffer pool. `None`
    /// disables the bound (recycled buffers are always retained).
    pub buf_pool_cap: Option<usize>,
    /// Shared executor for TLS delegated tasks (certificate verification
    /// callbacks that choose to block). Cloned cheaply; shareable across
    /// reactors.
    pub tls_executor: Arc<ThreadPool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receive_buffer_size: 16 * KB,
            merge_limit: 16 * KB,
            keep_alive_timeout: Duration::from_secs(30),
            max_http_message_size: usize::MAX,
            max_header_line_size: 8 * KB,
            max_headers: 100,
            connect_timeout: Duration::from_secs(10),
            buf_pool_cap: None,
            tls_executor: Arc::new(ThreadPool::new(2)),
        }
    }
}

impl Config {
    /// Convenience constructor matching every default except
    /// `max_http_message_size`, which is the one knob every production
    /// deployment overrides.
    pub fn with_max_message_size(max_http_message_size: usize) -> Self {
        Self {
            max_http_message_size,
            ..Self::default()
        }
    }
}
