//! The single-threaded cooperative event loop.
//!
//! A `mio::Poll`, a `slab::Slab` of registered connections indexed by
//! `Token`, and a loop that dispatches readiness to whichever object is
//! registered under a token, plus a local task FIFO, a mutex-guarded
//! cross-thread queue, a scheduled-task min-heap (foreground and
//! background), and a buffer pool, all driven from one `run()` loop.

pub mod buffer_pool;
pub mod tasks;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::config::Config;
use crate::net::tcp_socket::TcpSocket;
pub use buffer_pool::{BufferPool, PoolBuffer};
pub use tasks::CancelHandle;
use tasks::ScheduleHeap;

const WAKE_TOKEN: Token = Token(usize::MAX);
const FIRST_DYNAMIC_TOKEN: usize = 0;

/// What the per-socket `EventTarget` driven by the reactor's poll loop must
/// expose. Implemented by `TcpSocket` directly and forwarded-to by
/// `TlsSocket` (which owns a `TcpSocket` but adds no mio registration of its
/// own — see `net::tls`).
pub trait EventTarget {
    fn on_readable(&mut self);
    fn on_writable(&mut self);
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;
    fn reregister(&mut self, registry: &Registry) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    fn is_closed(&self) -> bool;
}

enum Slot {
    Listener {
        inner: MioTcpListener,
        accept_cb: Box<dyn FnMut(MioTcpStream, SocketAddr) -> Option<Box<dyn EventTarget>>>,
    },
    Connecting {
        inner: MioTcpStream,
        cb: Box<dyn FnOnce(io::Result<MioTcpStream>) -> Option<Box<dyn EventTarget>>>,
        deadline: Instant,
    },
    Io(Box<dyn EventTarget>),
}

/// What fatal errors do once control returns to the reactor's own run loop
/// (as opposed to recoverable per-socket I/O errors, which always flow
/// through `on_closed_with_error`).
pub enum FatalAction {
    /// Log and keep the loop alive.
    Continue,
    /// Stop the loop cleanly.
    Shutdown,
    /// Panic the loop thread.
    Rethrow,
}

type FatalHandler = Box<dyn FnMut(&dyn std::error::Error) -> FatalAction>;

/// Cheap, cloneable, same-thread handle for posting local work and
/// scheduling tasks from code that does not own the `Reactor` itself
/// (sockets, the TLS adapter, HTTP connections). Not `Send` — cross-thread
/// callers use [`Remote`] instead.
#[derive(Clone)]
pub struct Handle {
    local: Rc<RefCell<VecDeque<tasks::Task>>>,
    scheduled: Rc<RefCell<ScheduleHeap>>,
    background_scheduled: Rc<RefCell<ScheduleHeap>>,
    remote: Remote,
}

impl Handle {
    /// Enqueues `task` to run before the next I/O poll, in FIFO order with
    /// other locally-posted tasks of the current tick.
    pub fn post<F: FnOnce() + 'static>(&self, task: F) {
        self.local.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `task` to run once `now >= deadline`, same as
    /// [`Reactor::schedule`] but callable from code (a socket, an
    /// `HttpConnection`) that only holds a `Handle`.
    pub fn schedule<F: FnOnce() + 'static>(&self, deadline: Instant, task: F) -> CancelHandle {
        self.scheduled.borrow_mut().push(deadline, Box::new(task))
    }

    /// Like `schedule`, but the loop may exit while only background tasks
    /// remain — used for recurring housekeeping like the keep-alive sweep.
    pub fn schedule_background<F: FnOnce() + 'static>(
        &self,
        deadline: Instant,
        task: F,
    ) -> CancelHandle {
        self.background_scheduled
            .borrow_mut()
            .push(deadline, Box::new(task))
    }

    /// Splits off the thread-safe half of this handle, for code that needs
    /// to post work back from another thread (e.g. a TLS delegated task
    /// completing on the `tls_executor`).
    pub fn remote(&self) -> Remote {
        self.remote.clone()
    }
}

/// The thread-safe half of a reactor handle: `execute()` and nothing else.
/// This is the *only* shared mutable state a foreign thread touches,
/// guarded by a single mutex.
#[derive(Clone)]
pub struct Remote {
    concurrent: Arc<Mutex<VecDeque<Box<dyn FnOnce() + Send>>>>,
    waker: Arc<Waker>,
}

impl Remote {
    /// Enqueues `task` to run on the reactor thread and wakes the poller.
    /// Thread-safe. Tasks run, relative to each other, in enqueue order,
    /// after the current tick's locally-posted tasks.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.concurrent.lock().unwrap().push_back(Box::new(task));
        let _ = self.waker.wake();
    }
}

/// Per-tick statistics, useful for long-loop detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub local_tasks_run: usize,
    pub concurrent_tasks_run: usize,
    pub scheduled_tasks_run: usize,
    pub io_events_dispatched: usize,
    pub tick_duration: Duration,
}

/// The event loop itself. Created once per loop thread; `run()` blocks the
/// calling thread until the loop empties (no non-background work remains)
/// or `stop()` is called.
pub struct Reactor {
    poll: Poll,
    now: Instant,
    local: Rc<RefCell<VecDeque<tasks::Task>>>,
    concurrent: Arc<Mutex<VecDeque<Box<dyn FnOnce() + Send>>>>,
    waker: Arc<Waker>,
    scheduled: Rc<RefCell<ScheduleHeap>>,
    background_scheduled: Rc<RefCell<ScheduleHeap>>,
    buf_pool: BufferPool,
    slots: Slab<Slot>,
    fatal_handler: Option<FatalHandler>,
    stopped: bool,
    config: Config,
}

impl Reactor {
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let buf_pool = BufferPool::new(config.buf_pool_cap);
        Ok(Self {
            poll,
            now: Instant::now(),
            local: Rc::new(RefCell::new(VecDeque::new())),
            concurrent: Arc::new(Mutex::new(VecDeque::new())),
            waker,
            scheduled: Rc::new(RefCell::new(ScheduleHeap::default())),
            background_scheduled: Rc::new(RefCell::new(ScheduleHeap::default())),
            buf_pool,
            slots: Slab::with_capacity(FIRST_DYNAMIC_TOKEN.max(1024)),
            fatal_handler: None,
            stopped: false,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_fatal_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&dyn std::error::Error) -> FatalAction + 'static,
    {
        self.fatal_handler = Some(Box::new(handler));
    }

    /// A same-thread handle usable from callbacks running on this reactor.
    pub fn handle(&self) -> Handle {
        Handle {
            local: self.local.clone(),
            scheduled: self.scheduled.clone(),
            background_scheduled: self.background_scheduled.clone(),
            remote: self.remote(),
        }
    }

    /// The thread-safe half, for handing to other threads up front.
    pub fn remote(&self) -> Remote {
        Remote {
            concurrent: self.concurrent.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn buf_pool_mut(&mut self) -> &mut BufferPool {
        &mut self.buf_pool
    }

    /// Wall clock cached once per tick; cheap enough to call from anywhere
    /// during a tick without worrying about syscall overhead.
    pub fn current_time(&self) -> Instant {
        self.now
    }

    /// Enqueues a same-thread task, FIFO, before the next poll.
    pub fn post<F: FnOnce() + 'static>(&self, task: F) {
        self.local.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `task` to run once `now >= deadline`. Keeps the loop alive
    /// while pending.
    pub fn schedule<F: FnOnce() + 'static>(&mut self, deadline: Instant, task: F) -> CancelHandle {
        self.scheduled.borrow_mut().push(deadline, Box::new(task))
    }

    /// Like `schedule`, but does not by itself keep `run()` from returning
    /// once all non-background work is exhausted.
    pub fn schedule_background<F: FnOnce() + 'static>(
        &mut self,
        deadline: Instant,
        task: F,
    ) -> CancelHandle {
        self.background_scheduled
            .borrow_mut()
            .push(deadline, Box::new(task))
    }

    /// Registers a listening socket; `accept_cb` fires once per accepted
    /// connection with the raw stream and its peer address, and returns the
    /// `EventTarget` (a `TcpSocket` or `TlsSocket` wrapper) the reactor
    /// should register on the caller's behalf — the callback itself has no
    /// way to touch `self.slots`, so registration happens here instead of in
    /// caller code, the same way `register_target` does it.
    pub fn listen<F>(&mut self, addr: SocketAddr, accept_cb: F) -> io::Result<Token>
    where
        F: FnMut(MioTcpStream, SocketAddr) -> Option<Box<dyn EventTarget>> + 'static,
    {
        let mut listener = MioTcpListener::bind(addr)?;
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        entry.insert(Slot::Listener {
            inner: listener,
            accept_cb: Box::new(accept_cb),
        });
        Ok(token)
    }

    /// Non-blocking connect. `cb` fires exactly once: with a connected
    /// stream, or an error (including the connect timeout). On success `cb`
    /// returns the `EventTarget` to register over the new stream (typically
    /// a freshly-wrapped `TcpSocket`/`TlsSocket`); returning `None` drops the
    /// stream without registering anything.
    pub fn connect<F>(&mut self, addr: SocketAddr, timeout: Duration, cb: F) -> io::Result<Token>
    where
        F: FnOnce(io::Result<MioTcpStream>) -> Option<Box<dyn EventTarget>> + 'static,
    {
        let mut stream = MioTcpStream::connect(addr)?;
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)?;

        entry.insert(Slot::Connecting {
            inner: stream,
            cb: Box::new(cb),
            deadline: self.now + timeout,
        });
        Ok(token)
    }

    /// Checked once per tick: any `Connecting` slot whose deadline has
    /// passed is torn down and its callback fired with a timeout error,
    /// without waiting for a write-ready event that may never come.
    fn sweep_connect_timeouts(&mut self) {
        let timed_out: Vec<Token> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Connecting { deadline, .. } if *deadline <= self.now => Some(Token(key)),
                _ => None,
            })
            .collect();

        for token in timed_out {
            if let Slot::Connecting { mut inner, cb, .. } = self.slots.remove(token.0) {
                let _ = self.poll.registry().deregister(&mut inner);
                cb(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )));
            }
        }
    }

    fn wall_clock_advance(&mut self) {
        self.now = Instant::now();
    }

    fn run_due_scheduled(&mut self, stats: &mut TickStats) {
        let due = self.scheduled.borrow_mut().drain_due(self.now);
        stats.scheduled_tasks_run += due.len();
        for task in due {
            task();
        }
        // Background tasks run the same way; they just don't count toward
        // "is there still work" in `next_poll_timeout`.
        let due_bg = self.background_scheduled.borrow_mut().drain_due(self.now);
        stats.scheduled_tasks_run += due_bg.len();
        for task in due_bg {
            task();
        }
    }

    fn next_poll_timeout(&self) -> Option<Duration> {
        if !self.local.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        if !self.concurrent.lock().unwrap().is_empty() {
            return Some(Duration::ZERO);
        }
        let fg_deadline = self.scheduled.borrow().peek_deadline();
        let bg_deadline = self.background_scheduled.borrow().peek_deadline();

        match (fg_deadline, bg_deadline) {
            (Some(fg), Some(bg)) => Some(Self::duration_until(self.now, fg.min(bg))),
            (Some(fg), None) => Some(Self::duration_until(self.now, fg)),
            (None, Some(bg)) => Some(Self::duration_until(self.now, bg)),
            (None, None) => None,
        }
    }

    fn duration_until(now: Instant, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(now)
    }

    /// Whether the loop should keep running: any registered I/O, pending
    /// tasks, or a foreground scheduled task keeps it alive. Only-background
    /// scheduled tasks with no other work let the loop exit.
    fn should_continue(&self) -> bool {
        if self.stopped {
            return false;
        }
        if !self.slots.is_empty() {
            return true;
        }
        if !self.local.borrow().is_empty() {
            return true;
        }
        if !self.concurrent.lock().unwrap().is_empty() {
            return true;
        }
        !self.scheduled.borrow().is_empty_ignoring_tombstones()
    }

    /// Stops the loop after the current tick completes.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn dispatch_listener(&mut self, token: Token) {
        loop {
            let (stream, addr, accept_result) = match self.slots.get_mut(token.0) {
                Some(Slot::Listener { inner, .. }) => match inner.accept() {
                    Ok((stream, addr)) => (Some(stream), Some(addr), Ok(())),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (None, None, Ok(())),
                    Err(e) => (None, None, Err(e)),
                },
                _ => return,
            };

            match accept_result {
                Ok(()) => {}
                Err(e) => {
                    self.fatal(&e);
                    return;
                }
            }

            let (Some(stream), Some(addr)) = (stream, addr) else {
                return;
            };

            let target = match self.slots.get_mut(token.0) {
                Some(Slot::Listener { accept_cb, .. }) => accept_cb(stream, addr),
                _ => None,
            };
            if let Some(target) = target {
                if let Err(e) = self.insert_target(target) {
                    log::warn!("reactor: failed to register accepted connection: {e}");
                }
            }
        }
    }

    fn dispatch_connecting(&mut self, token: Token, ready: &RawReady) {
        let Slot::Connecting { mut inner, cb, .. } = self.slots.remove(token.0) else {
            return;
        };

        let result = match inner.take_error() {
            Ok(Some(e)) => Err(e),
            Ok(None) if ready.error => Err(io::Error::new(io::ErrorKind::Other, "connect failed")),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let _ = self.poll.registry().deregister(&mut inner);
        let target = match result {
            Ok(()) => cb(Ok(inner)),
            Err(e) => cb(Err(e)),
        };
        if let Some(target) = target {
            if let Err(e) = self.insert_target(target) {
                log::warn!("reactor: failed to register connected socket: {e}");
            }
        }
    }

    fn dispatch_io(&mut self, token: Token, ready: &RawReady) {
        let Some(Slot::Io(target)) = self.slots.get_mut(token.0) else {
            return;
        };

        if ready.readable {
            target.on_readable();
        }
        if ready.writable {
            target.on_writable();
        }

        let Some(Slot::Io(target)) = self.slots.get_mut(token.0) else {
            return;
        };
        if target.is_closed() {
            let _ = target.deregister(self.poll.registry());
            self.slots.remove(token.0);
        } else {
            let _ = target.reregister(self.poll.registry());
        }
    }

    fn fatal(&mut self, err: &dyn std::error::Error) {
        let action = match &mut self.fatal_handler {
            Some(h) => h(err),
            None => FatalAction::Continue,
        };
        match action {
            FatalAction::Continue => log::error!("reactor: fatal error (continuing): {err}"),
            FatalAction::Shutdown => {
                log::error!("reactor: fatal error (shutting down): {err}");
                self.stop();
            }
            FatalAction::Rethrow => panic!("reactor: fatal error: {err}"),
        }
    }

    /// Registers a fully-constructed connection object (a `TcpSocket` or a
    /// `TlsSocket`, both implementing `EventTarget`) so the reactor's poll
    /// loop starts driving it.
    pub fn register_target(&mut self, target: Box<dyn EventTarget>) -> io::Result<Token> {
        self.insert_target(target)
    }

    fn insert_target(&mut self, mut target: Box<dyn EventTarget>) -> io::Result<Token> {
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        target.register(self.poll.registry(), token)?;
        entry.insert(Slot::Io(target));
        Ok(token)
    }

    /// Builds a `TcpSocket` directly from an accepted `mio::net::TcpStream`
    /// without registering it yet, letting the caller wrap it (e.g. in TLS)
    /// before the single `register_target` call.
    pub fn wrap_accepted(stream: MioTcpStream, config: &Config) -> TcpSocket {
        TcpSocket::from_accepted(stream, config.clone())
    }

    /// One full tick: drain queues, run due scheduled tasks, poll, dispatch.
    pub fn tick(&mut self, events: &mut Events) -> TickStats {
        let mut stats = TickStats::default();
        let tick_start = Instant::now();

        // Step 1: drain concurrent queue into a private list, then run it
        // after local tasks (step ordering below).
        let concurrent_batch: Vec<_> = {
            let mut guard = self.concurrent.lock().unwrap();
            guard.drain(..).collect()
        };

        // Step 2: run local tasks FIFO; tasks posted during this drain run
        // in the same tick (re-check length each iteration).
        loop {
            let next = self.local.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    task();
                    stats.local_tasks_run += 1;
                }
                None => break,
            }
        }

        // Step 3: run the tasks drained from the concurrent queue in step 1.
        for task in concurrent_batch {
            task();
            stats.concurrent_tasks_run += 1;
        }

        // Step 4: due scheduled tasks (foreground + background).
        self.run_due_scheduled(&mut stats);

        // Step 5/6: compute timeout, poll.
        let timeout = self.next_poll_timeout();
        if let Err(e) = self.poll.poll(events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                self.fatal(&e);
            }
            stats.tick_duration = tick_start.elapsed();
            return stats;
        }

        // Step 7: dispatch readiness. `mio::event::Event` borrows from the
        // `Events` buffer and isn't `Clone`, so we copy out just the bits
        // each dispatch path needs before mutating `self.slots`.
        let ready: Vec<RawReady> = events
            .iter()
            .map(|e| RawReady {
                token: e.token(),
                readable: e.is_readable(),
                writable: e.is_writable(),
                error: e.is_error(),
            })
            .collect();
        for ready in ready {
            if ready.token == WAKE_TOKEN {
                continue;
            }
            stats.io_events_dispatched += 1;
            match self.slots.get(ready.token.0) {
                Some(Slot::Listener { .. }) => self.dispatch_listener(ready.token),
                Some(Slot::Connecting { .. }) => self.dispatch_connecting(ready.token, &ready),
                Some(Slot::Io(_)) => self.dispatch_io(ready.token, &ready),
                None => {}
            }
        }

        // Connect timeouts are checked once per tick rather than via the
        // scheduled-task heap, since firing one needs direct access to
        // `self.slots`.
        self.sweep_connect_timeouts();

        // Step 8: refresh now.
        self.wall_clock_advance();
        stats.tick_duration = tick_start.elapsed();
        stats
    }

    /// Runs ticks until no non-background work remains, or `stop()` is
    /// called.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        while self.should_continue() {
            self.tick(&mut events);
        }
    }
}

/// Readiness bits copied out of a borrowed `mio::event::Event` before the
/// dispatch loop starts mutating `self.slots` (which the borrow would
/// otherwise outlive).
struct RawReady {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}
