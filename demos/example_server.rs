//! Plain-HTTP echo server exercising the primary/worker acceptor: binds one
//! port, spawns a worker reactor per available core, and answers every
//! request with its own request-target as the body, keeping connections
//! alive with a per-worker keep-alive sweep exactly as
//! [`vortex::http::connection`] describes.

use std::cell::RefCell;
use std::io::Result;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::available_parallelism;

use vortex::acceptor::Acceptor;
use vortex::http::{
    DefaultExceptionFormatter, HttpServerConnection, KeepAliveRegistry, Request, Response,
    Servlet, ServletReply, Status,
};
use vortex::net::{SharedTcpSocket, Socket, TcpSocket};
use vortex::Config;

struct EchoServlet;

impl Servlet for EchoServlet {
    fn serve(&self, request: Request, respond: ServletReply) {
        let body = format!("you asked for {}", request.target).into_bytes();
        respond.respond(Response::new(Status::OK).header("content-type", "text/plain").body(body));
    }
}

thread_local! {
    // One keep-alive registry per worker thread, lazily created the first
    // time that worker accepts a connection, then shared by every
    // connection it accepts afterward (`HttpServerConnection` itself is
    // `Rc`-backed and never crosses threads, so this can't simply be
    // captured by the `Send + Sync` connection factory up front).
    static KEEPALIVE: RefCell<Option<Rc<RefCell<KeepAliveRegistry>>>> = const { RefCell::new(None) };
}

fn main() -> Result<()> {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let workers = available_parallelism().map(usize::from).unwrap_or(1);
    let config = Config::default();

    let acceptor = Acceptor::spawn(
        addr,
        workers,
        config.clone(),
        Arc::new(move |stream, _addr, config, handle| {
            let tcp = TcpSocket::from_accepted(stream, config.clone()).into_shared();
            let event_target = TcpSocket::into_event_target(tcp.clone());
            let socket: Box<dyn Socket> = Box::new(SharedTcpSocket(tcp));

            let keepalive = KEEPALIVE.with(|cell| {
                cell.borrow_mut()
                    .get_or_insert_with(|| {
                        let registry = KeepAliveRegistry::new(config.keep_alive_timeout);
                        KeepAliveRegistry::start_sweeping(&registry, handle.clone());
                        registry
                    })
                    .clone()
            });

            HttpServerConnection::spawn(
                socket,
                Rc::new(EchoServlet),
                Rc::new(DefaultExceptionFormatter),
                config,
                Some(keepalive),
                None,
                handle.clone(),
            );
            Some(event_target)
        }),
    )?;

    log::info!("listening on {addr} with {workers} workers");
    acceptor.join();
    Ok(())
}
