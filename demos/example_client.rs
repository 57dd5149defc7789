//! Minimal client pairing for [`example_server`](../demos/example_server.rs):
//! connects once, issues a single GET, prints the response, then stops its
//! own reactor from inside the completion callback.

use std::io::Result;
use std::net::SocketAddr;
use std::time::Duration;

use vortex::http::{HttpClient, Method, Request};
use vortex::reactor::Reactor;
use vortex::Config;

fn main() -> Result<()> {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let config = Config::default();
    let mut reactor = Reactor::new(config.clone())?;
    let handle = reactor.handle();

    let mut client = HttpClient::new(config);
    let request = Request::new(Method::Get, "/hello");

    client.send(
        &mut reactor,
        handle,
        addr,
        None,
        request,
        Duration::from_secs(5),
        move |result| match result {
            Ok(response) => {
                log::info!(
                    "got {} {}",
                    response.status.0,
                    String::from_utf8_lossy(&response.body)
                );
            }
            Err(e) => log::error!("request failed: {e}"),
        },
    );

    reactor.run();
    Ok(())
}
