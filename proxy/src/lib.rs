//! Binary TCP relay built on the `braid` runtime.
//!
//! Accepts clients on one endpoint and opens a matching backend connection
//! per client. Bytes the client sends before the backend is up are cached in
//! per-session state, then flushed; after that traffic relays
//! bidirectionally until either side closes, which brings down the other.

pub mod config;
pub mod logging;
mod relay;
pub mod signal;

pub use config::Config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use braid::{AsyncConnector, Listener, ListenerOptions, TcpService};

/// A running proxy: service workers, connector worker, and the accept
/// thread.
pub struct Proxy {
    service: Arc<TcpService>,
    connector: Arc<AsyncConnector>,
    listener: Listener,
}

impl Proxy {
    pub fn start(config: &Config) -> Result<Proxy, braid::Error> {
        let service = Arc::new(TcpService::new());
        service.start(config.threads())?;

        let connector = Arc::new(AsyncConnector::new());
        connector.start()?;

        let target = Arc::new(relay::RelayTarget {
            service: Arc::clone(&service),
            connector: Arc::clone(&connector),
            backend_addr: config.backend.addr,
            connect_timeout: Duration::from_millis(config.backend.connect_timeout_ms),
            max_recv_buffer_size: config.proxy.max_recv_buffer_size,
        });

        let listener = Listener::start(
            config.proxy.listen,
            ListenerOptions::default(),
            move |socket| relay::accept_client(&target, socket),
        )?;

        tracing::info!(
            listen = %listener.local_addr(),
            backend = %config.backend.addr,
            "proxy started"
        );
        Ok(Proxy {
            service,
            connector,
            listener,
        })
    }

    /// The bound client-facing address; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Stop accepting, fail pending backend connects, and disconnect every
    /// live session.
    pub fn shutdown(mut self) {
        self.listener.stop();
        self.connector.stop();
        self.service.stop();
        tracing::info!("proxy stopped");
    }
}

/// Run until the shutdown flag flips (see [`signal::install`]).
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), braid::Error> {
    let proxy = Proxy::start(config)?;
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    proxy.shutdown();
    Ok(())
}
