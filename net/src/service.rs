//! Worker pool: N event loops on N threads, with round-robin assignment of
//! new connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::connection::TcpConnection;
use crate::error::Error;
use crate::event_loop::{run_isolated, EventLoop, LoopConfig, LoopHandle};
use crate::socket::TcpSocket;
#[cfg(feature = "tls")]
use crate::tls::{TlsContext, TlsSession};

type EnterCallback = Box<dyn FnOnce(&Arc<TcpConnection>) + Send>;

/// Options applied when a socket is handed to the service.
pub struct SocketOptions {
    enter: Option<EnterCallback>,
    max_recv_buffer_size: usize,
    disable_nagle: bool,
    #[cfg(feature = "tls")]
    tls: Option<TlsContext>,
}

impl SocketOptions {
    pub fn new() -> SocketOptions {
        SocketOptions {
            enter: None,
            max_recv_buffer_size: 64 * 1024,
            disable_nagle: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Called once on the owning loop thread, before any data is delivered.
    /// Install the data and disconnect callbacks here.
    pub fn on_enter(mut self, cb: impl FnOnce(&Arc<TcpConnection>) + Send + 'static) -> Self {
        self.enter = Some(Box::new(cb));
        self
    }

    /// Hard cap on the receive buffer. Reads pause when it is full and the
    /// data callback is not consuming; a single record larger than this cap
    /// stalls the connection until it is disconnected.
    pub fn max_recv_buffer_size(mut self, bytes: usize) -> Self {
        self.max_recv_buffer_size = bytes.max(1);
        self
    }

    /// Set `TCP_NODELAY` on the socket.
    pub fn disable_nagle(mut self, disable: bool) -> Self {
        self.disable_nagle = disable;
        self
    }

    /// Frame the connection through TLS; callbacks see plaintext.
    #[cfg(feature = "tls")]
    pub fn tls_context(mut self, ctx: TlsContext) -> Self {
        self.tls = Some(ctx);
        self
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct Worker {
    handle: LoopHandle,
    join: thread::JoinHandle<()>,
}

struct Pool {
    workers: Vec<Worker>,
}

/// The worker pool. Owns its event loops; connections added through
/// [`TcpService::add_tcp_connection`] are distributed round-robin.
pub struct TcpService {
    state: Mutex<Option<Pool>>,
    next: AtomicUsize,
    loop_config: LoopConfig,
}

impl TcpService {
    pub fn new() -> TcpService {
        Self::with_loop_config(LoopConfig::default())
    }

    pub fn with_loop_config(loop_config: LoopConfig) -> TcpService {
        TcpService {
            state: Mutex::new(None),
            next: AtomicUsize::new(0),
            loop_config,
        }
    }

    /// Spawn `n_workers` loop threads (at least one).
    pub fn start(&self, n_workers: usize) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let n = n_workers.max(1);
        let mut workers: Vec<Worker> = Vec::with_capacity(n);
        for i in 0..n {
            let spawned = EventLoop::new(self.loop_config.clone()).and_then(|mut el| {
                let handle = el.handle();
                thread::Builder::new()
                    .name(format!("braid-worker-{i}"))
                    .spawn(move || {
                        if let Err(e) = el.run() {
                            tracing::error!(worker = i, error = %e, "event loop exited with error");
                        }
                    })
                    .map(|join| Worker { handle, join })
            });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for w in &workers {
                        w.handle.stop();
                    }
                    for w in workers {
                        let _ = w.join.join();
                    }
                    return Err(Error::Io(e));
                }
            }
        }
        tracing::debug!(workers = n, "service started");
        *state = Some(Pool { workers });
        Ok(())
    }

    /// Hand a socket to one of the workers. The chosen loop registers the
    /// fd, builds the connection, and runs the enter callback.
    pub fn add_tcp_connection(
        &self,
        socket: TcpSocket,
        options: SocketOptions,
    ) -> Result<(), Error> {
        let handle = {
            let state = self.state.lock().unwrap();
            let pool = state.as_ref().ok_or(Error::NotRunning)?;
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % pool.workers.len();
            pool.workers[idx].handle.clone()
        };
        let owner = handle.clone();
        handle.post_proc(Box::new(move |el: &mut EventLoop| {
            attach(el, owner, socket, options);
        }));
        Ok(())
    }

    /// Stop every worker and join. Surviving connections get their
    /// disconnect callback with a shutdown reason before the threads exit.
    /// Idempotent.
    pub fn stop(&self) {
        let pool = { self.state.lock().unwrap().take() };
        let Some(pool) = pool else { return };
        for w in &pool.workers {
            w.handle.stop();
        }
        for w in pool.workers {
            let _ = w.join.join();
        }
        tracing::debug!("service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

impl Default for TcpService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs on the chosen loop thread.
fn attach(el: &mut EventLoop, owner: LoopHandle, socket: TcpSocket, options: SocketOptions) {
    if options.disable_nagle {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!(error = %e, "failed to set TCP_NODELAY");
        }
    }

    #[cfg(feature = "tls")]
    let tls = match options.tls.as_ref().map(TlsSession::new).transpose() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create TLS session; dropping socket");
            return;
        }
    };

    #[cfg(feature = "tls")]
    let conn = TcpConnection::register(el, owner, socket, options.max_recv_buffer_size, tls);
    #[cfg(not(feature = "tls"))]
    let conn = TcpConnection::register(el, owner, socket, options.max_recv_buffer_size);

    if let Some(enter) = options.enter {
        run_isolated("enter", move || enter(&conn));
    }
}
