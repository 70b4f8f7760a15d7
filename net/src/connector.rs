//! Asynchronous connector: a single worker thread driving non-blocking
//! connects with per-attempt deadlines.
//!
//! Each attempt resolves through exactly one of its two callbacks, exactly
//! once: synchronous completion or failure short-circuits on the worker;
//! in-flight attempts wait for writability and read `SO_ERROR` to decide.
//! An fd that is both write-ready and past its deadline in the same
//! iteration resolves by readiness.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::error::Error;
use crate::event_loop::{run_isolated, Waker};
use crate::poller::{Interest, Poller};
use crate::socket::{ConnectStart, TcpSocket};

/// Why a connect attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The per-attempt deadline passed before the connect completed.
    #[error("connect timed out")]
    Timeout,
    /// The connector was stopped while the attempt was pending.
    #[error("connector stopped")]
    Shutdown,
    /// Socket creation or the connect itself failed.
    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
}

type SuccessCallback = Box<dyn FnOnce(TcpSocket) + Send>;
type FailureCallback = Box<dyn FnOnce(ConnectError) + Send>;

/// One connect request. Both callbacks are required.
pub struct ConnectOptions {
    addr: SocketAddr,
    timeout: Duration,
    on_success: SuccessCallback,
    on_failure: FailureCallback,
}

impl ConnectOptions {
    pub fn new(
        addr: SocketAddr,
        timeout: Duration,
        on_success: impl FnOnce(TcpSocket) + Send + 'static,
        on_failure: impl FnOnce(ConnectError) + Send + 'static,
    ) -> ConnectOptions {
        ConnectOptions {
            addr,
            timeout,
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }
}

struct Attempt {
    socket: TcpSocket,
    deadline: Instant,
    on_success: SuccessCallback,
    on_failure: FailureCallback,
}

struct ConnectorWorker {
    tx: Sender<ConnectOptions>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

/// Owner of the connector worker thread.
pub struct AsyncConnector {
    state: Mutex<Option<ConnectorWorker>>,
}

/// Poll granularity of the connector loop; deadlines are checked at this
/// resolution.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl AsyncConnector {
    pub fn new() -> AsyncConnector {
        AsyncConnector {
            state: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let waker = Arc::new(Waker::new()?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker_waker = Arc::clone(&waker);
        let worker_stop = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("braid-connector".to_string())
            .spawn(move || worker_loop(rx, worker_waker, worker_stop))
            .map_err(Error::Io)?;

        *state = Some(ConnectorWorker {
            tx,
            waker,
            stop,
            join,
        });
        Ok(())
    }

    /// Queue a connect attempt. Fails synchronously once the connector has
    /// been stopped (or was never started).
    pub fn connect(&self, options: ConnectOptions) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        let worker = state.as_ref().ok_or(Error::NotRunning)?;
        if worker.stop.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        worker
            .tx
            .send(options)
            .map_err(|_| Error::NotRunning)?;
        worker.waker.wake();
        Ok(())
    }

    /// Stop the worker. Every pending attempt fails with
    /// [`ConnectError::Shutdown`] before this returns. Idempotent.
    pub fn stop(&self) {
        let worker = { self.state.lock().unwrap().take() };
        let Some(worker) = worker else { return };
        worker.stop.store(true, Ordering::Release);
        worker.waker.wake();
        drop(worker.tx);
        let _ = worker.join.join();
    }
}

impl Default for AsyncConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<ConnectOptions>, waker: Arc<Waker>, stop: Arc<AtomicBool>) {
    let mut poller = Poller::new();
    poller.add(waker.fd(), Interest::READABLE);
    let mut pending: HashMap<RawFd, Attempt> = HashMap::new();

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        while let Ok(req) = rx.try_recv() {
            begin_attempt(req, &mut poller, &mut pending);
        }

        if let Err(e) = poller.poll(Some(POLL_INTERVAL)) {
            tracing::error!(error = %e, "connector poll failed");
            break;
        }
        if poller.check(waker.fd(), Interest::READABLE) {
            waker.drain();
        }

        // Completions before deadlines: an attempt that is both write-ready
        // and expired in the same iteration resolves by readiness.
        let ready: Vec<RawFd> = poller
            .events()
            .iter()
            .filter(|(fd, r)| *fd != waker.fd() && r.contains(Interest::WRITABLE))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in ready {
            let Some(attempt) = pending.remove(&fd) else { continue };
            poller.remove(fd);
            let Attempt {
                socket,
                on_success,
                on_failure,
                ..
            } = attempt;
            match socket.peek_error() {
                Ok(None) => {
                    run_isolated("connect success", move || on_success(socket));
                }
                Ok(Some(e)) => {
                    run_isolated("connect failure", move || on_failure(ConnectError::Io(e)));
                }
                Err(e) => {
                    run_isolated("connect failure", move || on_failure(ConnectError::Io(e)));
                }
            }
        }

        let now = Instant::now();
        let expired: Vec<RawFd> = pending
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired {
            if let Some(attempt) = pending.remove(&fd) {
                poller.remove(fd);
                let on_failure = attempt.on_failure;
                run_isolated("connect failure", move || {
                    on_failure(ConnectError::Timeout)
                });
                // The attempt's socket drops (and closes) here.
            }
        }
    }

    // Shutdown: fail everything in flight, then everything still queued.
    for (_, attempt) in pending.drain() {
        let on_failure = attempt.on_failure;
        run_isolated("connect failure", move || {
            on_failure(ConnectError::Shutdown)
        });
    }
    while let Ok(req) = rx.try_recv() {
        let on_failure = req.on_failure;
        run_isolated("connect failure", move || {
            on_failure(ConnectError::Shutdown)
        });
    }
}

fn begin_attempt(req: ConnectOptions, poller: &mut Poller, pending: &mut HashMap<RawFd, Attempt>) {
    let ConnectOptions {
        addr,
        timeout,
        on_success,
        on_failure,
    } = req;
    match TcpSocket::connect(addr) {
        Ok((socket, ConnectStart::Connected)) => {
            run_isolated("connect success", move || on_success(socket));
        }
        Ok((socket, ConnectStart::InProgress)) => {
            let fd = socket.as_raw_fd();
            poller.add(fd, Interest::WRITABLE);
            pending.insert(
                fd,
                Attempt {
                    socket,
                    deadline: Instant::now() + timeout,
                    on_success,
                    on_failure,
                },
            );
        }
        Err(e) => {
            run_isolated("connect failure", move || on_failure(ConnectError::Io(e)));
        }
    }
}
