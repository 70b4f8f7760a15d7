//! Blocking accept thread, one per listening endpoint.
//!
//! Accepting is not on the hot path, so a dedicated blocking thread is
//! simpler than folding non-blocking accept into every loop. `stop` closes
//! the listening fd to unblock `accept`; a swap guard makes the close happen
//! exactly once whether the thread or the owner gets there first.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;
use crate::event_loop::run_isolated;
use crate::socket::TcpSocket;

/// Options for a listening endpoint. The address family (v4/v6) follows the
/// bind address.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub reuse_address: bool,
    pub backlog: i32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            reuse_address: true,
            backlog: 1024,
        }
    }
}

struct ListenFd {
    fd: RawFd,
    closed: AtomicBool,
}

impl ListenFd {
    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// A running accept thread. Stopping (or dropping) closes the listening
/// socket and joins the thread.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    listen_fd: Arc<ListenFd>,
    join: Option<thread::JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and start accepting. Each accepted socket is switched to
    /// non-blocking mode and handed to `on_accept` on the listener thread;
    /// the callback is expected to pass it to a [`crate::TcpService`].
    pub fn start(
        addr: SocketAddr,
        options: ListenerOptions,
        mut on_accept: impl FnMut(TcpSocket) + Send + 'static,
    ) -> Result<Listener, Error> {
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if options.reuse_address {
            sock.set_reuse_address(true)?;
        }
        sock.bind(&addr.into())?;
        sock.listen(options.backlog)?;
        let local_addr = sock
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))?;

        let listen_fd = Arc::new(ListenFd {
            fd: sock.into_raw_fd(),
            closed: AtomicBool::new(false),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_fd = Arc::clone(&listen_fd);
        let thread_shutdown = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name("braid-listener".to_string())
            .spawn(move || {
                accept_loop(&thread_fd, &thread_shutdown, &mut on_accept);
                thread_fd.close_once();
            })
            .map_err(Error::Io)?;

        tracing::debug!(addr = %local_addr, "listener started");
        Ok(Listener {
            local_addr,
            shutdown,
            listen_fd,
            join: Some(join),
        })
    }

    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else { return };
        self.shutdown.store(true, Ordering::Release);
        self.listen_fd.close_once();
        let _ = join.join();
        tracing::debug!(addr = %self.local_addr, "listener stopped");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listen: &ListenFd,
    shutdown: &AtomicBool,
    on_accept: &mut (impl FnMut(TcpSocket) + Send),
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let fd = unsafe {
            libc::accept4(
                listen.fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ECONNABORTED) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    tracing::warn!(error = %err, "accept hit the fd limit; backing off");
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                _ => {
                    tracing::error!(error = %err, "accept failed; listener exiting");
                    return;
                }
            }
        }

        let sock = unsafe { Socket::from_raw_fd(fd) };
        let peer = sock.peer_addr().ok().and_then(|a| a.as_socket());
        match TcpSocket::from_accepted(sock, peer) {
            Ok(accepted) => {
                run_isolated("accept", || on_accept(accepted));
            }
            Err(e) => tracing::warn!(error = %e, "failed to prepare accepted socket"),
        }
    }
}
