//! Evented TCP networking runtime.
//!
//! `braid` multiplexes many non-blocking sockets over a small pool of
//! single-threaded event loops. The moving parts:
//!
//! - [`Poller`] — a level-triggered readiness set over `poll(2)`.
//! - [`TcpSocket`] — an owned non-blocking socket.
//! - [`EventLoop`] / [`LoopHandle`] — one loop per worker thread, driven by
//!   readiness events, cross-thread async procs, and timers.
//! - [`TcpConnection`] — per-socket recv buffer, send queue, and callbacks.
//! - [`TcpService`] — the worker pool; distributes new connections round-robin.
//! - [`Listener`] — a blocking accept thread per listening endpoint.
//! - [`AsyncConnector`] — non-blocking connects with per-attempt deadlines.
//!
//! Callbacks run on the loop thread that owns the connection and must not
//! block; hand long work to your own threads and come back via
//! [`LoopHandle::post`].

pub mod buffer;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod listener;
pub mod poller;
pub mod service;
pub mod socket;
#[cfg(feature = "tls")]
pub mod tls;

pub use buffer::{RecvBuffer, SendQueue};
pub use connection::{DisconnectReason, TcpConnection, UserData};
pub use connector::{AsyncConnector, ConnectError, ConnectOptions};
pub use error::Error;
pub use event_loop::{EventLoop, LoopConfig, LoopHandle};
pub use listener::{Listener, ListenerOptions};
pub use poller::{Interest, Poller};
pub use service::{SocketOptions, TcpService};
pub use socket::{ConnectStart, TcpSocket};
#[cfg(feature = "tls")]
pub use tls::TlsContext;
