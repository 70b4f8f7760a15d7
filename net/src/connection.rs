//! Per-socket connection state: receive buffer, send queue, callbacks, and
//! the send/disconnect contracts.
//!
//! A connection is born on its owning loop thread, lives behind an `Arc`, and
//! dies exactly once. The loop holds the strong reference (keyed by fd); user
//! code keeps clones or `Weak` handles and may call [`TcpConnection::send`] /
//! [`TcpConnection::post_disconnect`] from any thread.

use std::any::Any;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::{RecvBuffer, SendQueue};
use crate::event_loop::{run_isolated, EventLoop, LoopHandle};
use crate::poller::Interest;
use crate::socket::TcpSocket;
#[cfg(feature = "tls")]
use crate::tls::TlsSession;

/// Why a connection's disconnect callback fired.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The peer closed (zero-byte read).
    RemoteClosed,
    /// A fatal socket error on the read or write path.
    Io(io::Error),
    /// `post_disconnect` was requested locally.
    LocalClose,
    /// The owning loop or service is shutting down.
    Shutdown,
}

/// Opaque per-connection slot for higher layers.
///
/// Not synchronized beyond the slot swap itself; by convention it is written
/// from the owning loop thread.
#[derive(Clone, Default)]
pub enum UserData {
    #[default]
    None,
    Int(i64),
    Shared(Arc<dyn Any + Send + Sync>),
}

impl UserData {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            UserData::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Downcast a shared slot to a concrete type.
    pub fn shared<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            UserData::Shared(v) => Arc::clone(v).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserData::None => write!(f, "None"),
            UserData::Int(v) => write!(f, "Int({v})"),
            UserData::Shared(_) => write!(f, "Shared(..)"),
        }
    }
}

pub(crate) type DataCallback = Box<dyn FnMut(&[u8]) -> usize + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnOnce(&Arc<TcpConnection>, DisconnectReason) + Send>;
pub(crate) type HighWaterCallback = Box<dyn FnMut(usize) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Alive,
    /// Disconnect requested; no new sends, teardown pending on the loop.
    Disconnecting,
    Dead,
}

enum FillStop {
    WouldBlock,
    Full,
    Eof,
}

/// Write attempts allowed when draining the send queue during disconnect.
const DISCONNECT_FLUSH_ATTEMPTS: usize = 8;

struct ConnInner {
    socket: Option<TcpSocket>,
    recv: RecvBuffer,
    send: SendQueue,
    state: ConnState,
    /// Interest currently applied (or about to be applied) to the poller.
    interest: Interest,
    /// Last known writability; cleared on a would-block write.
    writable: bool,
    /// Reads suspended because the recv buffer is full and unconsumed.
    read_paused: bool,
    data_cb: Option<DataCallback>,
    disconnect_cb: Option<DisconnectCallback>,
    high_water: Option<(usize, HighWaterCallback)>,
    above_high_water: bool,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,
}

impl ConnInner {
    fn fill(&mut self) -> io::Result<FillStop> {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return self.fill_tls();
        }
        self.fill_plain()
    }

    /// Read into the recv buffer's tail until would-block, full, or EOF.
    fn fill_plain(&mut self) -> io::Result<FillStop> {
        loop {
            let sock = match &self.socket {
                Some(s) => s,
                None => return Ok(FillStop::WouldBlock),
            };
            let spare = self.recv.spare();
            if spare.is_empty() {
                return Ok(FillStop::Full);
            }
            match sock.recv(spare) {
                Ok(0) => return Ok(FillStop::Eof),
                Ok(n) => self.recv.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillStop::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(feature = "tls")]
    fn fill_tls(&mut self) -> io::Result<FillStop> {
        let mut scratch = [0u8; 16384];
        loop {
            if self.recv.is_full() {
                return Ok(FillStop::Full);
            }
            let sock = match &self.socket {
                Some(s) => s,
                None => return Ok(FillStop::WouldBlock),
            };
            let n = match sock.recv(&mut scratch) {
                Ok(0) => return Ok(FillStop::Eof),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillStop::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let mut plain = Vec::new();
            match self.tls.as_mut() {
                Some(tls) => tls.read_wire(&scratch[..n], &mut plain)?,
                None => return Ok(FillStop::WouldBlock),
            }
            if !plain.is_empty() {
                // Decrypted records cannot be pushed back into the kernel;
                // the plaintext buffer may exceed its cap by one burst.
                self.recv.append(&plain);
            }
            self.pump_tls_output();
        }
    }

    /// Move pending TLS wire output (handshake, encrypted data) into the
    /// send queue.
    #[cfg(feature = "tls")]
    fn pump_tls_output(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            let mut wire = Vec::new();
            if tls.take_wire_output(&mut wire).is_err() {
                return;
            }
            if !wire.is_empty() {
                self.send.push_owned(wire);
            }
        }
    }

    #[cfg(feature = "tls")]
    fn enqueue_tls(&mut self, data: &[u8]) -> io::Result<()> {
        match self.tls.as_mut() {
            Some(tls) => tls.write_plaintext(data)?,
            None => return Ok(()),
        }
        self.pump_tls_output();
        Ok(())
    }

    /// Drain the send queue until empty or would-block. Fatal errors
    /// propagate; would-block clears `writable`.
    fn flush(&mut self) -> io::Result<()> {
        loop {
            if self.send.is_empty() {
                break;
            }
            let sock = match &self.socket {
                Some(s) => s,
                None => break,
            };
            match self.send.write_to(sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.note_drained();
        Ok(())
    }

    /// Best-effort drain with a bounded number of write attempts; errors and
    /// would-block end it early.
    fn flush_bounded(&mut self, attempts: usize) {
        for _ in 0..attempts {
            if self.send.is_empty() {
                return;
            }
            let sock = match &self.socket {
                Some(s) => s,
                None => return,
            };
            match self.send.write_to(sock) {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }

    /// Returns true when this push moved the pending total above the
    /// high-water threshold (a new crossing, not a repeat).
    fn note_high_water_crossing(&mut self) -> bool {
        match &self.high_water {
            Some((threshold, _)) if !self.above_high_water && self.send.pending() > *threshold => {
                self.above_high_water = true;
                true
            }
            _ => false,
        }
    }

    /// Re-arm the high-water edge once the queue drops back below.
    fn note_drained(&mut self) {
        if self.above_high_water {
            if let Some((threshold, _)) = &self.high_water {
                if self.send.pending() < *threshold {
                    self.above_high_water = false;
                }
            }
        }
    }

    fn desired_interest(&self) -> Interest {
        let mut want = Interest::empty();
        if !self.read_paused {
            want |= Interest::READABLE;
        }
        if !self.send.is_empty() {
            want |= Interest::WRITABLE;
        }
        want
    }
}

/// A live TCP connection owned by one event loop.
pub struct TcpConnection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    owner: LoopHandle,
    weak_self: Weak<TcpConnection>,
    inner: Mutex<ConnInner>,
    alive: AtomicBool,
    disconnect_requested: AtomicBool,
    user_data: Mutex<UserData>,
}

impl TcpConnection {
    /// Build a connection around `socket` and register it with the loop.
    /// Runs on the loop thread.
    pub(crate) fn register(
        el: &mut EventLoop,
        owner: LoopHandle,
        socket: TcpSocket,
        max_recv: usize,
        #[cfg(feature = "tls")] tls: Option<TlsSession>,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        let peer = socket.peer_addr();
        let conn = Arc::new_cyclic(|weak| TcpConnection {
            fd,
            peer,
            owner,
            weak_self: weak.clone(),
            inner: Mutex::new(ConnInner {
                socket: Some(socket),
                recv: RecvBuffer::with_capacity(max_recv),
                send: SendQueue::new(),
                state: ConnState::Alive,
                interest: Interest::READABLE,
                writable: true,
                read_paused: false,
                data_cb: None,
                disconnect_cb: None,
                high_water: None,
                above_high_water: false,
                #[cfg(feature = "tls")]
                tls,
            }),
            alive: AtomicBool::new(true),
            disconnect_requested: AtomicBool::new(false),
            user_data: Mutex::new(UserData::None),
        });
        el.register_connection(&conn, Interest::READABLE);
        #[cfg(feature = "tls")]
        {
            // A client session wants to send its hello immediately.
            let mut inner = conn.inner.lock().unwrap();
            inner.pump_tls_output();
            conn.sync_interest(&mut inner, el);
        }
        tracing::debug!(fd, peer = ?peer, "connection registered");
        conn
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// False once the connection has died or a disconnect was requested.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.disconnect_requested.load(Ordering::Acquire)
    }

    /// Install the data callback. `cb` receives the buffered bytes and
    /// returns how many it consumed from the front; returning 0 means "need
    /// more bytes". Must be installed before the enter callback returns, or
    /// incoming data is dropped.
    pub fn set_data_callback(&self, cb: impl FnMut(&[u8]) -> usize + Send + 'static) {
        self.inner.lock().unwrap().data_cb = Some(Box::new(cb));
    }

    /// Install the disconnect callback: invoked exactly once, on the owning
    /// loop thread, after the socket is closed.
    pub fn set_disconnect_callback(
        &self,
        cb: impl FnOnce(&Arc<TcpConnection>, DisconnectReason) + Send + 'static,
    ) {
        self.inner.lock().unwrap().disconnect_cb = Some(Box::new(cb));
    }

    /// Fire `cb` when the pending send total crosses above `threshold`;
    /// re-armed after it drops back below.
    pub fn set_high_water(&self, threshold: usize, cb: impl FnMut(usize) + Send + 'static) {
        self.inner.lock().unwrap().high_water = Some((threshold, Box::new(cb)));
    }

    pub fn set_user_data(&self, value: UserData) {
        *self.user_data.lock().unwrap() = value;
    }

    pub fn user_data(&self) -> UserData {
        self.user_data.lock().unwrap().clone()
    }

    /// Total bytes queued and not yet accepted by the kernel.
    pub fn pending_send(&self) -> usize {
        self.inner.lock().unwrap().send.pending()
    }

    /// Queue `data` for transmission.
    ///
    /// Returns `false` iff the connection is dead (or disconnecting);
    /// `true` otherwise, without guaranteeing delivery. On the owning loop
    /// thread an inline write is attempted when the queue was empty and the
    /// socket writable; from other threads the flush is posted to the loop.
    /// Blocks from one sending thread are transmitted in submission order.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.alive.load(Ordering::Acquire) || self.disconnect_requested.load(Ordering::Acquire)
        {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Alive {
            return false;
        }

        let was_empty = inner.send.is_empty();
        let mut fatal: Option<io::Error> = None;

        #[cfg(feature = "tls")]
        {
            if inner.tls.is_some() {
                if let Err(e) = inner.enqueue_tls(data) {
                    fatal = Some(e);
                }
            } else {
                inner.send.push(data);
            }
        }
        #[cfg(not(feature = "tls"))]
        inner.send.push(data);

        let crossed = inner.note_high_water_crossing();
        let on_loop = self.owner.is_loop_thread();

        if fatal.is_none() && on_loop && was_empty && inner.writable {
            if let Err(e) = inner.flush() {
                fatal = Some(e);
            }
        }
        let needs_sync = inner.desired_interest() != inner.interest;
        drop(inner);

        if crossed {
            self.fire_high_water();
        }

        match fatal {
            Some(e) => self.post_error_disconnect(e),
            None if !on_loop => self.post_flush(),
            None if needs_sync => self.post_flush(),
            None => {}
        }
        true
    }

    /// Request a disconnect from any thread. Idempotent: N calls produce one
    /// disconnect callback. Already-queued bytes are flushed best-effort on
    /// the loop thread before the socket is shut down and closed.
    pub fn post_disconnect(&self) {
        if self.disconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Dead {
                return;
            }
            inner.state = ConnState::Disconnecting;
        }
        let weak = self.weak_self.clone();
        self.owner.post_proc(Box::new(move |el: &mut EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.force_disconnect(el, DisconnectReason::LocalClose);
            }
        }));
    }

    fn post_error_disconnect(&self, err: io::Error) {
        if self.disconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.weak_self.clone();
        self.owner.post_proc(Box::new(move |el: &mut EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.force_disconnect(el, DisconnectReason::Io(err));
            }
        }));
    }

    fn post_flush(&self) {
        let weak = self.weak_self.clone();
        self.owner.post_proc(Box::new(move |el: &mut EventLoop| {
            if let Some(conn) = weak.upgrade() {
                conn.flush_on_loop(el);
            }
        }));
    }

    fn fire_high_water(&self) {
        let (entry, pending) = {
            let mut inner = self.inner.lock().unwrap();
            let pending = inner.send.pending();
            match inner.high_water.take() {
                Some(entry) => (entry, pending),
                None => return,
            }
        };
        let (threshold, mut cb) = entry;
        run_isolated("high-water", || cb(pending));
        let mut inner = self.inner.lock().unwrap();
        if inner.high_water.is_none() {
            inner.high_water = Some((threshold, cb));
        }
    }

    fn sync_interest(&self, inner: &mut ConnInner, el: &mut EventLoop) {
        let want = inner.desired_interest();
        if want != inner.interest {
            inner.interest = want;
            el.set_interest(self.fd, want);
        }
    }

    /// Loop-thread flush after a cross-thread send or an interest change.
    pub(crate) fn flush_on_loop(self: &Arc<Self>, el: &mut EventLoop) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Dead {
            return;
        }
        if inner.writable && !inner.send.is_empty() {
            if let Err(e) = inner.flush() {
                drop(inner);
                self.force_disconnect(el, DisconnectReason::Io(e));
                return;
            }
        }
        self.sync_interest(&mut inner, el);
    }

    /// Readiness handler: drain the socket into the recv buffer and run the
    /// data callback while it consumes.
    pub(crate) fn handle_readable(self: &Arc<Self>, el: &mut EventLoop) {
        // Read interest is not armed while paused, so a readable event here
        // can only be an error or hang-up. Give the callback a final chance
        // to drain; a connection still stalled on a full buffer is closed.
        let was_paused = {
            let inner = self.inner.lock().unwrap();
            if inner.state != ConnState::Alive {
                return;
            }
            inner.read_paused
        };
        if was_paused {
            if let Some(reason) = self.dispatch_data() {
                self.force_disconnect(el, reason);
                return;
            }
            let mut inner = self.inner.lock().unwrap();
            if inner.recv.is_full() {
                drop(inner);
                self.force_disconnect(el, DisconnectReason::RemoteClosed);
                return;
            }
            inner.read_paused = false;
            self.sync_interest(&mut inner, el);
        }

        loop {
            let fill = {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != ConnState::Alive {
                    return;
                }
                inner.fill()
            };
            let fill = match fill {
                Ok(stop) => stop,
                Err(e) => {
                    // Deliver what already arrived, then tear down.
                    let _ = self.dispatch_data();
                    self.force_disconnect(el, DisconnectReason::Io(e));
                    return;
                }
            };
            if let Some(reason) = self.dispatch_data() {
                self.force_disconnect(el, reason);
                return;
            }
            match fill {
                FillStop::Eof => {
                    self.force_disconnect(el, DisconnectReason::RemoteClosed);
                    return;
                }
                FillStop::WouldBlock => break,
                FillStop::Full => {
                    let still_full = self.inner.lock().unwrap().recv.is_full();
                    if still_full {
                        break;
                    }
                    // The callback freed space; keep reading.
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Alive {
            // A full, unconsumed buffer pauses reads rather than
            // busy-reporting; the next consuming callback cycle resumes them.
            inner.read_paused = inner.recv.is_full();
            self.sync_interest(&mut inner, el);
        }
    }

    /// Readiness handler: the socket became writable.
    pub(crate) fn handle_writable(self: &Arc<Self>, el: &mut EventLoop) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Dead {
                return;
            }
            inner.writable = true;
        }
        self.flush_on_loop(el);
    }

    /// Run the data callback while it consumes and data remains. The
    /// callback is taken out of the lock for the call, so it may freely call
    /// `send`/`post_disconnect` on this same connection.
    fn dispatch_data(self: &Arc<Self>) -> Option<DisconnectReason> {
        loop {
            let (mut cb, buf) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != ConnState::Alive || inner.recv.is_empty() {
                    return None;
                }
                match inner.data_cb.take() {
                    Some(cb) => (cb, std::mem::take(&mut inner.recv)),
                    None => {
                        // No callback installed: the bytes are dropped.
                        let len = inner.recv.len();
                        inner.recv.consume(len);
                        return None;
                    }
                }
            };

            let consumed = run_isolated("data", || cb(buf.data()));

            let mut inner = self.inner.lock().unwrap();
            inner.recv = buf;
            // A callback installed during the call wins over the one we took.
            if inner.data_cb.is_none() {
                inner.data_cb = Some(cb);
            }
            let consumed = match consumed {
                Some(n) => n,
                None => return Some(DisconnectReason::Io(io::Error::other("data callback panicked"))),
            };
            // Claiming more than is buffered is tolerated as consume-all.
            let n = consumed.min(inner.recv.len());
            inner.recv.consume(n);
            if n == 0 || inner.recv.is_empty() || inner.state != ConnState::Alive {
                return None;
            }
        }
    }

    /// Tear the connection down on the loop thread: best-effort flush, shut
    /// both directions, close the socket, fire the disconnect callback once.
    pub(crate) fn force_disconnect(
        self: &Arc<Self>,
        el: &mut EventLoop,
        reason: DisconnectReason,
    ) {
        let (cb, socket) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ConnState::Dead {
                return;
            }
            inner.state = ConnState::Dead;
            self.alive.store(false, Ordering::Release);

            if !matches!(reason, DisconnectReason::Io(_)) {
                #[cfg(feature = "tls")]
                {
                    if let Some(tls) = inner.tls.as_mut() {
                        tls.send_close_notify();
                    }
                    inner.pump_tls_output();
                }
                inner.flush_bounded(DISCONNECT_FLUSH_ATTEMPTS);
            }

            inner.data_cb = None;
            inner.high_water = None;
            (inner.disconnect_cb.take(), inner.socket.take())
        };

        el.deregister(self.fd);
        if let Some(sock) = socket {
            let _ = sock.shutdown(Shutdown::Both);
            // Dropping closes the fd, exactly once.
        }
        tracing::debug!(fd = self.fd, reason = ?reason, "connection closed");

        if let Some(cb) = cb {
            run_isolated("disconnect", move || cb(self, reason));
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}
