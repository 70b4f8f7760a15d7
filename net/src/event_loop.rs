//! Single-threaded event loop and its thread-safe handle.
//!
//! One loop runs per worker thread. Each iteration polls the readiness set,
//! dispatches connection handlers, drains the cross-thread async-proc queue
//! exactly once, and runs expired timers. Cross-thread work enters only
//! through [`LoopHandle::post`] / [`LoopHandle::post_after`], which enqueue
//! onto an MPSC channel and kick an eventfd the loop always watches.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::connection::{DisconnectReason, TcpConnection};
use crate::poller::{Interest, Poller};

/// Work submitted to a loop from any thread, executed on the loop thread.
pub(crate) type AsyncProc = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Run a user callback, swallowing (and logging) any panic so one misbehaving
/// callback cannot take down the loop thread.
pub(crate) fn run_isolated<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(_) => {
            tracing::error!(callback = what, "user callback panicked; isolated");
            None
        }
    }
}

/// Eventfd-based wakeup for a thread blocked in `poll`.
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker { fd })
    }

    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        let _ = unsafe { libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8) };
    }

    /// Reset the counter after the fd reported readable.
    pub(crate) fn drain(&self) {
        let mut buf: u64 = 0;
        let _ = unsafe { libc::read(self.fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: AsyncProc,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Loop tuning knobs.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound on how long one iteration may block in `poll` when there
    /// is nothing else to do. Bounds shutdown latency.
    pub poll_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// One event loop, owned and driven by a single thread.
pub struct EventLoop {
    poller: Poller,
    waker: Arc<Waker>,
    procs: Receiver<AsyncProc>,
    tx: Sender<AsyncProc>,
    thread: Arc<OnceLock<ThreadId>>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    conns: HashMap<RawFd, Arc<TcpConnection>>,
    poll_timeout: Duration,
    running: bool,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> io::Result<EventLoop> {
        let waker = Arc::new(Waker::new()?);
        let (tx, procs) = crossbeam_channel::unbounded();
        let mut poller = Poller::new();
        poller.add(waker.fd(), Interest::READABLE);
        Ok(EventLoop {
            poller,
            waker,
            procs,
            tx,
            thread: Arc::new(OnceLock::new()),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            conns: HashMap::new(),
            poll_timeout: config.poll_timeout,
            running: true,
        })
    }

    /// A thread-safe handle for posting work to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
            thread: Arc::clone(&self.thread),
        }
    }

    /// Number of connections currently registered with this loop.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Run until a stop is posted, then drain the queue once more and
    /// force-disconnect every surviving connection.
    pub fn run(&mut self) -> io::Result<()> {
        self.affine_current_thread();
        tracing::debug!("event loop running");
        while self.running {
            let timeout = self.poll_timeout;
            self.run_one(timeout)?;
        }

        // One final queue drain so work posted just before the stop sentinel
        // still runs.
        self.drain_procs();

        let survivors: Vec<Arc<TcpConnection>> = self.conns.values().cloned().collect();
        for conn in survivors {
            conn.force_disconnect(self, DisconnectReason::Shutdown);
        }
        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// One loop iteration: poll (bounded by `max_wait` and the nearest
    /// timer), dispatch readiness handlers, drain queued procs once, run
    /// expired timers.
    pub fn run_one(&mut self, max_wait: Duration) -> io::Result<()> {
        self.affine_current_thread();

        let timeout = if !self.procs.is_empty() {
            Duration::ZERO
        } else {
            match self.timers.peek() {
                Some(Reverse(t)) => max_wait.min(t.deadline.saturating_duration_since(Instant::now())),
                None => max_wait,
            }
        };
        self.poller.poll(Some(timeout))?;

        let events: Vec<(RawFd, Interest)> = self.poller.events().to_vec();
        for (fd, ready) in events {
            if fd == self.waker.fd() {
                self.waker.drain();
                continue;
            }
            let conn = match self.conns.get(&fd) {
                Some(c) => Arc::clone(c),
                None => continue,
            };
            if ready.contains(Interest::READABLE) {
                conn.handle_readable(self);
            }
            // The read side may have disconnected the connection.
            if ready.contains(Interest::WRITABLE) && self.conns.contains_key(&fd) {
                conn.handle_writable(self);
            }
        }

        self.drain_procs();
        self.run_expired_timers();
        Ok(())
    }

    /// Drain the proc queue exactly once. The length snapshot means work
    /// enqueued while draining runs on the next iteration, so producers
    /// cannot starve the loop.
    fn drain_procs(&mut self) {
        let queued = self.procs.len();
        for _ in 0..queued {
            match self.procs.try_recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }

    fn run_expired_timers(&mut self) {
        let now = Instant::now();
        loop {
            match self.timers.peek() {
                Some(Reverse(t)) if t.deadline <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.timers.pop() else { break };
            (entry.task)(self);
        }
    }

    fn affine_current_thread(&self) {
        let _ = self.thread.set(thread::current().id());
    }

    pub(crate) fn add_timer(&mut self, deadline: Instant, task: AsyncProc) {
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            deadline,
            seq: self.timer_seq,
            task,
        }));
    }

    pub(crate) fn register_connection(&mut self, conn: &Arc<TcpConnection>, interest: Interest) {
        self.poller.add(conn.fd(), interest);
        self.conns.insert(conn.fd(), Arc::clone(conn));
    }

    pub(crate) fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        self.poller.modify(fd, interest);
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) {
        self.poller.remove(fd);
        self.conns.remove(&fd);
    }
}

/// Thread-safe face of an [`EventLoop`].
///
/// Cloneable and cheap; holding a handle does not keep the loop alive. Work
/// posted after the loop exits is silently discarded.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<AsyncProc>,
    waker: Arc<Waker>,
    thread: Arc<OnceLock<ThreadId>>,
}

impl LoopHandle {
    /// Run `f` on the loop thread. Procs from a single producer run in the
    /// order they were posted.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.post_proc(Box::new(move |_el: &mut EventLoop| {
            run_isolated("posted task", f);
        }));
    }

    /// Run `f` on the loop thread once `delay` has elapsed.
    pub fn post_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let deadline = Instant::now() + delay;
        self.post_proc(Box::new(move |el: &mut EventLoop| {
            el.add_timer(
                deadline,
                Box::new(move |_el: &mut EventLoop| {
                    run_isolated("timer task", f);
                }),
            );
        }));
    }

    /// Force the loop out of `poll`.
    pub fn wake(&self) {
        self.waker.wake();
    }

    /// Ask the loop to exit. The loop drains its queue once more, then
    /// force-disconnects surviving connections and returns from `run`.
    pub fn stop(&self) {
        self.post_proc(Box::new(|el: &mut EventLoop| {
            el.running = false;
        }));
    }

    /// Whether the calling thread is the thread driving this loop.
    pub fn is_loop_thread(&self) -> bool {
        self.thread
            .get()
            .map(|t| *t == thread::current().id())
            .unwrap_or(false)
    }

    pub(crate) fn post_proc(&self, task: AsyncProc) {
        if self.tx.send(task).is_ok() {
            self.waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn spawn_loop(config: LoopConfig) -> (LoopHandle, thread::JoinHandle<()>) {
        let mut el = EventLoop::new(config).unwrap();
        let handle = el.handle();
        let join = thread::spawn(move || {
            el.run().unwrap();
        });
        (handle, join)
    }

    #[test]
    fn posted_procs_run_in_order() {
        // A long poll timeout proves wakeups interrupt the poll.
        let (handle, join) = spawn_loop(LoopConfig {
            poll_timeout: Duration::from_secs(5),
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            handle.post(move || seen.lock().unwrap().push(i));
        }
        handle.stop();
        join.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let (handle, join) = spawn_loop(LoopConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = Arc::clone(&seen);
        let s2 = Arc::clone(&seen);
        handle.post_after(Duration::from_millis(60), move || {
            s1.lock().unwrap().push("late")
        });
        handle.post_after(Duration::from_millis(10), move || {
            s2.lock().unwrap().push("early")
        });

        thread::sleep(Duration::from_millis(200));
        handle.stop();
        join.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn panicking_proc_does_not_kill_loop() {
        let (handle, join) = spawn_loop(LoopConfig::default());

        let seen = Arc::new(Mutex::new(false));
        handle.post(|| panic!("boom"));
        let s = Arc::clone(&seen);
        handle.post(move || *s.lock().unwrap() = true);

        thread::sleep(Duration::from_millis(100));
        handle.stop();
        join.join().unwrap();
        assert!(*seen.lock().unwrap());
    }

    #[test]
    fn is_loop_thread_detection() {
        let (handle, join) = spawn_loop(LoopConfig::default());
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_loop_thread());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = handle.clone();
        handle.post(move || {
            let _ = tx.send(probe.is_loop_thread());
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());

        handle.stop();
        join.join().unwrap();
    }
}
