//! Level-triggered readiness set over `poll(2)`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags::bitflags! {
    /// Readiness interest / result mask for a registered fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

impl Interest {
    fn poll_events(self) -> libc::c_short {
        let mut ev = 0;
        if self.contains(Interest::READABLE) {
            ev |= libc::POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            ev |= libc::POLLOUT;
        }
        ev
    }

    fn from_revents(revents: libc::c_short) -> Self {
        let mut ready = Interest::empty();
        // Errors and hang-ups surface as both directions so whichever handler
        // is registered runs and observes the failure through the socket.
        let fail = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
        if fail || revents & libc::POLLIN != 0 {
            ready |= Interest::READABLE;
        }
        if fail || revents & libc::POLLOUT != 0 {
            ready |= Interest::WRITABLE;
        }
        ready
    }
}

/// Registration table plus the results of the most recent poll.
///
/// Every fd present in the set must be open; the owner removes an fd before
/// closing it.
pub struct Poller {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
    ready: Vec<(RawFd, Interest)>,
    ready_by_fd: HashMap<RawFd, Interest>,
}

impl Poller {
    pub fn new() -> Self {
        Poller {
            fds: Vec::new(),
            index: HashMap::new(),
            ready: Vec::new(),
            ready_by_fd: HashMap::new(),
        }
    }

    /// Register `fd`, or widen its interest if already registered.
    pub fn add(&mut self, fd: RawFd, interest: Interest) {
        match self.index.get(&fd) {
            Some(&i) => {
                self.fds[i].events |= interest.poll_events();
            }
            None => {
                self.index.insert(fd, self.fds.len());
                self.fds.push(libc::pollfd {
                    fd,
                    events: interest.poll_events(),
                    revents: 0,
                });
            }
        }
    }

    /// Replace the interest mask for a registered fd. No-op if unknown.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) {
        if let Some(&i) = self.index.get(&fd) {
            self.fds[i].events = interest.poll_events();
        }
    }

    /// Drop an fd from the set entirely.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(i) = self.index.remove(&fd) {
            self.fds.swap_remove(i);
            if i < self.fds.len() {
                self.index.insert(self.fds[i].fd, i);
            }
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.index.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait for readiness. `None` blocks indefinitely, `Some(0)` returns
    /// without blocking. Returns the number of fds with events.
    ///
    /// Level-triggered: an fd that stays ready keeps reporting ready on
    /// every subsequent poll.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();
        self.ready_by_fd.clear();

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let ready = Interest::from_revents(pfd.revents);
            if !ready.is_empty() {
                self.ready.push((pfd.fd, ready));
                self.ready_by_fd.insert(pfd.fd, ready);
            }
        }
        Ok(self.ready.len())
    }

    /// Whether `fd` reported any of `interest` in the most recent poll.
    pub fn check(&self, fd: RawFd, interest: Interest) -> bool {
        self.ready_by_fd
            .get(&fd)
            .map(|r| r.intersects(interest))
            .unwrap_or(false)
    }

    /// The fds (and their readiness) reported by the most recent poll.
    pub fn events(&self) -> &[(RawFd, Interest)] {
        &self.ready
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn empty_poll_times_out() {
        let mut poller = Poller::new();
        let n = poller.poll(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(n, 0);
        assert!(poller.events().is_empty());
    }

    #[test]
    fn readable_after_write() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new();
        poller.add(b.as_raw_fd(), Interest::READABLE);

        a.write_all(b"x").unwrap();
        let n = poller.poll(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert!(poller.check(b.as_raw_fd(), Interest::READABLE));

        // Level-triggered: still ready on the next poll.
        let n = poller.poll(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert!(poller.check(b.as_raw_fd(), Interest::READABLE));
    }

    #[test]
    fn writable_socket_reports_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new();
        poller.add(a.as_raw_fd(), Interest::WRITABLE);

        let n = poller.poll(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert!(poller.check(a.as_raw_fd(), Interest::WRITABLE));
        assert!(!poller.check(a.as_raw_fd(), Interest::READABLE));
    }

    #[test]
    fn remove_stops_reporting() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new();
        poller.add(b.as_raw_fd(), Interest::READABLE);
        a.write_all(b"x").unwrap();

        poller.remove(b.as_raw_fd());
        assert!(!poller.contains(b.as_raw_fd()));
        let n = poller.poll(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn swap_remove_keeps_index_consistent() {
        let mut pairs: Vec<_> = (0..4).map(|_| UnixStream::pair().unwrap()).collect();
        let mut poller = Poller::new();
        for (_, b) in &pairs {
            poller.add(b.as_raw_fd(), Interest::READABLE);
        }
        // Remove the first; the last registration is swapped into its slot.
        poller.remove(pairs[0].1.as_raw_fd());
        assert_eq!(poller.len(), 3);

        let last_fd = pairs[3].1.as_raw_fd();
        pairs[3].0.write_all(b"x").unwrap();
        let n = poller.poll(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert!(poller.check(last_fd, Interest::READABLE));
    }
}
