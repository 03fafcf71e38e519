//! Bounded poll set: (fd, interest, readiness) triples over `poll(2)`.
//!
//! Interest is expressed in the engine's own flag byte and translated to OS
//! poll flags at the syscall boundary:
//!
//! ```text
//! interest -> events:   READ, CLOSE -> POLLIN | POLLHUP    WRITE -> POLLOUT
//! revents -> readiness: POLLIN | POLLPRI -> READ           POLLHUP -> CLOSE
//!                       POLLOUT | POLLWRBAND -> WRITE
//! ```
//!
//! Entries merge by fd; zero-interest entries are removed by [`PollSet::sweep`].

use std::fmt;
use std::ops::BitOr;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// What a watcher cares about on an fd, and what `poll` reported back.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1 << 0);
    pub const WRITE: Interest = Interest(1 << 1);
    pub const CLOSE: Interest = Interest(1 << 2);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` present.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` present.
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn minus(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut sep = "";
        for (flag, name) in [
            (Interest::READ, "READ"),
            (Interest::WRITE, "WRITE"),
            (Interest::CLOSE, "CLOSE"),
        ] {
            if self.contains(flag) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        Ok(())
    }
}

/// Interest flags to `poll(2)` request events.
fn interest_to_events(interest: Interest) -> PollFlags {
    let mut events = PollFlags::empty();
    if interest.intersects(Interest::READ | Interest::CLOSE) {
        events |= PollFlags::POLLIN | PollFlags::POLLHUP;
    }
    if interest.contains(Interest::WRITE) {
        events |= PollFlags::POLLOUT;
    }
    events
}

/// `poll(2)` returned events to readiness flags.
fn readiness_from_events(revents: PollFlags) -> Interest {
    let mut readiness = Interest::NONE;
    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
        readiness = readiness | Interest::READ;
    }
    if revents.contains(PollFlags::POLLHUP) {
        readiness = readiness | Interest::CLOSE;
    }
    if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLWRBAND) {
        readiness = readiness | Interest::WRITE;
    }
    readiness
}

/// The poll set is at capacity and cannot accept a new fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("poll set full ({capacity} entries)")]
pub struct PollSetFull {
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    pub fd: RawFd,
    pub interest: Interest,
    pub readiness: Interest,
}

/// Fixed-capacity set of watched fds.
#[derive(Debug, Clone, Default)]
pub struct PollSet {
    entries: Vec<PollEntry>,
    capacity: usize,
}

impl PollSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|e| e.fd == fd)
    }

    pub fn interest_of(&self, fd: RawFd) -> Interest {
        self.entries
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.interest)
            .unwrap_or(Interest::NONE)
    }

    /// Merge interest flags for `fd`: an existing entry becomes
    /// `(interest | add) & !remove`, an absent fd is appended with
    /// `add & !remove`. A remove-only call on an absent fd is a no-op;
    /// appending to a full table fails.
    pub fn update(&mut self, fd: RawFd, add: Interest, remove: Interest) -> Result<(), PollSetFull> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.fd == fd) {
            entry.interest = entry.interest.union(add).minus(remove);
            return Ok(());
        }
        if add.is_empty() {
            return Ok(());
        }
        if self.entries.len() == self.capacity {
            return Err(PollSetFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(PollEntry {
            fd,
            interest: add.minus(remove),
            readiness: Interest::NONE,
        });
        Ok(())
    }

    /// Drop zero-interest entries.
    pub fn sweep(&mut self) {
        self.entries.retain(|e| !e.interest.is_empty());
    }

    /// Wait for readiness on every entry, storing the translated result back
    /// into the set. `EINTR` is retried transparently; other failures are
    /// returned as I/O errors.
    pub fn poll(&mut self, timeout: PollTimeout) -> Result<usize, std::io::Error> {
        loop {
            let mut fds: Vec<PollFd<'_>> = self
                .entries
                .iter()
                .map(|e| {
                    // SAFETY: watched fds are owned by the host (or the
                    // transport) and stay open for the duration of this call.
                    let fd = unsafe { BorrowedFd::borrow_raw(e.fd) };
                    PollFd::new(fd, interest_to_events(e.interest))
                })
                .collect();
            match poll(&mut fds, timeout) {
                Ok(n) => {
                    for (entry, pfd) in self.entries.iter_mut().zip(&fds) {
                        entry.readiness = pfd
                            .revents()
                            .map(readiness_from_events)
                            .unwrap_or(Interest::NONE);
                    }
                    return Ok(n as usize);
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(std::io::Error::from(errno)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_add_then_remove() {
        let mut set = PollSet::with_capacity(4);
        set.update(3, Interest::READ, Interest::NONE).unwrap();
        set.update(3, Interest::WRITE, Interest::NONE).unwrap();
        set.update(3, Interest::NONE, Interest::READ).unwrap();
        assert_eq!(set.interest_of(3), Interest::WRITE);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn append_applies_remove_mask() {
        let mut set = PollSet::with_capacity(4);
        set.update(5, Interest::READ | Interest::WRITE, Interest::WRITE)
            .unwrap();
        assert_eq!(set.interest_of(5), Interest::READ);
    }

    #[test]
    fn remove_only_on_absent_fd_is_noop() {
        let mut set = PollSet::with_capacity(1);
        set.update(9, Interest::READ, Interest::NONE).unwrap();
        // table is full, but a pure removal of an unknown fd still succeeds
        set.update(7, Interest::NONE, Interest::READ).unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.contains(7));
    }

    #[test]
    fn full_table_add_fails() {
        let mut set = PollSet::with_capacity(2);
        set.update(1, Interest::READ, Interest::NONE).unwrap();
        set.update(2, Interest::READ, Interest::NONE).unwrap();
        let err = set.update(3, Interest::READ, Interest::NONE).unwrap_err();
        assert_eq!(err, PollSetFull { capacity: 2 });
        // merging into an existing entry still works at capacity
        set.update(2, Interest::WRITE, Interest::NONE).unwrap();
        assert_eq!(set.interest_of(2), Interest::READ | Interest::WRITE);
    }

    #[test]
    fn sweep_drops_zero_interest() {
        let mut set = PollSet::with_capacity(4);
        set.update(1, Interest::READ, Interest::NONE).unwrap();
        set.update(2, Interest::WRITE, Interest::NONE).unwrap();
        set.update(1, Interest::NONE, Interest::READ).unwrap();
        set.sweep();
        assert_eq!(set.len(), 1);
        assert!(!set.contains(1));
        assert!(set.contains(2));
    }

    #[test]
    fn interest_translation() {
        assert_eq!(
            interest_to_events(Interest::READ),
            PollFlags::POLLIN | PollFlags::POLLHUP
        );
        assert_eq!(
            interest_to_events(Interest::CLOSE),
            PollFlags::POLLIN | PollFlags::POLLHUP
        );
        assert_eq!(interest_to_events(Interest::WRITE), PollFlags::POLLOUT);
        assert_eq!(
            interest_to_events(Interest::READ | Interest::WRITE),
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLOUT
        );
        assert_eq!(interest_to_events(Interest::NONE), PollFlags::empty());
    }

    #[test]
    fn readiness_translation() {
        assert_eq!(readiness_from_events(PollFlags::POLLIN), Interest::READ);
        assert_eq!(readiness_from_events(PollFlags::POLLPRI), Interest::READ);
        assert_eq!(readiness_from_events(PollFlags::POLLHUP), Interest::CLOSE);
        assert_eq!(readiness_from_events(PollFlags::POLLOUT), Interest::WRITE);
        assert_eq!(readiness_from_events(PollFlags::POLLWRBAND), Interest::WRITE);
        assert_eq!(
            readiness_from_events(PollFlags::POLLIN | PollFlags::POLLHUP),
            Interest::READ | Interest::CLOSE
        );
        assert_eq!(readiness_from_events(PollFlags::empty()), Interest::NONE);
    }

    #[test]
    fn interest_debug_lists_flags() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(format!("{:?}", Interest::READ | Interest::CLOSE), "READ|CLOSE");
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        use std::io::Write;
        use std::os::fd::AsRawFd;

        let mut set = PollSet::with_capacity(1);
        set.update(reader.as_raw_fd(), Interest::READ, Interest::NONE)
            .unwrap();
        writer.write_all(b"x").unwrap();

        let n = set.poll(PollTimeout::from(1000u16)).unwrap();
        assert_eq!(n, 1);
        assert!(set.entries()[0].readiness.contains(Interest::READ));
    }

    #[test]
    fn poll_times_out_on_quiet_pipe() {
        let (reader, _writer) = std::io::pipe().unwrap();
        use std::os::fd::AsRawFd;

        let mut set = PollSet::with_capacity(1);
        set.update(reader.as_raw_fd(), Interest::READ, Interest::NONE)
            .unwrap();
        let n = set.poll(PollTimeout::from(10u16)).unwrap();
        assert_eq!(n, 0);
        assert!(set.entries()[0].readiness.is_empty());
    }
}
