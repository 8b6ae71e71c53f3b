//! Core types shared by the reactor and the connections registered with it.

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;

/// A channel registered with the reactor. Channels are identified by their
/// raw descriptor; the owner keeps the descriptor open while events are
/// pending.
pub type Channel = RawFd;

/// Readiness an event waits for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// Bytes can be read.
    pub const READ: Interest = Interest(0b001);
    /// Bytes can be written.
    pub const WRITE: Interest = Interest(0b010);
    /// A non-blocking connect finished. The OS reports this as writability.
    pub const CONNECT: Interest = Interest(0b100);

    /// No interest at all.
    pub const fn empty() -> Self {
        Interest(0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set in `self`.
    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// Map to the mio interest used for registration.
    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        let read = self.intersects(Interest::READ);
        let write = self.intersects(Interest::WRITE.bitor(Interest::CONNECT));
        match (read, write) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Readiness reported by a mio event.
    ///
    /// Errors and hang-ups wake every kind of interest so handlers get a
    /// chance to observe the failure through their own syscalls.
    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        if event.is_error() {
            return Interest::READ | Interest::WRITE | Interest::CONNECT;
        }
        let mut ready = Interest::empty();
        if event.is_readable() || event.is_read_closed() {
            ready = ready | Interest::READ;
        }
        if event.is_writable() || event.is_write_closed() {
            ready = ready | Interest::WRITE | Interest::CONNECT;
        }
        ready
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(3);
        if self.intersects(Interest::READ) {
            names.push("READ");
        }
        if self.intersects(Interest::WRITE) {
            names.push("WRITE");
        }
        if self.intersects(Interest::CONNECT) {
            names.push("CONNECT");
        }
        if names.is_empty() {
            write!(f, "(empty)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// How an event behaves once it has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags {
    /// Keep the event registered after it fires.
    pub repeating: bool,
    /// Switch the channel to blocking mode before the handler runs. The
    /// handler restores non-blocking mode when it is done.
    pub blocking_after_fire: bool,
}

impl EventFlags {
    pub const ONE_SHOT: EventFlags = EventFlags {
        repeating: false,
        blocking_after_fire: false,
    };

    pub const REPEATING: EventFlags = EventFlags {
        repeating: true,
        blocking_after_fire: false,
    };

    /// Same flags with blocking-after-fire set.
    pub const fn blocking(self) -> Self {
        EventFlags {
            repeating: self.repeating,
            blocking_after_fire: true,
        }
    }
}

/// Identifies a timer scheduled on the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

/// Toggle `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_union() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.contains(Interest::READ));
        assert!(both.contains(Interest::WRITE));
        assert!(!both.contains(Interest::CONNECT));
        assert!(both.intersects(Interest::WRITE | Interest::CONNECT));
    }

    #[test]
    fn test_interest_empty() {
        assert!(Interest::empty().is_empty());
        assert!(Interest::default().is_empty());
        assert!(Interest::empty().to_mio().is_none());
    }

    #[test]
    fn test_interest_to_mio() {
        assert_eq!(Interest::READ.to_mio(), Some(mio::Interest::READABLE));
        assert_eq!(Interest::CONNECT.to_mio(), Some(mio::Interest::WRITABLE));
        assert_eq!(
            (Interest::READ | Interest::CONNECT).to_mio(),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );
    }

    #[test]
    fn test_interest_debug() {
        assert_eq!(format!("{:?}", Interest::READ | Interest::WRITE), "READ|WRITE");
        assert_eq!(format!("{:?}", Interest::empty()), "(empty)");
    }

    #[test]
    fn test_event_flags() {
        assert!(!EventFlags::ONE_SHOT.repeating);
        assert!(EventFlags::REPEATING.repeating);
        let flags = EventFlags::ONE_SHOT.blocking();
        assert!(flags.blocking_after_fire);
        assert!(!flags.repeating);
    }

    #[test]
    fn test_set_nonblocking_roundtrip() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::fd::AsRawFd;
        let fd = a.as_raw_fd();
        set_nonblocking(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        set_nonblocking(fd, false).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
    }
}
