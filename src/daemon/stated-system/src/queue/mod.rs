//! Event multiplexer
//!
//! One kernel event queue per client. Every subscription adds a file-level
//! watch that fires on data writes, attribute changes and deletion. The queue
//! knows nothing about names; ready events carry a [`WatchToken`] the client
//! correlates back to its subscription.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;
#[cfg(any(target_os = "linux", target_os = "android"))]
use self::inotify as sys;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
use self::kqueue as sys;

/// Identity of one registered watch
///
/// A watch descriptor with inotify, the watched file descriptor with kqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub(crate) i32);

impl WatchToken {
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

/// A ready event drained from the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub token: WatchToken,
    /// File contents were written (or extended)
    pub written: bool,
    /// File metadata changed, including its link count
    pub attrib: bool,
    /// The watched file was deleted
    pub deleted: bool,
    /// The kernel dropped the watch; nothing further will arrive for it
    pub released: bool,
}

/// Kernel event queue shared by all subscriptions of a client
#[derive(Debug)]
pub struct EventQueue {
    inner: sys::Queue,
}

impl EventQueue {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: sys::Queue::new()?,
        })
    }

    /// Start watching `file`, which was opened from `path`
    pub fn register(&self, file: &File, path: &Path) -> io::Result<WatchToken> {
        self.inner.register(file, path)
    }

    /// Stop watching; a watch the kernel already dropped is not an error
    pub fn deregister(&self, token: WatchToken, file: &File) -> io::Result<()> {
        self.inner.deregister(token, file)
    }

    /// Drain at most one pending event without blocking
    pub fn next_event(&self) -> io::Result<Option<WatchEvent>> {
        self.inner.next_event()
    }

    /// Block until an event is pending or `timeout` elapses (`None` waits forever)
    ///
    /// Returns whether the queue is readable. A signal interrupting the wait
    /// returns `false`.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = match timeout {
            Some(timeout) => i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };

        let mut poll_fd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let result = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(result > 0 && (poll_fd.revents & libc::POLLIN) != 0)
    }
}

impl AsRawFd for EventQueue {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_fd().as_raw_fd()
    }
}

impl AsFd for EventQueue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn watched(dir: &TempDir, queue: &EventQueue) -> (File, std::path::PathBuf, WatchToken) {
        let path = dir.path().join("watched");
        std::fs::write(&path, b"").unwrap();
        let file = File::open(&path).unwrap();
        let token = queue.register(&file, &path).unwrap();
        (file, path, token)
    }

    #[test]
    fn test_idle_queue_has_no_events() {
        let queue = EventQueue::new().unwrap();
        assert!(queue.next_event().unwrap().is_none());
        assert!(!queue.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_write_is_reported_once() {
        let dir = TempDir::new().unwrap();
        let queue = EventQueue::new().unwrap();
        let (_file, path, token) = watched(&dir, &queue);

        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"hello").unwrap();

        assert!(queue.wait(Some(Duration::from_secs(5))).unwrap());
        let event = queue.next_event().unwrap().unwrap();
        assert_eq!(event.token, token);
        assert!(event.written);
        assert!(!event.deleted);
        assert!(queue.next_event().unwrap().is_none());
    }

    #[test]
    fn test_unlink_is_reported() {
        let dir = TempDir::new().unwrap();
        let queue = EventQueue::new().unwrap();
        let (file, path, token) = watched(&dir, &queue);

        std::fs::remove_file(&path).unwrap();

        let event = queue.next_event().unwrap().unwrap();
        assert_eq!(event.token, token);
        // inotify reports the link count change while the file is still open
        assert!(event.deleted || event.attrib);
        use std::os::unix::fs::MetadataExt;
        assert_eq!(file.metadata().unwrap().nlink(), 0);
    }

    #[test]
    fn test_deregistered_watch_goes_quiet() {
        let dir = TempDir::new().unwrap();
        let queue = EventQueue::new().unwrap();
        let (file, path, token) = watched(&dir, &queue);

        queue.deregister(token, &file).unwrap();
        std::fs::write(&path, b"ignored").unwrap();

        while let Some(event) = queue.next_event().unwrap() {
            assert!(event.released, "unexpected event {event:?}");
        }
    }
}
