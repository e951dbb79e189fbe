use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use super::{WatchEvent, WatchToken};

const WATCH_MASK: u32 = libc::IN_MODIFY | libc::IN_ATTRIB | libc::IN_DELETE_SELF;

/// File watches never carry a name, so every event is exactly this long
const EVENT_SIZE: usize = std::mem::size_of::<libc::inotify_event>();

#[derive(Debug)]
pub(super) struct Queue {
    fd: OwnedFd,
}

impl Queue {
    pub(super) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(super) fn register(&self, file: &File, path: &Path) -> io::Result<WatchToken> {
        // Watch the inode behind the open descriptor, not whatever the path names now
        let by_fd = format!("/proc/self/fd/{}", file.as_raw_fd());
        let wd = match self.add_watch(Path::new(&by_fd)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("/proc unavailable, watching {} by path", path.display());
                self.add_watch(path)?
            }
            result => result?,
        };
        Ok(WatchToken(wd))
    }

    fn add_watch(&self, path: &Path) -> io::Result<i32> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(wd)
    }

    pub(super) fn deregister(&self, token: WatchToken, _file: &File) -> io::Result<()> {
        let rc = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), token.0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // EINVAL: the kernel already removed the watch
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(err);
            }
        }
        Ok(())
    }

    pub(super) fn next_event(&self) -> io::Result<Option<WatchEvent>> {
        let mut raw = [0u8; EVENT_SIZE];
        let n = loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    raw.as_mut_ptr() as *mut libc::c_void,
                    raw.len(),
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        };

        if n < EVENT_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated inotify event",
            ));
        }

        let event: libc::inotify_event =
            unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::inotify_event) };

        if event.mask & libc::IN_Q_OVERFLOW != 0 {
            return Err(io::Error::other("inotify event queue overflowed"));
        }

        Ok(Some(WatchEvent {
            token: WatchToken(event.wd),
            written: event.mask & libc::IN_MODIFY != 0,
            attrib: event.mask & libc::IN_ATTRIB != 0,
            deleted: event.mask & libc::IN_DELETE_SELF != 0,
            released: event.mask & libc::IN_IGNORED != 0,
        }))
    }
}

impl AsFd for Queue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
