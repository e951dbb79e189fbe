use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

use super::{WatchEvent, WatchToken};

const WATCH_FFLAGS: u32 =
    libc::NOTE_WRITE | libc::NOTE_EXTEND | libc::NOTE_ATTRIB | libc::NOTE_DELETE;

#[derive(Debug)]
pub(super) struct Queue {
    fd: OwnedFd,
}

impl Queue {
    pub(super) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn change(&self, ident: i32, flags: u32, fflags: u32) -> io::Result<()> {
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = ident as libc::uintptr_t;
        kev.filter = libc::EVFILT_VNODE as _;
        kev.flags = flags as _;
        kev.fflags = fflags as _;

        let rc = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                &kev,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn register(&self, file: &File, _path: &Path) -> io::Result<WatchToken> {
        let ident = file.as_raw_fd();
        self.change(ident, (libc::EV_ADD | libc::EV_CLEAR) as u32, WATCH_FFLAGS)?;
        Ok(WatchToken(ident))
    }

    pub(super) fn deregister(&self, token: WatchToken, _file: &File) -> io::Result<()> {
        match self.change(token.0, libc::EV_DELETE as u32, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            result => result,
        }
    }

    pub(super) fn next_event(&self) -> io::Result<Option<WatchEvent>> {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };

        let n = loop {
            let n = unsafe {
                libc::kevent(
                    self.fd.as_raw_fd(),
                    std::ptr::null(),
                    0,
                    &mut kev,
                    1,
                    &timeout,
                )
            };
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if n == 0 {
            return Ok(None);
        }
        if (kev.flags as u32) & (libc::EV_ERROR as u32) != 0 {
            return Err(io::Error::from_raw_os_error(kev.data as i32));
        }

        let fflags = kev.fflags as u32;
        Ok(Some(WatchEvent {
            token: WatchToken(kev.ident as i32),
            written: fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0,
            attrib: fflags & libc::NOTE_ATTRIB != 0,
            deleted: fflags & libc::NOTE_DELETE != 0,
            released: false,
        }))
    }
}

impl AsFd for Queue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
