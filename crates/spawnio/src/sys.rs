//! Thin wrappers over the few raw syscalls the stream layer needs.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Put `fd` into non-blocking mode. Also validates the descriptor: `EBADF`
/// surfaces here before anything is registered with the reactor.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if flags.contains(OFlag::O_NONBLOCK) {
        return Ok(());
    }
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Bytes the kernel reports as immediately readable (`FIONREAD`).
///
/// `None` when the descriptor type does not support the query.
pub(crate) fn bytes_available(fd: BorrowedFd<'_>) -> Option<usize> {
    let mut available: libc::c_int = 0;
    // Safety: FIONREAD writes a single c_int through the pointer we pass.
    let rc = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            libc::FIONREAD,
            &mut available as *mut libc::c_int,
        )
    };
    if rc < 0 {
        return None;
    }
    usize::try_from(available).ok()
}

/// Block the calling thread until `fd` reports one of `events`.
pub(crate) fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags) -> io::Result<()> {
    let mut fds = [PollFd::new(fd, events)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
