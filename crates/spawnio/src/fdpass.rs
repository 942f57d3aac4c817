//! Descriptor passing over unix domain sockets (`SCM_RIGHTS`).
//!
//! Wire contract: one message per descriptor. The descriptor travels as
//! ancillary data; the payload (a UTF-8 channel name) is the first data
//! segment. Stream sockets cannot carry ancillary data without at least one
//! data byte, so an empty payload is sent as a single NUL and receivers strip
//! trailing NULs.
//!
//! Both calls work on blocking and non-blocking sockets; on a non-blocking
//! socket they wait with `poll(2)` instead of returning `EAGAIN`.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrLike, SockaddrStorage,
    getsockname, recvmsg, sendmsg,
};

use crate::error::DescriptorError;
use crate::sys::wait_ready;

/// Largest payload accepted by [`recv_descriptor`]. Longer payloads are truncated.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Send `fd` over `socket` with `payload` attached.
///
/// The caller keeps ownership of `fd`; the receiver gets its own duplicate.
pub fn send_descriptor(
    socket: BorrowedFd<'_>,
    fd: BorrowedFd<'_>,
    payload: &str,
) -> Result<(), DescriptorError> {
    ensure_unix_socket(socket)?;

    let data: &[u8] = if payload.is_empty() {
        b"\0"
    } else {
        payload.as_bytes()
    };
    let fds = [fd.as_raw_fd()];
    let rights = [ControlMessage::ScmRights(&fds)];

    let mut sent = send_segment(socket, data, &rights)?;
    tracing::trace!(
        socket = socket.as_raw_fd(),
        fd = fd.as_raw_fd(),
        payload,
        "Sent descriptor"
    );

    // The descriptor went out with the first byte; only plain data remains.
    while sent < data.len() {
        sent += send_segment(socket, &data[sent..], &[])?;
    }
    Ok(())
}

/// Receive one descriptor and its payload from `socket`.
///
/// Returns `Ok(None)` when the peer closed the socket.
pub fn recv_descriptor(
    socket: BorrowedFd<'_>,
) -> Result<Option<(OwnedFd, String)>, DescriptorError> {
    ensure_unix_socket(socket)?;

    let mut buf = [0u8; MAX_PAYLOAD_LEN];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);

    loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            recv_flags(),
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                wait_ready(socket, PollFlags::POLLIN)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let len = msg.bytes;
        let mut received = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                // Safety: the kernel installed these descriptors in our table for
                // this message; nothing else refers to them yet.
                received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }

        let payload = String::from_utf8_lossy(&buf[..len])
            .trim_end_matches('\0')
            .to_string();

        let mut received = received.into_iter();
        return match received.next() {
            Some(fd) => {
                if received.len() > 0 {
                    tracing::warn!(
                        extra = received.len(),
                        "Closing surplus descriptors from a single message"
                    );
                }
                tracing::trace!(fd = fd.as_raw_fd(), payload = %payload, "Received descriptor");
                Ok(Some((fd, payload)))
            }
            None if len == 0 => Ok(None),
            None => Err(DescriptorError::MissingDescriptor(payload)),
        };
    }
}

/// Fails with [`DescriptorError::NotUnixSocket`] unless `fd` is an `AF_UNIX` socket.
pub fn ensure_unix_socket(fd: BorrowedFd<'_>) -> Result<(), DescriptorError> {
    match getsockname::<SockaddrStorage>(fd.as_raw_fd()) {
        Ok(addr) if addr.family() == Some(AddressFamily::Unix) => Ok(()),
        Ok(_) | Err(Errno::ENOTSOCK) => Err(DescriptorError::NotUnixSocket),
        Err(e) => Err(e.into()),
    }
}

fn send_segment(
    socket: BorrowedFd<'_>,
    data: &[u8],
    cmsgs: &[ControlMessage<'_>],
) -> Result<usize, DescriptorError> {
    loop {
        let iov = [IoSlice::new(data)];
        match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, send_flags(), None) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_ready(socket, PollFlags::POLLOUT)?,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}
