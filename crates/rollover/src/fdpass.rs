//! SCM_RIGHTS descriptor passing over a connected Unix stream.
//!
//! Each call moves exactly one descriptor, attached as ancillary data to a
//! single marker byte. Keeping the payload to one byte means the control
//! message can never straddle a read boundary, so the surrounding protocol
//! is free to interleave ordinary length-prefixed frames on the same
//! stream.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Control-message buffer size for a single descriptor.
fn cmsg_space_one() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }
}

/// Send `byte` with `fd` attached as an SCM_RIGHTS control message.
pub(crate) async fn send_fd(stream: &UnixStream, byte: u8, fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    stream
        .async_io(Interest::WRITABLE, || send_fd_raw(stream.as_raw_fd(), byte, raw))
        .await
}

/// Receive one marker byte and the descriptor attached to it.
pub(crate) async fn recv_fd(stream: &UnixStream) -> io::Result<(u8, OwnedFd)> {
    stream
        .async_io(Interest::READABLE, || recv_fd_raw(stream.as_raw_fd()))
        .await
}

fn send_fd_raw(sock: RawFd, byte: u8, fd: RawFd) -> io::Result<()> {
    let buf = [byte];
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = vec![0u8; cmsg_space_one()];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    // msg_controllen is usize on Linux, u32 elsewhere.
    msg.msg_controllen = cmsg_buf.len() as _;

    let cmsg: *mut libc::cmsghdr = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "control buffer too small for one descriptor",
        ));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(&fd, libc::CMSG_DATA(cmsg).cast::<RawFd>(), 1);
    }

    let sent = unsafe { libc::sendmsg(sock, &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_fd_raw(sock: RawFd) -> io::Result<(u8, OwnedFd)> {
    let mut buf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = vec![0u8; cmsg_space_one()];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len() as _;

    let received = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the socket mid-transfer",
        ));
    }

    // Collect every descriptor before validating, so unexpected extras are
    // wrapped and closed instead of leaking.
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = payload / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }

    let mut fds = fds.into_iter();
    match (fds.next(), fds.next()) {
        (Some(fd), None) => Ok((buf[0], fd)),
        (None, _) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected one descriptor in the control message, got none",
        )),
        (Some(_), Some(_)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected one descriptor in the control message, got several",
        )),
    }
}
