//! File descriptor transfer over Unix sockets
//!
//! Thin wrappers over `sendmsg`/`recvmsg` with `SCM_RIGHTS` ancillary data.
//! This is the only place where OS handles cross the process boundary.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// Maximum number of descriptors accepted in one message
pub const MAX_FDS: usize = 8;

fn cmsg_space(fd_count: usize) -> usize {
    // SAFETY: CMSG_SPACE is a pure arithmetic macro.
    unsafe { libc::CMSG_SPACE((fd_count * std::mem::size_of::<RawFd>()) as u32) as usize }
}

/// Send `data` with `fds` attached to its first byte
///
/// A short write of the payload is completed with plain writes; the
/// descriptors travel with the first chunk.
pub fn send_with_fds(stream: &UnixStream, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    if data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "ancillary data needs a non-empty payload",
        ));
    }
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("too many descriptors: {} (max {})", fds.len(), MAX_FDS),
        ));
    }

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // u64 storage keeps the control buffer aligned for cmsghdr
    let space = cmsg_space(fds.len());
    let mut control = vec![0u64; space.div_ceil(8)];

    // SAFETY: msghdr is a plain C struct; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        // SAFETY: the control buffer is large enough for one cmsghdr carrying
        // fds.len() descriptors (CMSG_SPACE above), and is suitably aligned.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _;
            let payload = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                payload.add(i).write_unaligned(fd.as_raw_fd());
            }
        }
    }

    let sent = loop {
        // SAFETY: msg points at live iov/control buffers for the duration of the call.
        let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    if sent < data.len() {
        let mut writer = stream;
        writer.write_all(&data[sent..])?;
    }

    Ok(())
}

/// Receive up to `buf.len()` bytes and any descriptors attached to them
///
/// Returns the number of bytes read (0 on orderly shutdown) and the received
/// descriptors, which are close-on-exec.
pub fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let space = cmsg_space(MAX_FDS);
    let mut control = vec![0u64; space.div_ceil(8)];

    // SAFETY: see send_with_fds.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let received = loop {
        // SAFETY: msg points at live buffers owned by this frame.
        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    // SAFETY: walking the control buffer the kernel just filled, bounded by
    // msg_controllen. Each SCM_RIGHTS fd is a fresh descriptor we now own.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / std::mem::size_of::<RawFd>();
                let payload = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(payload.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor list truncated",
        ));
    }

    Ok((received, fds))
}

/// Fill `buf` completely, collecting descriptors attached to the first chunk
///
/// Fails with `UnexpectedEof` if the peer closes before any byte arrives or
/// in the middle of the message.
pub fn recv_exact_with_fds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<Vec<OwnedFd>> {
    let (n, fds) = recv_with_fds(stream, buf)?;
    if n == 0 && !buf.is_empty() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    if n < buf.len() {
        let mut reader = stream;
        reader.read_exact(&mut buf[n..])?;
    }
    Ok(fds)
}

/// Bind a listening socket with an explicit accept backlog
///
/// A stale socket file at `path` is removed first.
pub fn bind_listener(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(path)?;

    // Linux lets listen() be called again to shrink the backlog.
    // SAFETY: the fd is a bound, listening socket owned by `listener`.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(listener)
}

/// UID of the process on the other end of `stream`
pub fn peer_uid(stream: &UnixStream) -> io::Result<u32> {
    // SAFETY: ucred is plain data; getsockopt writes at most `len` bytes into it.
    unsafe {
        let mut creds: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        if libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut creds as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(creds.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use std::os::fd::AsFd;

    #[test]
    fn test_fd_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();

        send_with_fds(&a, b"payload", &[file.as_fd()]).unwrap();

        let mut buf = [0u8; 7];
        let fds = recv_exact_with_fds(&b, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        received.rewind().unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_send_without_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        send_with_fds(&a, &[1, 2, 3], &[]).unwrap();
        let mut buf = [0u8; 3];
        let fds = recv_exact_with_fds(&b, &mut buf).unwrap();
        assert!(fds.is_empty());
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_eof_is_reported() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let err = recv_exact_with_fds(&b, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_peer_uid_is_self() {
        let (a, _b) = UnixStream::pair().unwrap();
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        assert_eq!(peer_uid(&a).unwrap(), uid);
    }
}
