/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Reconnection helper: watches the control FIFO and hands fresh channel sockets to its worker */
use crate::tag;
use crate::token::ConnectionToken;
use crate::util::*;
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};
use nix::sys::socket;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/** Read a socket path from the control FIFO.
 *
 * The path is terminated by a NUL, a newline, or the end of the read; it
 * must fit in a `sun_path`. Writers keep messages below PIPE_BUF, so one
 * read suffices. */
pub fn read_socket_path(control_pipe: &OwnedFd) -> Result<PathBuf, String> {
    let mut buf = [0_u8; 4096];
    let amt = loop {
        match nix::unistd::read(control_pipe.as_raw_fd(), &mut buf) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Failed to read from control pipe: {}", e));
            }
        }
    };
    let end = buf[..amt]
        .iter()
        .position(|c| *c == b'\0' || *c == b'\n')
        .unwrap_or(amt);
    if end == 0 {
        return Err(tag!("Empty socket path read from control pipe"));
    }
    if end >= SUN_PATH_MAX {
        return Err(tag!(
            "Socket path read from control pipe is too long ({} bytes, expected < {})",
            end,
            SUN_PATH_MAX
        ));
    }
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| tag!("Socket path read from control pipe is not valid UTF-8"))?;
    Ok(PathBuf::from(s))
}

/** Connect to a Unix socket; the result is blocking and cloexec */
pub fn dial_unix(path: &Path) -> Result<OwnedFd, String> {
    let sock = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|x| tag!("Failed to create socket: {}", x))?;
    let addr = socket::UnixAddr::new(path)
        .map_err(|x| tag!("Failed to make socket address from {:?}: {}", path, x))?;
    loop {
        match socket::connect(sock.as_raw_fd(), &addr) {
            Ok(()) => return Ok(sock),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Failed to connect to socket at {:?}: {}", path, e));
            }
        }
    }
}

/** Pass a file descriptor over a Unix stream socket as ancillary data */
pub fn send_one_fd(link: &OwnedFd, fd: RawFd) -> Result<(), String> {
    let iov = [IoSlice::new(&[0_u8])];
    let fds = [fd];
    let cmsg = [socket::ControlMessage::ScmRights(&fds)];
    loop {
        match socket::sendmsg::<()>(
            link.as_raw_fd(),
            &iov,
            &cmsg,
            socket::MsgFlags::empty(),
            None,
        ) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Failed to send fd over link socket: {}", e));
            }
        }
    }
}

/** Receive a file descriptor passed as ancillary data. Returns None on a
 * clean hangup of the link. */
pub fn receive_one_fd(link: &OwnedFd) -> Result<Option<OwnedFd>, String> {
    let mut data = [0_u8; 1];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    loop {
        match socket::recvmsg::<()>(
            link.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            socket::MsgFlags::empty(),
        ) {
            Ok(msg) => {
                if msg.bytes == 0 {
                    return Ok(None);
                }
                let mut received: Option<OwnedFd> = None;
                for c in msg
                    .cmsgs()
                    .map_err(|x| tag!("Failed to parse control messages: {}", x))?
                {
                    if let socket::ControlMessageOwned::ScmRights(fds) = c {
                        for f in fds {
                            if received.is_none() {
                                received = Some(unsafe {
                                    // SAFETY: freshly received fd, owned by no one else
                                    OwnedFd::from_raw_fd(f)
                                });
                            } else {
                                let _ = nix::unistd::close(f);
                            }
                        }
                    }
                }
                return received
                    .map(Some)
                    .ok_or_else(|| tag!("Link message carried no file descriptor"));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Failed to receive fd from link socket: {}", e));
            }
        }
    }
}

/** Run the reconnection helper.
 *
 * Waits on the control FIFO for new socket paths; each one is dialed, the
 * update-flagged token written into it, and the resulting socket passed to
 * the worker over the link. Dial failures are logged and waiting resumes.
 * Exits when the worker hangs up the link. */
pub fn run_reconnect_helper(
    control_pipe: OwnedFd,
    link_fd: OwnedFd,
    token: &ConnectionToken,
) -> Result<(), String> {
    let flagged = token.flag_update();
    debug!(
        "Reconnection helper started, token header {:08x}",
        flagged.header
    );
    while !shutdown_requested() {
        let mut pfds = [
            PollFd::new(control_pipe.as_fd(), PollFlags::POLLIN),
            PollFd::new(link_fd.as_fd(), PollFlags::empty()),
        ];
        match nix::poll::poll(&mut pfds, nix::poll::PollTimeout::NONE) {
            Ok(0) => continue,
            Ok(_) => (),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("Poll failed: {}", e));
            }
        }

        if pfds[1]
            .revents()
            .unwrap_or(PollFlags::empty())
            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR)
        {
            /* Worker has closed its end of the link */
            debug!("Link hangup, reconnection helper exiting");
            break;
        }
        if !pfds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN)
        {
            continue;
        }

        let path = read_socket_path(&control_pipe)?;
        let new_conn = match dial_unix(&path) {
            Ok(c) => c,
            Err(e) => {
                error!("Ignoring replacement socket path {:?}: {}", path, e);
                continue;
            }
        };
        if let Err(e) = write_all(&new_conn, &flagged.to_bytes()) {
            error!("Failed to write token to new connection: {}", e);
            continue;
        }
        if let Err(e) = send_one_fd(&link_fd, new_conn.as_raw_fd()) {
            error!("Failed to pass new connection to worker: {}", e);
        }
        /* drop(new_conn) closes the local copy; the worker owns it now */
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    #[test]
    fn test_read_socket_path() {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        write_all(&w, b"/tmp/some-socket.sock\njunk").unwrap();
        assert_eq!(
            read_socket_path(&r).unwrap(),
            PathBuf::from("/tmp/some-socket.sock")
        );

        write_all(&w, b"nul\0terminated").unwrap();
        assert_eq!(read_socket_path(&r).unwrap(), PathBuf::from("nul"));

        let long = vec![b'a'; 200];
        write_all(&w, &long).unwrap();
        assert!(read_socket_path(&r).is_err());

        write_all(&w, b"\n").unwrap();
        assert!(read_socket_path(&r).is_err());
    }

    #[test]
    fn test_fd_passing() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let payload = crate::shadow::make_memfd(128).unwrap();
        write_all(&payload, b"hello").unwrap();

        send_one_fd(&a, payload.as_raw_fd()).unwrap();
        let got = receive_one_fd(&b).unwrap().unwrap();
        /* the received fd refers to the same file */
        let mut buf = [0_u8; 5];
        nix::sys::uio::pread(&got, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");

        drop(a);
        assert!(receive_one_fd(&b).unwrap().is_none());
    }
}
