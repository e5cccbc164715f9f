use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use tracing::trace;

use crate::error::{Result, WireError};
use crate::ring::{FdRing, RingBuffer, BUFFER_SIZE};

/// Maximum file descriptors attached to a single `sendmsg`. Bounding the
/// per-syscall count keeps the control message under the platform's
/// `SCM_RIGHTS` size limit.
pub const MAX_FDS_PER_FLUSH: usize = 28;

/// A buffered, non-blocking connection over a connected Unix stream socket.
///
/// Owns two byte rings (incoming, outgoing) and two fd rings. Payload bytes
/// travel through vectored `recvmsg`/`sendmsg`; file descriptors ride along
/// as `SCM_RIGHTS` ancillary data on the same syscalls.
pub struct Connection {
    socket: OwnedFd,
    incoming: RingBuffer,
    outgoing: RingBuffer,
    fds_in: FdRing,
    fds_out: FdRing,
    want_flush: bool,
}

impl Connection {
    /// Wrap an already-connected stream socket.
    pub fn new(socket: OwnedFd) -> Self {
        Self {
            socket,
            incoming: RingBuffer::new(),
            outgoing: RingBuffer::new(),
            fds_in: FdRing::new(),
            fds_out: FdRing::new(),
            want_flush: false,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn pending_input(&self) -> usize {
        self.incoming.len()
    }

    /// Received file descriptors not yet claimed.
    pub fn incoming_fd_count(&self) -> usize {
        self.fds_in.len()
    }

    /// Perform one non-blocking receive into the incoming ring, extracting
    /// any `SCM_RIGHTS` descriptors into the incoming fd ring.
    ///
    /// Returns the total pending input after the receive. `WouldBlock` means
    /// no data yet; `Closed` means the peer shut down. If more descriptors
    /// arrive than the fd ring can hold, the excess is closed immediately
    /// and the call fails with `Overflow`.
    pub fn read(&mut self) -> Result<usize> {
        if self.incoming.space() == 0 {
            return Err(WireError::Overflow {
                requested: 1,
                available: 0,
            });
        }

        let fd = self.socket.as_raw_fd();
        let (nread, received) = {
            let (a, b) = self.incoming.vacant_spans();
            let second_empty = b.is_empty();
            let mut iovs = [IoSliceMut::new(a), IoSliceMut::new(b)];
            let iov_count = if second_empty { 1 } else { 2 };
            let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_FLUSH]);

            loop {
                match recvmsg::<UnixAddr>(
                    fd,
                    &mut iovs[..iov_count],
                    Some(&mut cmsg),
                    MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => {
                        let mut fds = Vec::new();
                        let cmsgs = msg.cmsgs().map_err(map_errno)?;
                        for control in cmsgs {
                            if let ControlMessageOwned::ScmRights(raw) = control {
                                for r in raw {
                                    // SAFETY: the kernel just installed this
                                    // descriptor for us; nothing else owns it.
                                    fds.push(unsafe { OwnedFd::from_raw_fd(r) });
                                }
                            }
                        }
                        break (msg.bytes, fds);
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => return Err(WireError::WouldBlock),
                    Err(Errno::ECONNRESET) => return Err(WireError::Closed),
                    Err(e) => return Err(map_errno(e)),
                }
            }
        };

        if nread == 0 && received.is_empty() {
            return Err(WireError::Closed);
        }
        self.incoming.fill(nread);
        trace!(bytes = nread, fds = received.len(), "socket receive");

        let mut overflowed = false;
        for fd in received {
            if overflowed || self.fds_in.is_full() {
                overflowed = true;
                drop(fd);
            } else {
                let _ = self.fds_in.push(fd);
            }
        }
        if overflowed {
            return Err(WireError::Overflow {
                requested: 1,
                available: 0,
            });
        }

        Ok(self.pending_input())
    }

    /// Append to the outgoing ring and mark the connection flush-pending.
    /// Flushes synchronously first if the append would overflow; a
    /// `WouldBlock` from that flush is tolerated as long as the ring can
    /// still absorb the data.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.make_room(data.len())?;
        self.outgoing.put(data)?;
        self.want_flush = true;
        Ok(())
    }

    /// Append to the outgoing ring without requesting a flush.
    pub fn queue(&mut self, data: &[u8]) -> Result<()> {
        self.make_room(data.len())?;
        self.outgoing.put(data)
    }

    fn make_room(&mut self, len: usize) -> Result<()> {
        if self.outgoing.len() + len > BUFFER_SIZE {
            self.want_flush = true;
            match self.flush() {
                Ok(_) | Err(WireError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Queue a descriptor for transfer with the next flush. Ownership moves
    /// to the connection; the descriptor is closed once transmitted.
    pub fn push_outgoing_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.fds_out.is_full() {
            self.want_flush = true;
            match self.flush() {
                Ok(_) | Err(WireError::WouldBlock) => {}
                Err(e) => {
                    drop(fd);
                    return Err(e);
                }
            }
        }
        self.fds_out.push(fd)
    }

    /// Claim the next received descriptor, if any.
    pub fn pop_incoming_fd(&mut self) -> Option<OwnedFd> {
        self.fds_in.pop()
    }

    /// Close up to `max` received-but-unclaimed descriptors. Used to discard
    /// descriptors addressed to an object that no longer exists.
    pub fn close_incoming_fds(&mut self, max: usize) {
        self.fds_in.close_first(max);
    }

    /// Send queued output. Each syscall carries one or two iovecs plus up to
    /// [`MAX_FDS_PER_FLUSH`] queued descriptors as ancillary data; exactly
    /// the descriptors transmitted are closed. Returns the number of bytes
    /// flushed.
    pub fn flush(&mut self) -> Result<usize> {
        if !self.want_flush {
            return Ok(0);
        }

        let fd = self.socket.as_raw_fd();
        let mut total = 0usize;
        while !self.outgoing.is_empty() {
            let batch: Vec<RawFd> = self
                .fds_out
                .iter()
                .take(MAX_FDS_PER_FLUSH)
                .map(|f| f.as_raw_fd())
                .collect();

            let sent = {
                let (a, b) = self.outgoing.filled_spans();
                let iovs = [IoSlice::new(a), IoSlice::new(b)];
                let iov_count = if b.is_empty() { 1 } else { 2 };
                let cmsgs = [ControlMessage::ScmRights(&batch)];
                let cmsg_count = usize::from(!batch.is_empty());

                loop {
                    match sendmsg::<UnixAddr>(
                        fd,
                        &iovs[..iov_count],
                        &cmsgs[..cmsg_count],
                        MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
                        None,
                    ) {
                        Ok(n) => break n,
                        Err(Errno::EINTR) => continue,
                        Err(Errno::EAGAIN) => return Err(WireError::WouldBlock),
                        Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                            return Err(WireError::Closed)
                        }
                        Err(e) => return Err(map_errno(e)),
                    }
                }
            };

            // The control message goes out with the first byte, so the whole
            // batch is transmitted even on a partial send.
            self.fds_out.close_first(batch.len());
            self.outgoing.consume(sent);
            total += sent;
        }

        self.want_flush = false;
        trace!(bytes = total, "socket flush");
        Ok(total)
    }

    /// Copy `out.len()` pending incoming bytes without consuming them.
    pub fn copy_incoming(&self, out: &mut [u8]) {
        self.incoming.copy_out(out);
    }

    /// Consume `n` pending incoming bytes.
    pub fn consume_incoming(&mut self, n: usize) {
        self.incoming.consume(n);
    }

    /// Credentials of the connected peer via `SO_PEERCRED`: `(uid, gid,
    /// pid)`, or `None` if the platform does not expose them.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the
        // provided sizes, and the socket descriptor is owned by `self`.
        let rc = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }

    /// Tear the connection down: close every still-queued descriptor in both
    /// directions and hand the socket back to the caller.
    pub fn into_socket(mut self) -> OwnedFd {
        self.fds_out.close_all();
        self.fds_in.close_all();
        self.socket
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

fn map_errno(e: Errno) -> WireError {
    WireError::Io(std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(OwnedFd::from(a)), b)
    }

    fn connected_pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Connection::new(OwnedFd::from(a)),
            Connection::new(OwnedFd::from(b)),
        )
    }

    #[test]
    fn write_flush_read_roundtrip() {
        let (mut left, mut right) = connected_pair();

        left.write(b"twelve bytes").unwrap();
        assert_eq!(left.flush().unwrap(), 12);

        assert_eq!(right.read().unwrap(), 12);
        let mut out = [0u8; 12];
        right.copy_incoming(&mut out);
        right.consume_incoming(12);
        assert_eq!(&out, b"twelve bytes");
    }

    #[test]
    fn queue_does_not_flush_until_asked() {
        let (mut left, mut peer) = pair();
        peer.set_nonblocking(true).unwrap();

        left.queue(b"queued").unwrap();
        // queue() leaves the flush flag clear, so flush() is a no-op.
        assert_eq!(left.flush().unwrap(), 0);

        let mut buf = [0u8; 8];
        assert!(peer.read(&mut buf).is_err(), "nothing should be on the wire");

        left.write(b"!").unwrap();
        assert_eq!(left.flush().unwrap(), 7);
    }

    #[test]
    fn read_with_no_data_would_block() {
        let (mut conn, _peer) = pair();
        assert!(matches!(conn.read(), Err(WireError::WouldBlock)));
    }

    #[test]
    fn read_after_peer_shutdown_is_closed() {
        let (mut conn, peer) = pair();
        drop(peer);
        assert!(matches!(conn.read(), Err(WireError::Closed)));
    }

    #[test]
    fn flush_to_closed_peer_fails() {
        let (mut conn, peer) = pair();
        drop(peer);
        conn.write(b"doomed").unwrap();
        assert!(matches!(
            conn.flush(),
            Err(WireError::Closed) | Err(WireError::Io(_))
        ));
    }

    #[test]
    fn oversized_write_flushes_first() {
        let (mut left, mut peer) = pair();

        let big = vec![0x5au8; BUFFER_SIZE - 16];
        left.write(&big).unwrap();
        // This append would overflow, forcing a synchronous flush of the
        // first chunk before buffering the second.
        left.write(&[0xA5u8; 64]).unwrap();
        left.flush().unwrap();

        let mut got = Vec::new();
        peer.set_nonblocking(true).unwrap();
        let mut chunk = [0u8; 4096];
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        assert_eq!(got.len(), BUFFER_SIZE - 16 + 64);
    }

    #[test]
    fn fd_transfer_roundtrip() {
        let (mut left, mut right) = connected_pair();

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&write_end, b"x").unwrap();

        left.push_outgoing_fd(read_end).unwrap();
        left.write(b"m").unwrap();
        left.flush().unwrap();

        right.read().unwrap();
        assert_eq!(right.incoming_fd_count(), 1);
        let received = right.pop_incoming_fd().unwrap();

        let mut buf = [0u8; 1];
        nix::unistd::read(received.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn unclaimed_fds_closed_on_teardown() {
        let (mut left, mut right) = connected_pair();

        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        left.push_outgoing_fd(read_end).unwrap();
        left.write(b"m").unwrap();
        left.flush().unwrap();

        right.read().unwrap();
        let raw = right
            .fds_in
            .iter()
            .next()
            .map(|f| f.as_raw_fd())
            .unwrap();

        let _socket = right.into_socket();
        // The unclaimed descriptor must be gone.
        assert!(nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn close_incoming_fds_discards_exactly_n() {
        let (mut left, mut right) = connected_pair();

        for _ in 0..3 {
            let (read_end, _w) = nix::unistd::pipe().unwrap();
            left.push_outgoing_fd(read_end).unwrap();
        }
        left.write(b"m").unwrap();
        left.flush().unwrap();

        right.read().unwrap();
        assert_eq!(right.incoming_fd_count(), 3);
        right.close_incoming_fds(2);
        assert_eq!(right.incoming_fd_count(), 1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_credentials_report_own_process() {
        let (conn, _peer) = pair();
        let (_uid, _gid, pid) = conn.peer_credentials().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
