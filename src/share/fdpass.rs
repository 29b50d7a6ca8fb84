//! Descriptor passing over the share socket.
//!
//! The client hands memory to the daemon by sending an open descriptor
//! as `SCM_RIGHTS` ancillary data alongside the fixed-layout protocol
//! message. At most one descriptor travels per message.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use tracing::warn;

/// Send a protocol message, optionally attaching one descriptor.
pub fn send_message<S: AsFd>(socket: &S, data: &[u8], fd: Option<BorrowedFd<'_>>) -> Result<()> {
    if data.is_empty() {
        return Err(Error::Protocol("empty share message".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);

    let fds: [BorrowedFd<'_>; 1];
    if let Some(fd) = fd {
        fds = [fd];
        if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
            return Err(Error::Protocol(
                "failed to add descriptor to ancillary buffer".into(),
            ));
        }
    }

    let iov = [IoSlice::new(data)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive one protocol message and the descriptor attached to it.
///
/// Returns the payload length and the first attached descriptor.
/// Additional descriptors are outside the protocol; they are closed
/// here so a misbehaving client cannot make the daemon leak them.
pub fn recv_message<S: AsFd>(socket: &S, data_buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>)> {
    if data_buf.is_empty() {
        return Err(Error::Protocol("receive buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(data_buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    let mut first: Option<OwnedFd> = None;
    let mut extra = 0usize;
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            for fd in rights {
                if first.is_none() {
                    first = Some(fd);
                } else {
                    extra += 1;
                    // fd dropped, closing it
                }
            }
        }
    }
    if extra > 0 {
        warn!(extra, "share message carried surplus descriptors, closed");
    }

    Ok((result.bytes, first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{MemfdFlags, memfd_create};
    use std::os::unix::net::UnixDatagram;

    fn memfd(len: u64) -> OwnedFd {
        let fd = memfd_create("aperture-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len).unwrap();
        fd
    }

    #[test]
    fn test_round_trip_with_fd() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let fd = memfd(4096);

        send_message(&a, b"hello", Some(fd.as_fd())).unwrap();

        let mut buf = [0u8; 16];
        let (n, received) = recv_message(&b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let received = received.expect("descriptor should arrive");

        // The received descriptor references the same file.
        let stat = rustix::fs::fstat(&received).unwrap();
        assert_eq!(stat.st_size, 4096);
    }

    #[test]
    fn test_round_trip_without_fd() {
        let (a, b) = UnixDatagram::pair().unwrap();
        send_message(&a, &[0xff, 0, 0, 0, 0, 0, 0, 0], None).unwrap();

        let mut buf = [0u8; 16];
        let (n, received) = recv_message(&b, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert!(received.is_none());
    }

    #[test]
    fn test_empty_message_rejected() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        assert!(send_message(&a, &[], None).is_err());
    }
}
