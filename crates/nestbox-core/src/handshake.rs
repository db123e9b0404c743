//! Single-byte synchronisation between supervisor and container.
//!
//! The protocol has no framing beyond the one byte: a short read, a short
//! write or any other byte value means the peer died or the channel is
//! corrupt. None of these are retried.

use std::os::fd::{AsRawFd, BorrowedFd};

use nestbox_common::error::{NestboxError, Result};
use nix::errno::Errno;

/// The only message ever exchanged.
pub const CONTINUE_MESSAGE: u8 = b'c';

/// Sends the continue token on `fd`.
///
/// # Errors
///
/// Returns a protocol error if the byte cannot be written.
pub fn send_continue(fd: BorrowedFd<'_>) -> Result<()> {
    tracing::debug!(fd = fd.as_raw_fd(), "send continue");
    let msg = [CONTINUE_MESSAGE];
    match retry_eintr(|| nix::unistd::write(fd, &msg)) {
        Ok(1) => Ok(()),
        Ok(n) => Err(NestboxError::Protocol {
            message: format!("short write of continue message ({n} bytes)"),
        }),
        Err(e) => Err(NestboxError::Protocol {
            message: format!("failed to send continue message: {e}"),
        }),
    }
}

/// Blocks until the continue token arrives on `fd`.
///
/// There is no timeout. A closed peer ends the wait with an error.
///
/// # Errors
///
/// Returns a protocol error on end-of-file, read failure, or any other byte.
pub fn wait_for_continue(fd: BorrowedFd<'_>) -> Result<()> {
    tracing::debug!(fd = fd.as_raw_fd(), "wait continue");
    let mut msg = [0u8; 1];
    let n = retry_eintr(|| nix::unistd::read(fd, &mut msg)).map_err(|e| NestboxError::Protocol {
        message: format!("failed to read continue message: {e}"),
    })?;

    if n != 1 {
        return Err(NestboxError::Protocol {
            message: "peer closed the channel before continue message".into(),
        });
    }
    if msg[0] != CONTINUE_MESSAGE {
        return Err(NestboxError::Protocol {
            message: format!("unexpected message {:#04x}", msg[0]),
        });
    }
    tracing::debug!(fd = fd.as_raw_fd(), "got continue");
    Ok(())
}

fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn continue_round_trip() {
        let (parent, child) = UnixStream::pair().unwrap();
        send_continue(parent.as_fd()).unwrap();
        wait_for_continue(child.as_fd()).unwrap();

        send_continue(child.as_fd()).unwrap();
        wait_for_continue(parent.as_fd()).unwrap();
    }

    #[test]
    fn closed_peer_fails_instead_of_hanging() {
        let (parent, child) = UnixStream::pair().unwrap();
        drop(parent);
        let err = wait_for_continue(child.as_fd()).unwrap_err();
        assert!(matches!(err, NestboxError::Protocol { .. }));
    }

    #[test]
    fn wrong_byte_is_a_protocol_error() {
        let (mut parent, child) = UnixStream::pair().unwrap();
        parent.write_all(b"x").unwrap();
        let err = wait_for_continue(child.as_fd()).unwrap_err();
        assert!(err.to_string().contains("0x78"));
    }

    #[test]
    fn sending_to_closed_peer_fails() {
        let (parent, child) = UnixStream::pair().unwrap();
        drop(child);
        // SIGPIPE is ignored by the test harness, so this surfaces as EPIPE.
        let err = send_continue(parent.as_fd()).unwrap_err();
        assert!(matches!(err, NestboxError::Protocol { .. }));
    }
}
