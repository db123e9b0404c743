//! Descriptor hygiene for the container init.
//!
//! The console tty becomes stdin/stdout/stderr and the controlling terminal.
//! Descriptors the caller wants passed through are renumbered into a
//! contiguous block right after stderr, and everything above that block is
//! closed.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nestbox_common::error::{NestboxError, Result};
use nix::errno::Errno;
use nix::sys::resource::{Resource, getrlimit};

/// First descriptor number handed out to pass-through descriptors.
pub const FIRST_PASS_FD: RawFd = libc::STDERR_FILENO + 1;

/// Descriptor table operations used while renumbering.
pub trait FdTable {
    /// `dup(2)`: returns the lowest free descriptor number.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn dup(&mut self, fd: RawFd) -> nix::Result<RawFd>;

    /// `dup2(2)`: makes `target` refer to the same file as `fd`.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn dup2(&mut self, fd: RawFd, target: RawFd) -> nix::Result<()>;

    /// `close(2)`.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn close(&mut self, fd: RawFd) -> nix::Result<()>;

    /// Exclusive upper bound of descriptor numbers.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn open_limit(&self) -> nix::Result<RawFd>;
}

/// [`FdTable`] acting on the calling process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessFds;

impl FdTable for ProcessFds {
    fn dup(&mut self, fd: RawFd) -> nix::Result<RawFd> {
        // SAFETY: dup only reads the descriptor number; an invalid one is
        // reported as EBADF.
        Errno::result(unsafe { libc::dup(fd) })
    }

    fn dup2(&mut self, fd: RawFd, target: RawFd) -> nix::Result<()> {
        // SAFETY: the caller owns both descriptor numbers for the rest of
        // the process lifetime; `target` is replaced on purpose.
        Errno::result(unsafe { libc::dup2(fd, target) }).map(drop)
    }

    fn close(&mut self, fd: RawFd) -> nix::Result<()> {
        // SAFETY: descriptors closed here are never used again by this
        // process.
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn open_limit(&self) -> nix::Result<RawFd> {
        let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
        Ok(RawFd::try_from(soft).unwrap_or(RawFd::MAX))
    }
}

/// Makes `tty` the controlling terminal and stdio, then lines up the
/// pass-through descriptors and closes the rest.
///
/// # Errors
///
/// Returns a syscall error if the session, terminal, or any descriptor
/// operation fails.
pub fn finalize_descriptors(
    fds: &mut dyn FdTable,
    tty: OwnedFd,
    pass_fds: Vec<RawFd>,
) -> Result<()> {
    nix::unistd::setsid().map_err(|e| NestboxError::syscall("setsid failed", e))?;

    // SAFETY: TIOCSCTTY takes an integer argument and only affects the
    // session of the calling process; `tty` is a valid open descriptor.
    Errno::result(unsafe { libc::ioctl(tty.as_raw_fd(), libc::TIOCSCTTY, 0) })
        .map_err(|e| NestboxError::syscall("ioctl(TIOCSCTTY) failed", e))?;

    for (target, name) in [
        (libc::STDIN_FILENO, "stdin"),
        (libc::STDOUT_FILENO, "stdout"),
        (libc::STDERR_FILENO, "stderr"),
    ] {
        fds.dup2(tty.as_raw_fd(), target)
            .map_err(|e| NestboxError::syscall(format!("dup2({name}) failed"), e))?;
    }

    if tty.as_raw_fd() < FIRST_PASS_FD {
        // already one of the stdio slots
        let _ = tty.into_raw_fd();
    } else {
        drop(tty);
    }

    let last = renumber_pass_fds(fds, pass_fds)?;
    close_above(fds, last)
}

/// Moves `pass_fds[i]` to `FIRST_PASS_FD + i` for every `i`.
///
/// A later entry that already sits on a wanted slot is first duplicated out
/// of the way, so no caller descriptor is ever overwritten. Returns the last
/// descriptor of the block (stderr when there is nothing to pass).
///
/// # Errors
///
/// Returns a syscall error if a `dup` or `dup2` fails.
pub fn renumber_pass_fds(fds: &mut dyn FdTable, mut pass_fds: Vec<RawFd>) -> Result<RawFd> {
    let mut want = FIRST_PASS_FD;
    for i in 0..pass_fds.len() {
        tracing::debug!(from = pass_fds[i], onto = want, "pass fd");
        if pass_fds[i] == want {
            want += 1;
            continue;
        }

        for j in i + 1..pass_fds.len() {
            if pass_fds[j] == want {
                // The old number stays open until dup2 below replaces it, so
                // the relocated copy cannot be handed this slot again.
                let moved = fds.dup(pass_fds[j]).map_err(|e| {
                    NestboxError::syscall(
                        format!("cannot move fd {} out of the way", pass_fds[j]),
                        e,
                    )
                })?;
                tracing::debug!(clash = j, moved, "moved clashing fd");
                pass_fds[j] = moved;
            }
        }

        fds.dup2(pass_fds[i], want).map_err(|e| {
            NestboxError::syscall(
                format!("cannot duplicate fd {} onto fd {want}", pass_fds[i]),
                e,
            )
        })?;
        let _ = fds.close(pass_fds[i]);
        pass_fds[i] = want;
        want += 1;
    }
    Ok(want - 1)
}

/// Closes every descriptor above `last` up to the open-file limit, in case
/// something was left without close-on-exec.
///
/// # Errors
///
/// Returns a syscall error if the limit cannot be determined.
pub fn close_above(fds: &mut dyn FdTable, last: RawFd) -> Result<()> {
    let limit = fds
        .open_limit()
        .map_err(|e| NestboxError::syscall("getrlimit(RLIMIT_NOFILE) failed", e))?;
    for fd in last + 1..limit {
        let _ = fds.close(fd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Descriptor table where every entry remembers which original file it
    /// refers to.
    struct SimulatedFds {
        open: BTreeMap<RawFd, u32>,
        limit: RawFd,
    }

    impl SimulatedFds {
        fn new(pass: &[RawFd], leaked: &[RawFd]) -> Self {
            let mut open = BTreeMap::new();
            for fd in 0..FIRST_PASS_FD {
                let _ = open.insert(fd, 1000 + fd as u32);
            }
            for (i, fd) in pass.iter().enumerate() {
                let _ = open.insert(*fd, i as u32);
            }
            for fd in leaked {
                let _ = open.insert(*fd, 500);
            }
            Self { open, limit: 32 }
        }
    }

    impl FdTable for SimulatedFds {
        fn dup(&mut self, fd: RawFd) -> nix::Result<RawFd> {
            let file = *self.open.get(&fd).ok_or(Errno::EBADF)?;
            let free = (0..self.limit)
                .find(|n| !self.open.contains_key(n))
                .ok_or(Errno::EMFILE)?;
            let _ = self.open.insert(free, file);
            Ok(free)
        }

        fn dup2(&mut self, fd: RawFd, target: RawFd) -> nix::Result<()> {
            let file = *self.open.get(&fd).ok_or(Errno::EBADF)?;
            let _ = self.open.insert(target, file);
            Ok(())
        }

        fn close(&mut self, fd: RawFd) -> nix::Result<()> {
            self.open.remove(&fd).map(drop).ok_or(Errno::EBADF)
        }

        fn open_limit(&self) -> nix::Result<RawFd> {
            Ok(self.limit)
        }
    }

    /// Every ordered selection of `n` distinct numbers from `pool`.
    fn arrangements(pool: &[RawFd], n: usize) -> Vec<Vec<RawFd>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for (i, first) in pool.iter().enumerate() {
            let rest: Vec<RawFd> = pool
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, fd)| *fd)
                .collect();
            for mut tail in arrangements(&rest, n - 1) {
                tail.insert(0, *first);
                out.push(tail);
            }
        }
        out
    }

    fn check(pass: &[RawFd], leaked: &[RawFd]) {
        let mut fds = SimulatedFds::new(pass, leaked);
        let last = renumber_pass_fds(&mut fds, pass.to_vec()).unwrap();
        close_above(&mut fds, last).unwrap();

        let expected: Vec<RawFd> = (0..FIRST_PASS_FD + pass.len() as RawFd).collect();
        let actual: Vec<RawFd> = fds.open.keys().copied().collect();
        assert_eq!(actual, expected, "pass fds {pass:?}");
        for i in 0..pass.len() {
            assert_eq!(
                fds.open[&(FIRST_PASS_FD + i as RawFd)],
                i as u32,
                "pass fds {pass:?}"
            );
        }
    }

    #[test]
    fn empty_set_closes_everything_after_stderr() {
        check(&[], &[3, 9, 20]);
    }

    #[test]
    fn any_arrangement_ends_contiguous_after_stderr() {
        let pool: Vec<RawFd> = (3..=9).collect();
        for n in 0..=4 {
            for pass in arrangements(&pool, n) {
                let leaked: Vec<RawFd> = (12..15).filter(|fd| !pass.contains(fd)).collect();
                check(&pass, &leaked);
            }
        }
    }

    #[test]
    fn swapped_pair_is_untangled() {
        check(&[4, 3], &[]);
        check(&[5, 4, 3], &[]);
    }

    #[test]
    fn already_in_place_needs_no_calls() {
        let mut fds = SimulatedFds::new(&[3, 4], &[]);
        let last = renumber_pass_fds(&mut fds, vec![3, 4]).unwrap();
        assert_eq!(last, 4);
    }

    #[test]
    fn dup2_failure_is_reported() {
        let mut fds = SimulatedFds::new(&[], &[]);
        let err = renumber_pass_fds(&mut fds, vec![7]).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EBADF));
    }
}
