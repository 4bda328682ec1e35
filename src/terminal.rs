//! Terminal Arbiter (spec.md §4.7): at most one process group (shell or one
//! job) owns the controlling terminal at any time.
//!
//! All operations are no-ops when the process is not the session leader or
//! stdin is not a tty, and gated on job-control mode (`-m`) by the caller —
//! this module itself only implements the mechanics.

#[cfg(unix)]
use std::io;

use crate::jobs::SavedTerminalAttrs;

#[cfg(unix)]
pub(crate) enum WaitOutcome {
    Exited(i32),
    Stopped,
}

#[cfg(unix)]
pub(crate) fn set_process_group(pid: libc::pid_t, pgid: libc::pid_t) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::setpgid(pid, pgid) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            // Already exec'd or gone; the loser of the belt-and-braces race
            // (spec.md §4.4 step 6) gets here and it's fine.
            Some(code) if code == libc::EACCES || code == libc::ESRCH => return Ok(()),
            _ => return Err(err),
        }
    }
}

#[cfg(unix)]
pub(crate) fn process_group_id(pid: libc::pid_t) -> io::Result<libc::pid_t> {
    loop {
        let rc = unsafe { libc::getpgid(pid) };
        if rc >= 0 {
            return Ok(rc);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

#[cfg(unix)]
pub(crate) fn send_continue_to_group(pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group id"));
    }

    loop {
        let rc = unsafe { libc::kill(-pgid, libc::SIGCONT) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Sole owner of terminal ownership transfers for the shell process
/// (spec.md §4.7).
pub struct TerminalArbiter {
    job_control: bool,
}

impl TerminalArbiter {
    pub fn new(job_control: bool) -> Self {
        TerminalArbiter { job_control }
    }

    /// Starting a foreground job: block `TTIN`/`TTOU`/`TSTP`/`CHLD`,
    /// `tcsetpgrp(tty, job.pgid)`, unblock.
    #[cfg(unix)]
    pub fn begin_foreground(&self, pgid: i32) -> io::Result<Option<ForegroundTerminalGuard>> {
        if !self.job_control {
            return Ok(None);
        }
        ForegroundTerminalGuard::new(pgid as libc::pid_t).map(Some)
    }

    #[cfg(not(unix))]
    pub fn begin_foreground(&self, _pgid: i32) -> std::io::Result<Option<ForegroundTerminalGuard>> {
        Ok(None)
    }

    /// Resuming a stopped job (`fg`): restore the job's saved terminal
    /// attributes (if any) before transferring ownership, and save the
    /// shell's own attributes so they can be restored later.
    #[cfg(unix)]
    pub fn resume_job(
        &self,
        pgid: i32,
        saved: Option<&SavedTerminalAttrs>,
    ) -> io::Result<Option<ForegroundTerminalGuard>> {
        if !self.job_control {
            return Ok(None);
        }
        if let Some(attrs) = saved {
            restore_termios(libc::STDIN_FILENO, attrs)?;
        }
        send_continue_to_group(pgid)?;
        self.begin_foreground(pgid)
    }

    #[cfg(not(unix))]
    pub fn resume_job(
        &self,
        _pgid: i32,
        _saved: Option<&SavedTerminalAttrs>,
    ) -> std::io::Result<Option<ForegroundTerminalGuard>> {
        Ok(None)
    }

    /// Suspending the foreground job: capture terminal attributes into the
    /// job's saved record (owned exclusively by that job; dropped on
    /// removal, transferred on resume — spec.md §9).
    #[cfg(unix)]
    pub fn capture_attrs(&self) -> io::Result<SavedTerminalAttrs> {
        capture_termios(libc::STDIN_FILENO)
    }

    #[cfg(not(unix))]
    pub fn capture_attrs(&self) -> std::io::Result<SavedTerminalAttrs> {
        Ok(SavedTerminalAttrs(Vec::new()))
    }
}

#[cfg(unix)]
pub(crate) struct ForegroundTerminalGuard {
    tty_fd: Option<libc::c_int>,
    shell_pgid: libc::pid_t,
}

#[cfg(unix)]
impl ForegroundTerminalGuard {
    pub(crate) fn new(target_pgid: libc::pid_t) -> io::Result<Self> {
        let tty_fd = if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
            Some(libc::STDIN_FILENO)
        } else {
            None
        };

        let shell_pgid = unsafe { libc::getpgrp() };
        let guard = Self { tty_fd, shell_pgid };

        if let Some(fd) = guard.tty_fd {
            set_terminal_foreground(fd, target_pgid)?;
        }

        Ok(guard)
    }
}

#[cfg(unix)]
impl Drop for ForegroundTerminalGuard {
    fn drop(&mut self) {
        // Job completes or stops: tcsetpgrp(tty, shell.pgid) (spec.md §4.7).
        if let Some(fd) = self.tty_fd {
            let _ = set_terminal_foreground(fd, self.shell_pgid);
        }
    }
}

#[cfg(unix)]
pub(crate) fn wait_for_pid(pid: libc::pid_t) -> io::Result<WaitOutcome> {
    let mut raw_status: libc::c_int = 0;

    loop {
        let rc = unsafe { libc::waitpid(pid, &mut raw_status, libc::WUNTRACED) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }

        if unsafe { libc::WIFSTOPPED(raw_status) } {
            return Ok(WaitOutcome::Stopped);
        }

        if let Some(code) = crate::status::exit_code_from_wait_status(raw_status) {
            return Ok(WaitOutcome::Exited(code));
        }
    }
}

#[cfg(unix)]
struct SignalIgnoreGuard {
    signal: libc::c_int,
    previous: libc::sighandler_t,
}

#[cfg(unix)]
impl SignalIgnoreGuard {
    fn ignore(signal: libc::c_int) -> io::Result<Self> {
        let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { signal, previous })
    }
}

#[cfg(unix)]
impl Drop for SignalIgnoreGuard {
    fn drop(&mut self) {
        unsafe {
            libc::signal(self.signal, self.previous);
        }
    }
}

#[cfg(unix)]
fn set_terminal_foreground(fd: libc::c_int, pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group id"));
    }

    let _sigttou = SignalIgnoreGuard::ignore(libc::SIGTTOU)?;
    loop {
        let rc = unsafe { libc::tcsetpgrp(fd, pgid) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

#[cfg(unix)]
fn capture_termios(fd: libc::c_int) -> io::Result<SavedTerminalAttrs> {
    unsafe {
        let mut term: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut term) != 0 {
            return Err(io::Error::last_os_error());
        }
        let bytes = std::slice::from_raw_parts(
            &term as *const libc::termios as *const u8,
            std::mem::size_of::<libc::termios>(),
        );
        Ok(SavedTerminalAttrs(bytes.to_vec()))
    }
}

#[cfg(unix)]
fn restore_termios(fd: libc::c_int, saved: &SavedTerminalAttrs) -> io::Result<()> {
    if saved.0.len() != std::mem::size_of::<libc::termios>() {
        return Ok(()); // defensively ignore a malformed snapshot
    }
    unsafe {
        let mut term: libc::termios = std::mem::zeroed();
        std::ptr::copy_nonoverlapping(
            saved.0.as_ptr(),
            &mut term as *mut libc::termios as *mut u8,
            saved.0.len(),
        );
        if libc::tcsetattr(fd, libc::TCSADRAIN, &term) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn non_job_control_arbiter_is_a_no_op() {
        let arbiter = TerminalArbiter::new(false);
        assert!(arbiter.begin_foreground(1234).unwrap().is_none());
    }
}
