//! Aggregate shell state (spec.md §9 "re-architect as a single shell
//! context"): the job table, signal router, trap table and shell options
//! used to live as scattered globals in the original; bundling them here
//! lets `reconcile_signals` take one `&mut` instead of juggling several.

use crate::driver::{CallFrame, DriverOptions, FunctionTable};
use crate::jobs::{JobTable, MemberStatus};
use crate::signal::{Interactivity, SignalRouter};
use crate::terminal::TerminalArbiter;
use crate::traps::{TrapEvent, TrapTable};

pub struct ShellContext {
    pub job_table: JobTable,
    pub signals: SignalRouter,
    pub traps: TrapTable,
    pub arbiter: TerminalArbiter,
    pub options: DriverOptions,
    /// Defined-function bodies and the live call-frame stack (spec.md §3),
    /// threaded through every `Driver` this context hands out.
    pub functions: FunctionTable,
    pub call_stack: Vec<CallFrame>,
}

impl ShellContext {
    pub fn new(interactive: bool, job_control: bool) -> Self {
        let interactivity = if interactive { Interactivity::Interactive } else { Interactivity::NonInteractive };
        ShellContext {
            job_table: JobTable::new(),
            signals: SignalRouter::new(interactivity, job_control),
            traps: TrapTable::new(),
            arbiter: TerminalArbiter::new(job_control),
            options: DriverOptions {
                errexit: false,
                pipefail: false,
                job_control,
                lastpipe: false,
                restricted: false,
            },
            functions: FunctionTable::new(),
            call_stack: Vec::new(),
        }
    }

    pub fn install_signal_handlers(&self) {
        self.signals.install();
    }

    /// Synchronous reconciliation point (spec.md §4.1/§4.8): drain every
    /// pid the `SIGCHLD` handler reaped since the last call, match each to
    /// a job member or the dead-process ring, and queue any pending real
    /// signals for `do_pending_traps`. Called between commands and
    /// immediately after a foreground `wait` returns.
    /// Returns whether a background job's final member completed this
    /// round — the caller fires `CHLD` off that (spec.md §4.8 "fires on a
    /// background job's final-member termination"), since running trap
    /// shell-code needs a `Driver`, which this aggregate doesn't own.
    pub fn reconcile_signals(&mut self) -> bool {
        let mut chld_ready = false;
        for reaped in self.signals.drain_reaped() {
            let status = member_status_from_raw(reaped.raw_status);
            tracing::event!(tracing::Level::TRACE, pid = reaped.pid, ?status, "reconciled reaped pid");
            if let Some(job) = self.job_table.by_any_pid(reaped.pid) {
                let job_num = job.job_num;
                if self.job_table.update_exit(job_num, reaped.pid, status) {
                    chld_ready = true;
                }
            } else {
                self.job_table.dead_ring_mut().deposit(reaped.pid, status);
            }
        }

        let signal = self.signals.take_signal_received();
        if signal != 0 {
            self.traps.queue_signal(signal);
        }
        chld_ready
    }

    /// spec.md §5 "Foreground wait uses signal-blocking suspension": block
    /// until a signal arrives, reconcile, and report whether it was `SIGINT`
    /// (caller returns status 128 per §7 *signal-interruption*).
    pub fn wait_for_signal(&mut self, target_pid: i32) -> bool {
        let interrupted = self.signals.suspend_until_signal(target_pid);
        self.reconcile_signals();
        interrupted
    }

    /// Pending real-signal traps ready to run, in ascending signal order
    /// (spec.md §4.8). Pseudo-event traps (`EXIT`/`ERR`/`DEBUG`/`RETURN`/
    /// `CHLD`) are fired directly by the driver and the dispatcher at their
    /// respective execution points rather than drained here.
    pub fn pending_traps(&mut self) -> Vec<(TrapEvent, String)> {
        self.traps.take_pending()
    }
}

#[cfg(unix)]
fn member_status_from_raw(raw_status: i32) -> MemberStatus {
    let raw = raw_status as libc::c_int;
    if unsafe { libc::WIFEXITED(raw) } {
        MemberStatus::Exited(unsafe { libc::WEXITSTATUS(raw) })
    } else if unsafe { libc::WIFSIGNALED(raw) } {
        MemberStatus::Signaled(unsafe { libc::WTERMSIG(raw) })
    } else {
        MemberStatus::Stopped
    }
}

#[cfg(not(unix))]
fn member_status_from_raw(_raw_status: i32) -> MemberStatus {
    MemberStatus::Exited(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_has_no_jobs() {
        let ctx = ShellContext::new(true, true);
        assert_eq!(ctx.job_table.iter().count(), 0);
    }
}
