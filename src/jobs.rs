//! The job table — sole authority for "what processes does this shell own"
//! (spec.md §4.2).

use crate::error::{EngineError, EngineResult};

/// Resource cap from spec.md §5: capacity of the job table.
pub const MAX_JOBS: usize = 64;
/// Resource cap from spec.md §5: members per job.
pub const MAX_PROCESS_PER_JOB: usize = 32;

/// One member of a job: either a real OS process, or the in-shell execution
/// of the pipeline's last stage under `lastpipe` (spec.md §9 "job table
/// polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSlot {
    ExternalPid(i32),
    InProcess,
}

/// Per-member completion outcome, filled in as each slot terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Running,
    Stopped,
    Exited(i32),
    Signaled(i32),
}

impl MemberStatus {
    /// `WIFEXITED(status) && WEXITSTATUS(status) == 0` equivalent exit code,
    /// or the raw signal-mapped code (128+n) for `WIFSIGNALED`.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            MemberStatus::Exited(code) => Some(code),
            MemberStatus::Signaled(sig) => Some(128 + sig),
            MemberStatus::Running | MemberStatus::Stopped => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MemberStatus::Exited(_) | MemberStatus::Signaled(_))
    }
}

/// Job flags (spec.md §3/§4.2): bitfield semantics modeled as plain bools
/// since the set is small and fixed; a real bitflags crate buys nothing
/// extra here that the teacher's style would reach for.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFlags {
    pub foreground: bool,
    /// User was already told about the last state change.
    pub notified: bool,
    /// Job was created while `-m` (job control) was on.
    pub job_controlled: bool,
    /// Spared from `SIGHUP` at shell exit.
    pub disowned: bool,
    /// Per-job immediate notification (the `notify` builtin).
    pub notify_immediately: bool,
}

/// Terminal attributes captured when a job is suspended while in the
/// foreground; restored when the job is resumed (spec.md §4.7). Opaque to
/// this module — owned exclusively by the job that was foreground at
/// suspension, never shared (spec.md §9).
#[derive(Debug, Clone)]
pub struct SavedTerminalAttrs(pub Vec<u8>);

/// One job: a single command line, which may be a pipeline of several
/// processes, a function, or a subshell (spec.md §3 "Job").
#[derive(Debug, Clone)]
pub struct Job {
    /// Immutable until the job is removed; reassigned afterwards (§3: "0
    /// marks a free slot").
    pub job_num: u32,
    pub command: String,
    /// The pgid: the pid of the first-forked stage (spec.md §9 open question
    /// (d): `$!` is always this leader pid).
    pub pgid: i32,
    pub members: Vec<ProcessSlot>,
    pub member_status: Vec<MemberStatus>,
    pub flags: JobFlags,
    pub last_reported_status: Option<i32>,
    pub saved_terminal_attrs: Option<SavedTerminalAttrs>,
}

impl Job {
    pub fn new(command: String, pgid: i32, flags: JobFlags) -> Self {
        Job {
            job_num: 0,
            command,
            pgid,
            members: Vec::new(),
            member_status: Vec::new(),
            flags,
            last_reported_status: None,
            saved_terminal_attrs: None,
        }
    }

    /// Register a member. Invariant: `pid_count <= MAX_PROCESS_PER_JOB`.
    pub fn add_member(&mut self, slot: ProcessSlot) -> EngineResult<()> {
        if self.members.len() >= MAX_PROCESS_PER_JOB {
            return Err(EngineError::ResourceCap { what: "MAX_PROCESS_PER_JOB" });
        }
        self.members.push(slot);
        self.member_status.push(MemberStatus::Running);
        Ok(())
    }

    /// Apply a raw wait outcome to the member with this pid. No-op if the
    /// pid is not one of this job's members.
    pub fn update_member(&mut self, pid: i32, status: MemberStatus) {
        for (slot, slot_status) in self.members.iter().zip(self.member_status.iter_mut()) {
            if *slot == ProcessSlot::ExternalPid(pid) {
                *slot_status = status;
                self.flags.notified = false;
                return;
            }
        }
    }

    /// Mark the in-process (lastpipe) member's outcome.
    pub fn update_inprocess(&mut self, status: MemberStatus) {
        for (slot, slot_status) in self.members.iter().zip(self.member_status.iter_mut()) {
            if *slot == ProcessSlot::InProcess {
                *slot_status = status;
                self.flags.notified = false;
                return;
            }
        }
    }

    /// Exit-bitmap popcount equals terminated-count (spec.md §3 invariant).
    pub fn terminated_count(&self) -> usize {
        self.member_status.iter().filter(|s| s.is_terminal()).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.member_status.is_empty() && self.terminated_count() == self.member_status.len()
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_complete()
            && self.member_status.iter().any(|s| *s == MemberStatus::Stopped)
            && self.member_status.iter().all(|s| s.is_terminal() || *s == MemberStatus::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.is_complete() && !self.is_stopped()
    }

    /// spec.md §4.2 `aggregate_status`: pipefail ⇒ leftmost non-zero member
    /// status; otherwise the status of the pipeline's last stage (the
    /// group leader for foreground jobs, first member otherwise — spec.md
    /// §9 open question (d) notes `$!`/leader bookkeeping is entangled with
    /// `lastpipe`, so this mirrors the leader-pid convention there too).
    pub fn aggregate_status(&self, pipefail: bool) -> i32 {
        if pipefail {
            for status in &self.member_status {
                if let Some(code) = status.exit_code() {
                    if code != 0 {
                        return code;
                    }
                }
            }
            return 0;
        }

        let last = self.member_status.last().and_then(|s| s.exit_code());
        last.unwrap_or(0)
    }
}

/// Bounded FIFO of `(pid, raw_status)` pairs the `SIGCHLD` handler deposits
/// for pids whose job association has not yet been reconciled (spec.md §3
/// "Dead-process ring"). Duplicate pid overwrites status in place.
#[derive(Debug, Default)]
pub struct DeadProcessRing {
    entries: Vec<(i32, MemberStatus)>,
    capacity: usize,
}

impl DeadProcessRing {
    pub fn new(capacity: usize) -> Self {
        DeadProcessRing { entries: Vec::with_capacity(capacity), capacity }
    }

    pub fn deposit(&mut self, pid: i32, status: MemberStatus) {
        if let Some(existing) = self.entries.iter_mut().find(|(p, _)| *p == pid) {
            existing.1 = status;
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push((pid, status));
    }

    pub fn take(&mut self, pid: i32) -> Option<MemberStatus> {
        if let Some(idx) = self.entries.iter().position(|(p, _)| *p == pid) {
            Some(self.entries.remove(idx).1)
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<(i32, MemberStatus)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed POSIX job identifier (spec.md §4.2 `resolve`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Current,
    Previous,
    Number(u32),
    Prefix(String),
    Contains(String),
}

pub fn parse_job_spec(spec: &str) -> Option<JobSpec> {
    let rest = spec.strip_prefix('%')?;
    match rest {
        "" | "%" => Some(JobSpec::Current),
        "+" => Some(JobSpec::Current),
        "-" => Some(JobSpec::Previous),
        _ => {
            if let Ok(n) = rest.parse::<u32>() {
                Some(JobSpec::Number(n))
            } else if let Some(substr) = rest.strip_prefix('?') {
                Some(JobSpec::Contains(substr.to_string()))
            } else {
                Some(JobSpec::Prefix(rest.to_string()))
            }
        }
    }
}

/// Bounded array of job slots (spec.md §3 "Job table"). `current`/`previous`
/// invariants: both reference live jobs or are zero; `current != previous`
/// unless only one job exists.
pub struct JobTable {
    slots: Vec<Option<Job>>,
    current: u32,
    previous: u32,
    dead_ring: DeadProcessRing,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        JobTable {
            slots: Vec::new(),
            current: 0,
            previous: 0,
            dead_ring: DeadProcessRing::new(32),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn previous(&self) -> u32 {
        self.previous
    }

    pub fn dead_ring_mut(&mut self) -> &mut DeadProcessRing {
        &mut self.dead_ring
    }

    fn max_job_num(&self) -> u32 {
        self.slots.iter().flatten().map(|j| j.job_num).max().unwrap_or(0)
    }

    /// `add(job)`: allocate the lowest free slot; `job_num` is one greater
    /// than the table's current maximum job number, not the slot's previous
    /// occupant (spec.md §4.2).
    pub fn add(&mut self, mut job: Job) -> EngineResult<u32> {
        let free_slot = self.slots.iter().position(Option::is_none);
        let slot_index = match free_slot {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= MAX_JOBS {
                    return Err(EngineError::ResourceCap { what: "MAX_JOBS" });
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        let job_num = self.max_job_num() + 1;
        job.job_num = job_num;
        self.slots[slot_index] = Some(job);
        self.set_current_job(job_num);
        Ok(job_num)
    }

    /// `remove(job)`: free the slot; if it was `current`, promote
    /// `previous`; recompute `previous` as the most-recent stopped, else
    /// most-recent running, job (spec.md §4.2).
    pub fn remove(&mut self, job_num: u32) -> Option<Job> {
        let slot_index = self.slots.iter().position(
            |s| matches!(s, Some(j) if j.job_num == job_num),
        )?;
        let removed = self.slots[slot_index].take();

        if job_num == self.current {
            self.current = self.previous;
            self.previous = 0;
            self.reset_previous();
        } else if job_num == self.previous {
            self.previous = 0;
            self.reset_previous();
        }

        removed
    }

    pub fn by_jobid(&self, n: u32) -> Option<&Job> {
        self.slots.iter().flatten().find(|j| j.job_num == n)
    }

    pub fn by_jobid_mut(&mut self, n: u32) -> Option<&mut Job> {
        self.slots.iter_mut().flatten().find(|j| j.job_num == n)
    }

    pub fn by_any_pid(&self, pid: i32) -> Option<&Job> {
        self.slots
            .iter()
            .flatten()
            .find(|j| j.pgid == pid || j.members.contains(&ProcessSlot::ExternalPid(pid)))
    }

    pub fn by_any_pid_mut(&mut self, pid: i32) -> Option<&mut Job> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|j| j.pgid == pid || j.members.contains(&ProcessSlot::ExternalPid(pid)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().flatten()
    }

    /// `resolve(spec)`: parse and look up a job spec. Ambiguous prefix
    /// matches fail with *ambiguous-jobspec* (spec.md §4.2).
    pub fn resolve(&self, spec: &str) -> EngineResult<Option<&Job>> {
        let parsed = match parse_job_spec(spec) {
            Some(p) => p,
            None => return Ok(None),
        };
        match parsed {
            JobSpec::Current => Ok(self.by_jobid(self.current)),
            JobSpec::Previous => Ok(self.by_jobid(self.previous)),
            JobSpec::Number(n) => Ok(self.by_jobid(n)),
            JobSpec::Prefix(prefix) => {
                let matches: Vec<&Job> =
                    self.iter().filter(|j| j.command.starts_with(&prefix)).collect();
                match matches.len() {
                    0 => Ok(None),
                    1 => Ok(Some(matches[0])),
                    _ => Err(EngineError::AmbiguousJobSpec { spec: spec.to_string() }),
                }
            }
            JobSpec::Contains(substr) => {
                let matches: Vec<&Job> =
                    self.iter().filter(|j| j.command.contains(&substr)).collect();
                match matches.len() {
                    0 => Ok(None),
                    1 => Ok(Some(matches[0])),
                    _ => Err(EngineError::AmbiguousJobSpec { spec: spec.to_string() }),
                }
            }
        }
    }

    /// `update_exit(job, pid, raw_status)`: apply the wait outcome to the
    /// member with this pid and return whether the job is now complete
    /// (spec.md §4.2).
    pub fn update_exit(&mut self, job_num: u32, pid: i32, status: MemberStatus) -> bool {
        let complete = if let Some(job) = self.by_jobid_mut(job_num) {
            job.update_member(pid, status);
            job.is_complete()
        } else {
            false
        };
        self.reassign_current_previous(job_num);
        complete
    }

    /// Current/previous reassignment, run on every status change and on
    /// removal (spec.md §4.2): bash's `set_cur_job` algorithm.
    ///
    /// (i) if the given job differs from `current`, demote current→previous,
    ///     new job becomes current;
    /// (ii) if `previous` is valid and stopped, keep it;
    /// (iii) else set `previous` to the most recent stopped job older than
    ///      `current`;
    /// (iv) else to the most recent running job.
    pub fn set_current_job(&mut self, job_num: u32) {
        if !self.slots.iter().flatten().any(|j| j.job_num == job_num) {
            return;
        }

        if job_num != self.current {
            self.previous = self.current;
            self.current = job_num;
        }
        self.reset_previous();
    }

    fn reassign_current_previous(&mut self, changed: u32) {
        self.set_current_job(changed);
    }

    fn reset_previous(&mut self) {
        if self.previous != 0 {
            if let Some(job) = self.by_jobid(self.previous) {
                if job.is_stopped() {
                    return; // (ii) keep a still-stopped previous
                }
            }
        }

        // (iii) most recent stopped job older than current
        if let Some(found) = self
            .iter()
            .filter(|j| j.job_num != self.current && j.is_stopped())
            .max_by_key(|j| j.job_num)
        {
            self.previous = found.job_num;
            return;
        }

        // (iv) most recent running job
        if let Some(found) = self
            .iter()
            .filter(|j| j.job_num != self.current && j.is_running())
            .max_by_key(|j| j.job_num)
        {
            self.previous = found.job_num;
            return;
        }

        self.previous = 0;
    }

    /// Format a job-state-change notification line (spec.md §4.2/§6: format
    /// `[N]±  status  command`).
    pub fn notification_line(&self, job: &Job, label: &str) -> String {
        let marker = if job.job_num == self.current {
            '+'
        } else if job.job_num == self.previous {
            '-'
        } else {
            ' '
        };
        format!("[{}]{}  {}  {}", job.job_num, marker, label, job.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job(command: &str) -> Job {
        let mut job = Job::new(command.to_string(), 100, JobFlags::default());
        job.add_member(ProcessSlot::ExternalPid(100)).unwrap();
        job
    }

    #[test]
    fn add_assigns_increasing_job_numbers() {
        let mut table = JobTable::new();
        let a = table.add(running_job("sleep 1")).unwrap();
        let b = table.add(running_job("sleep 2")).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.current(), 2);
    }

    #[test]
    fn job_number_not_reused_from_freed_slot() {
        let mut table = JobTable::new();
        let a = table.add(running_job("a")).unwrap();
        table.remove(a);
        let b = table.add(running_job("b")).unwrap();
        assert_eq!(b, 2, "job numbers must not be recycled from a freed slot");
    }

    #[test]
    fn current_previous_invariant_after_two_jobs() {
        let mut table = JobTable::new();
        table.add(running_job("a")).unwrap();
        table.add(running_job("b")).unwrap();
        assert_ne!(table.current(), table.previous());
        assert_eq!(table.current(), 2);
    }

    #[test]
    fn removing_current_promotes_previous() {
        let mut table = JobTable::new();
        let a = table.add(running_job("a")).unwrap();
        let b = table.add(running_job("b")).unwrap();
        table.remove(b);
        assert_eq!(table.current(), a);
    }

    #[test]
    fn resolve_ambiguous_prefix_errors() {
        let mut table = JobTable::new();
        table.add(running_job("make build")).unwrap();
        table.add(running_job("make test")).unwrap();
        let result = table.resolve("%make");
        assert!(matches!(result, Err(EngineError::AmbiguousJobSpec { .. })));
    }

    #[test]
    fn resolve_unique_prefix_matches() {
        let mut table = JobTable::new();
        table.add(running_job("build project")).unwrap();
        let result = table.resolve("%build").unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn aggregate_status_pipefail_leftmost_nonzero() {
        let mut job = Job::new("false | true | false".into(), 1, JobFlags::default());
        job.add_member(ProcessSlot::ExternalPid(1)).unwrap();
        job.add_member(ProcessSlot::ExternalPid(2)).unwrap();
        job.add_member(ProcessSlot::ExternalPid(3)).unwrap();
        job.update_member(1, MemberStatus::Exited(1));
        job.update_member(2, MemberStatus::Exited(0));
        job.update_member(3, MemberStatus::Exited(7));
        assert_eq!(job.aggregate_status(true), 1);
        assert_eq!(job.aggregate_status(false), 7);
    }

    #[test]
    fn aggregate_status_all_zero_is_zero() {
        let mut job = Job::new("true | true".into(), 1, JobFlags::default());
        job.add_member(ProcessSlot::ExternalPid(1)).unwrap();
        job.add_member(ProcessSlot::ExternalPid(2)).unwrap();
        job.update_member(1, MemberStatus::Exited(0));
        job.update_member(2, MemberStatus::Exited(0));
        assert_eq!(job.aggregate_status(true), 0);
        assert_eq!(job.aggregate_status(false), 0);
    }

    #[test]
    fn dead_ring_duplicate_pid_overwrites_in_place() {
        let mut ring = DeadProcessRing::new(4);
        ring.deposit(10, MemberStatus::Exited(0));
        ring.deposit(10, MemberStatus::Exited(3));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.take(10), Some(MemberStatus::Exited(3)));
    }

    #[test]
    fn dead_ring_bounded_capacity_drops_oldest() {
        let mut ring = DeadProcessRing::new(2);
        ring.deposit(1, MemberStatus::Exited(0));
        ring.deposit(2, MemberStatus::Exited(0));
        ring.deposit(3, MemberStatus::Exited(0));
        assert_eq!(ring.len(), 2);
        assert!(ring.take(1).is_none());
    }

    #[test]
    fn process_per_job_cap_is_enforced() {
        let mut job = Job::new("big pipeline".into(), 1, JobFlags::default());
        for i in 0..MAX_PROCESS_PER_JOB {
            job.add_member(ProcessSlot::ExternalPid(i as i32)).unwrap();
        }
        assert!(job.add_member(ProcessSlot::ExternalPid(9999)).is_err());
    }

    #[test]
    fn parse_job_spec_variants() {
        assert_eq!(parse_job_spec("%%"), Some(JobSpec::Current));
        assert_eq!(parse_job_spec("%+"), Some(JobSpec::Current));
        assert_eq!(parse_job_spec("%-"), Some(JobSpec::Previous));
        assert_eq!(parse_job_spec("%3"), Some(JobSpec::Number(3)));
        assert_eq!(parse_job_spec("%?foo"), Some(JobSpec::Contains("foo".into())));
        assert_eq!(parse_job_spec("%make"), Some(JobSpec::Prefix("make".into())));
        assert_eq!(parse_job_spec("notaspec"), None);
    }
}
