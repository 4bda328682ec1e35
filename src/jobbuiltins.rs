//! Demo-only job-control builtins: `jobs`, `fg`, `bg`, `wait`, `kill`,
//! `disown` (spec.md §4.2/§4.7). These need the job table and terminal
//! arbiter the way `refbuiltins.rs`'s builtins need only stdio, so they're
//! kept in their own module rather than widening that one's signature.

use std::io::Write;

use crate::jobs::{JobTable, MemberStatus, ProcessSlot};
use crate::terminal::TerminalArbiter;

const NAMES: &[&str] = &["jobs", "fg", "bg", "wait", "kill", "disown"];

pub fn is_job_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

pub fn execute(
    program: &str,
    args: &[String],
    job_table: &mut JobTable,
    arbiter: &TerminalArbiter,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> i32 {
    match program {
        "jobs" => jobs(args, job_table, stdout),
        "fg" => fg(args, job_table, arbiter, stderr),
        "bg" => bg(args, job_table, stderr),
        "wait" => wait(args, job_table, stderr),
        "kill" => kill(args, job_table, stderr),
        "disown" => disown(args, job_table, stderr),
        _ => {
            let _ = writeln!(stderr, "jsh: unknown job builtin: {program}");
            1
        }
    }
}

/// Resolve a bare job-spec argument: `%N`/`%%`/`%+`/`%-`/`%str`/`%?str` are
/// passed straight to `JobTable::resolve`; a bare number is treated as a job
/// number for convenience (bash accepts both `fg 1` and `fg %1`); no operand
/// means the current job.
fn resolve_job_num(arg: Option<&str>, job_table: &JobTable) -> Option<u32> {
    match arg {
        None => {
            let cur = job_table.current();
            if cur == 0 { None } else { Some(cur) }
        }
        Some(raw) => {
            let spec = if raw.starts_with('%') { raw.to_string() } else { format!("%{raw}") };
            job_table.resolve(&spec).ok().flatten().map(|j| j.job_num)
        }
    }
}

fn jobs(args: &[String], job_table: &JobTable, stdout: &mut dyn Write) -> i32 {
    let long = args.iter().any(|a| a == "-l");
    for job in job_table.iter() {
        let label = if job.is_stopped() { "Stopped" } else if job.is_complete() { "Done" } else { "Running" };
        let line = job_table.notification_line(job, label);
        if long {
            let _ = writeln!(stdout, "{line} (pgid {})", job.pgid);
        } else {
            let _ = writeln!(stdout, "{line}");
        }
    }
    0
}

#[cfg(unix)]
fn fg(args: &[String], job_table: &mut JobTable, arbiter: &TerminalArbiter, stderr: &mut dyn Write) -> i32 {
    let Some(job_num) = resolve_job_num(args.first().map(String::as_str), job_table) else {
        let _ = writeln!(stderr, "jsh: fg: no such job");
        return 1;
    };

    let Some(job) = job_table.by_jobid(job_num) else {
        let _ = writeln!(stderr, "jsh: fg: {job_num}: no such job");
        return 1;
    };

    if job.is_complete() {
        let status = job.aggregate_status(false);
        job_table.remove(job_num);
        return status;
    }

    let pgid = job.pgid;
    let saved = job.saved_terminal_attrs.clone();
    println!("{}", job.command);

    if job.is_stopped() {
        let _ = arbiter.resume_job(pgid, saved.as_ref());
    }
    let guard = arbiter.begin_foreground(pgid).ok().flatten();

    let member_pids: Vec<i32> = job_table
        .by_jobid(job_num)
        .map(|j| j.members.iter().filter_map(|m| match m {
            ProcessSlot::ExternalPid(pid) => Some(*pid),
            ProcessSlot::InProcess => None,
        }).collect())
        .unwrap_or_default();

    let mut stopped_again = false;
    for pid in member_pids {
        match crate::terminal::wait_for_pid(pid as libc::pid_t) {
            Ok(crate::terminal::WaitOutcome::Stopped) => {
                stopped_again = true;
                if let Some(job) = job_table.by_jobid_mut(job_num) {
                    job.update_member(pid, MemberStatus::Stopped);
                }
            }
            Ok(crate::terminal::WaitOutcome::Exited(code)) => {
                let status = if code > 128 { MemberStatus::Signaled(code - 128) } else { MemberStatus::Exited(code) };
                if let Some(job) = job_table.by_jobid_mut(job_num) {
                    job.update_member(pid, status);
                }
            }
            Err(e) => {
                let _ = writeln!(stderr, "jsh: fg: {e}");
            }
        }
    }

    drop(guard);

    if stopped_again {
        if let Some(job) = job_table.by_jobid_mut(job_num) {
            job.saved_terminal_attrs = arbiter.capture_attrs().ok();
        }
        return 0;
    }

    let status = job_table.by_jobid(job_num).map(|j| j.aggregate_status(false)).unwrap_or(0);
    job_table.remove(job_num);
    status
}

#[cfg(not(unix))]
fn fg(_args: &[String], _job_table: &mut JobTable, _arbiter: &TerminalArbiter, stderr: &mut dyn Write) -> i32 {
    let _ = writeln!(stderr, "jsh: fg: job control requires a unix platform");
    1
}

#[cfg(unix)]
fn bg(args: &[String], job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    let Some(job_num) = resolve_job_num(args.first().map(String::as_str), job_table) else {
        let _ = writeln!(stderr, "jsh: bg: no such job");
        return 1;
    };
    let Some(job) = job_table.by_jobid_mut(job_num) else {
        let _ = writeln!(stderr, "jsh: bg: {job_num}: no such job");
        return 1;
    };

    if !job.is_stopped() {
        let _ = writeln!(stderr, "jsh: bg: job {job_num} already in background");
        return 1;
    }
    let pgid = job.pgid;
    for status in job.member_status.iter_mut() {
        if *status == MemberStatus::Stopped {
            *status = MemberStatus::Running;
        }
    }
    match crate::terminal::send_continue_to_group(pgid as libc::pid_t) {
        Ok(()) => {
            if let Some(job) = job_table.by_jobid(job_num) {
                println!("{}", job_table.notification_line(job, "Running"));
            }
            0
        }
        Err(e) => {
            let _ = writeln!(stderr, "jsh: bg: {e}");
            1
        }
    }
}

#[cfg(not(unix))]
fn bg(_args: &[String], _job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    let _ = writeln!(stderr, "jsh: bg: job control requires a unix platform");
    1
}

#[cfg(unix)]
fn reap_job(job_table: &mut JobTable, job_num: u32) -> i32 {
    let pids: Vec<i32> = job_table
        .by_jobid(job_num)
        .map(|j| j.members.iter().filter_map(|m| match m {
            ProcessSlot::ExternalPid(pid) => Some(*pid),
            ProcessSlot::InProcess => None,
        }).collect())
        .unwrap_or_default();

    for pid in pids {
        let mut raw_status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut raw_status, 0) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
            break;
        }
        if let Some(code) = crate::status::exit_code_from_wait_status(raw_status) {
            let status = if unsafe { libc::WIFSIGNALED(raw_status) } {
                MemberStatus::Signaled(code - 128)
            } else {
                MemberStatus::Exited(code)
            };
            if let Some(job) = job_table.by_jobid_mut(job_num) {
                job.update_member(pid, status);
            }
        }
    }

    let status = job_table.by_jobid(job_num).map(|j| j.aggregate_status(false)).unwrap_or(0);
    job_table.remove(job_num);
    status
}

#[cfg(not(unix))]
fn reap_job(job_table: &mut JobTable, job_num: u32) -> i32 {
    job_table.remove(job_num);
    0
}

/// `wait [jobspec|pid]`: no operand waits for every tracked background job
/// and returns the last one's status (bash's behaviour, looser than the
/// POSIX-mandated "0"); an operand waits for just that job. An unresolvable
/// operand is reported and treated as an unsuccessful wait (spec.md §4.2).
fn wait(args: &[String], job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    match args.first() {
        None => {
            let job_nums: Vec<u32> = job_table.iter().map(|j| j.job_num).collect();
            let mut status = 0;
            for job_num in job_nums {
                status = reap_job(job_table, job_num);
            }
            status
        }
        Some(arg) => {
            let spec = if arg.starts_with('%') { arg.clone() } else { arg.clone() };
            let job_num = if let Some(n) = spec.strip_prefix('%').and_then(|s| crate::jobs::parse_job_spec(&format!("%{s}")))
                .and_then(|parsed| resolve_parsed(job_table, parsed))
            {
                Some(n)
            } else if spec.starts_with('%') {
                None
            } else if let Ok(pid) = spec.parse::<i32>() {
                job_table.by_any_pid(pid).map(|j| j.job_num)
            } else {
                None
            };

            match job_num {
                Some(n) => reap_job(job_table, n),
                None => {
                    let _ = writeln!(stderr, "jsh: wait: {arg}: no such job");
                    1
                }
            }
        }
    }
}

fn resolve_parsed(job_table: &JobTable, spec: crate::jobs::JobSpec) -> Option<u32> {
    use crate::jobs::JobSpec;
    match spec {
        JobSpec::Current => {
            let cur = job_table.current();
            if cur == 0 { None } else { Some(cur) }
        }
        JobSpec::Previous => {
            let prev = job_table.previous();
            if prev == 0 { None } else { Some(prev) }
        }
        JobSpec::Number(n) => job_table.by_jobid(n).map(|_| n),
        JobSpec::Prefix(_) | JobSpec::Contains(_) => None,
    }
}

#[cfg(unix)]
fn kill(args: &[String], job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    let mut signal = libc::SIGTERM;
    let mut rest = args;

    if let Some(first) = args.first() {
        if let Some(name_or_num) = first.strip_prefix('-') {
            match parse_signal(name_or_num) {
                Some(sig) => {
                    signal = sig;
                    rest = &args[1..];
                }
                None => {
                    let _ = writeln!(stderr, "jsh: kill: {first}: unknown signal");
                    return 1;
                }
            }
        }
    }

    if rest.is_empty() {
        let _ = writeln!(stderr, "jsh: kill: usage: kill [-signal] pid|%job");
        return 1;
    }

    let mut exit_code = 0;
    for target in rest {
        let result = if let Some(spec) = target.strip_prefix('%') {
            match job_table.resolve(&format!("%{spec}")) {
                Ok(Some(job)) => unsafe { libc::kill(-(job.pgid as libc::pid_t), signal) },
                _ => {
                    let _ = writeln!(stderr, "jsh: kill: {target}: no such job");
                    exit_code = 1;
                    continue;
                }
            }
        } else {
            match target.parse::<i32>() {
                Ok(pid) => unsafe { libc::kill(pid as libc::pid_t, signal) },
                Err(_) => {
                    let _ = writeln!(stderr, "jsh: kill: {target}: arguments must be process or job IDs");
                    exit_code = 1;
                    continue;
                }
            }
        };
        if result != 0 {
            let _ = writeln!(stderr, "jsh: kill: {target}: {}", std::io::Error::last_os_error());
            exit_code = 1;
        }
    }
    exit_code
}

#[cfg(not(unix))]
fn kill(_args: &[String], _job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    let _ = writeln!(stderr, "jsh: kill: not supported on this platform");
    1
}

#[cfg(unix)]
pub(crate) fn parse_signal(text: &str) -> Option<libc::c_int> {
    if let Ok(n) = text.parse::<libc::c_int>() {
        return Some(n);
    }
    let name = text.trim_start_matches("SIG").to_uppercase();
    Some(match name.as_str() {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "CHLD" => libc::SIGCHLD,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "WINCH" => libc::SIGWINCH,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "ABRT" => libc::SIGABRT,
        _ => return None,
    })
}

#[cfg(not(unix))]
pub(crate) fn parse_signal(_text: &str) -> Option<i32> {
    None
}

fn disown(args: &[String], job_table: &mut JobTable, stderr: &mut dyn Write) -> i32 {
    if args.is_empty() {
        let Some(job_num) = resolve_job_num(None, job_table) else {
            let _ = writeln!(stderr, "jsh: disown: no current job");
            return 1;
        };
        if let Some(job) = job_table.by_jobid_mut(job_num) {
            job.flags.disowned = true;
        }
        return 0;
    }

    let mut exit_code = 0;
    for arg in args {
        match resolve_job_num(Some(arg.as_str()), job_table) {
            Some(job_num) => {
                if let Some(job) = job_table.by_jobid_mut(job_num) {
                    job.flags.disowned = true;
                }
            }
            None => {
                let _ = writeln!(stderr, "jsh: disown: {arg}: no such job");
                exit_code = 1;
            }
        }
    }
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobFlags};

    fn table_with_one_job() -> (JobTable, u32) {
        let mut table = JobTable::new();
        let mut job = Job::new("sleep 1".to_string(), 4242, JobFlags { job_controlled: true, ..JobFlags::default() });
        job.add_member(ProcessSlot::ExternalPid(4242)).unwrap();
        let job_num = table.add(job).unwrap();
        (table, job_num)
    }

    #[test]
    fn resolve_job_num_defaults_to_current() {
        let (table, job_num) = table_with_one_job();
        assert_eq!(resolve_job_num(None, &table), Some(job_num));
    }

    #[test]
    fn resolve_job_num_accepts_bare_number() {
        let (table, job_num) = table_with_one_job();
        assert_eq!(resolve_job_num(Some(&job_num.to_string()), &table), Some(job_num));
    }

    #[test]
    fn resolve_job_num_rejects_unknown_spec() {
        let (table, _) = table_with_one_job();
        assert_eq!(resolve_job_num(Some("%99"), &table), None);
    }

    #[test]
    fn disown_with_no_args_marks_current_job() {
        let (mut table, job_num) = table_with_one_job();
        let mut stderr = Vec::new();
        assert_eq!(disown(&[], &mut table, &mut stderr), 0);
        assert!(table.by_jobid(job_num).unwrap().flags.disowned);
    }

    #[test]
    fn wait_on_unknown_jobspec_is_an_error() {
        let (mut table, _) = table_with_one_job();
        let mut stderr = Vec::new();
        assert_eq!(wait(&["%99".to_string()], &mut table, &mut stderr), 1);
    }
}
