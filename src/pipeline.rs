//! Pipeline Builder (spec.md §4.4): allocates pipes, assigns process
//! groups, wires stdin/stdout between stages, optionally runs the last
//! stage in-process under `lastpipe`.

use os_pipe::{PipeReader, PipeWriter, pipe};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::process::{Command, Stdio};

use crate::ast::{Pipeline, RedirectTarget, Redirection, SimpleCommand};
use crate::dispatch::{self, EngineServices, SimpleOutcome};
use crate::expand;
use crate::jobs::{Job, JobFlags, JobTable, MemberStatus, ProcessSlot};
use crate::spawner;
use crate::status;
use crate::terminal::TerminalArbiter;

pub struct PipelineSettings {
    pub background: bool,
    pub pipefail: bool,
    /// Run the final stage in-process rather than forking it, when the
    /// pipeline is foreground and job control is off (spec.md §4.4 contract).
    pub lastpipe: bool,
    pub job_control: bool,
    /// spec.md §4.5 "Restricted-shell policy": reject `/` in command names
    /// and output redirection once startup has completed.
    pub restricted: bool,
    /// `$?` as seen by this pipeline's word expansion (spec.md §6).
    pub last_status: i32,
    /// Source line of the AND-OR list this pipeline belongs to, threaded
    /// down to a defined-function call frame (spec.md §3).
    pub line: u32,
}

pub enum PipelineOutcome {
    Status(i32),
    /// A foreground pipeline was stopped mid-flight (Ctrl-Z); caller should
    /// register the partially-complete job and move on.
    Stopped { job_num: u32 },
}

/// Execute a parsed pipeline end to end (spec.md §4.4 algorithm steps 1-10).
pub fn run(
    pipeline: &Pipeline,
    command_text: &str,
    settings: &PipelineSettings,
    job_table: &mut JobTable,
    arbiter: &TerminalArbiter,
    services: &mut EngineServices<'_>,
) -> PipelineOutcome {
    let _span = tracing::span!(tracing::Level::DEBUG, "pipeline", n_stages = pipeline.stages.len()).entered();

    if pipeline.stages.is_empty() {
        return PipelineOutcome::Status(0);
    }

    // Step 2: single stage, no pipe apparatus needed — still runs through
    // redirection resolution (phase 1/7), since `cmd > file` is the common
    // case and has no pipe to smuggle the fds through.
    if pipeline.stages.len() == 1 {
        let stage = &pipeline.stages[0];
        let resolved = match resolve_redirections(
            &stage.redirections,
            RedirectionDefaults { stdin: InputHandle::Inherit, stdout: OutputHandle::Inherit, stderr: OutputHandle::Inherit },
            settings.restricted,
            settings.last_status,
        ) {
            Ok(r) => r,
            Err(msg) => {
                eprintln!("{msg}");
                return PipelineOutcome::Status(1);
            }
        };
        let outcome = dispatch::run_simple(
            stage,
            settings.background,
            job_table,
            services,
            command_text,
            resolved,
            settings.restricted,
            settings.last_status,
            settings.line,
        );
        let code = match outcome {
            SimpleOutcome::Status(code) => code,
            SimpleOutcome::Backgrounded { job_num } => {
                // spec.md §4.4 step 9 "[n] pid" notification: the multi-stage
                // path emits this in `background_pipeline`; a single
                // backgrounded simple command takes this shortcut instead of
                // going through the pipe/fork apparatus, so it needs the same
                // notification here.
                if let Some(job) = job_table.by_jobid(job_num) {
                    println!("{}", job_table.notification_line(job, "Running"));
                }
                0
            }
            // Stopped (Ctrl-Z): already registered and notified by
            // `dispatch::run_external_foreground`, same as
            // `foreground_pipeline`'s Stopped arm — no negation applies.
            SimpleOutcome::Stopped { job_num } => return PipelineOutcome::Stopped { job_num },
        };
        return PipelineOutcome::Status(apply_negation(pipeline.negate, code));
    }

    let last_is_lastpipe_candidate =
        settings.lastpipe && !settings.background && !settings.job_control;

    let mut children: Vec<StageHandle> = Vec::new();
    let mut pipeline_pgid: Option<i32> = None;
    let mut prev_pipe: Option<PipeReader> = None;
    let mut last_status = 0;
    let stage_count = pipeline.stages.len();

    for (idx, stage) in pipeline.stages.iter().enumerate() {
        let is_last = idx + 1 == stage_count;
        let run_inprocess = is_last && last_is_lastpipe_candidate;

        let stdin_default = prev_pipe
            .take()
            .map(InputHandle::Pipe)
            .unwrap_or(InputHandle::Inherit);

        let (stdout_default, next_reader) = if !is_last {
            match pipe() {
                Ok((reader, writer)) => (OutputHandle::Pipe(writer), Some(reader)),
                Err(e) => {
                    eprintln!("jsh: failed to create pipe: {e}");
                    wait_all(&mut children);
                    return PipelineOutcome::Status(1);
                }
            }
        } else {
            (OutputHandle::Inherit, None)
        };

        let resolved = match resolve_redirections(
            &stage.redirections,
            RedirectionDefaults { stdin: stdin_default, stdout: stdout_default, stderr: OutputHandle::Inherit },
            settings.restricted,
            settings.last_status,
        ) {
            Ok(r) => r,
            Err(msg) => {
                eprintln!("{msg}");
                wait_all(&mut children);
                return PipelineOutcome::Status(1);
            }
        };

        if run_inprocess {
            // lastpipe: the final stage executes in the shell's own process
            // (spec.md §4.4 / §9 "job table polymorphism" — this member is
            // recorded as `ProcessSlot::InProcess`, not a pid).
            let mut stdin_reader = match resolved.stdin.into_reader() {
                Ok(r) => r,
                Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
            };
            let mut stdout_writer = match resolved.stdout.into_writer() {
                Ok(w) => w,
                Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
            };
            let mut stderr_writer = match resolved.stderr.into_writer() {
                Ok(w) => w,
                Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
            };
            last_status = dispatch::run_inprocess(
                stage,
                stdin_reader.as_mut(),
                stdout_writer.as_mut(),
                stderr_writer.as_mut(),
                settings.last_status,
            );
            let _ = stdout_writer.flush();
            let _ = stderr_writer.flush();
            children.push(StageHandle::InProcess);
            prev_pipe = next_reader;
            continue;
        }

        let argv = expand::expand_argv(&stage.words, settings.last_status);
        let program = argv.first().cloned().unwrap_or_default();
        if settings.restricted && program.contains('/') {
            eprintln!("jsh: {program}: restricted: cannot specify \"/\" in command names");
            wait_all(&mut children);
            return PipelineOutcome::Status(1);
        }

        let mut process = Command::new(&program);
        process.args(&argv[1..]);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let captured_pgid = pipeline_pgid;
            let job_control = settings.job_control;
            unsafe {
                process.pre_exec(move || {
                    spawner::prepare_child(captured_pgid.unwrap_or(0), job_control)?;
                    Ok(())
                });
            }
        }

        let (stdin_stdio, here_string) = match resolved.stdin.into_stdio() {
            Ok(v) => v,
            Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
        };
        let stdout_stdio = match resolved.stdout.into_stdio() {
            Ok(v) => v,
            Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
        };
        let stderr_stdio = match resolved.stderr.into_stdio() {
            Ok(v) => v,
            Err(msg) => { eprintln!("{msg}"); wait_all(&mut children); return PipelineOutcome::Status(1); }
        };

        process.stdin(stdin_stdio).stdout(stdout_stdio).stderr(stderr_stdio);

        let mut child = match spawner::spawn(&mut process) {
            Ok(c) => {
                tracing::event!(tracing::Level::TRACE, pid = c.id(), program = %program, "forked pipeline stage");
                c
            }
            Err(e) => {
                let code = dispatch::spawn_error_status(&program, &e);
                wait_all(&mut children);
                return PipelineOutcome::Status(code);
            }
        };

        #[cfg(unix)]
        if pipeline_pgid.is_none() {
            let pid = child.id() as libc::pid_t;
            let _ = crate::terminal::set_process_group(pid, pid);
            pipeline_pgid = Some(pid as i32);
        }

        if let Some(text) = here_string {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = writeln!(stdin, "{text}");
            }
        }

        children.push(StageHandle::Pid(child));
        prev_pipe = next_reader;
    }

    let pgid = pipeline_pgid.unwrap_or(0);

    if settings.background {
        return background_pipeline(children, pgid, command_text, job_table);
    }

    foreground_pipeline(children, pgid, pipeline.negate, last_status, settings.pipefail, command_text, job_table, arbiter)
}

fn apply_negation(negate: bool, code: i32) -> i32 {
    if negate { if code == 0 { 1 } else { 0 } } else { code }
}

/// spec.md §4.4/§4.2 `aggregate_status`, applied to a pipeline whose
/// members never made it into the job table (the common case: a completed
/// foreground pipeline whose job is never created).
fn aggregate(statuses: &[MemberStatus], pipefail: bool) -> i32 {
    if pipefail {
        for s in statuses {
            if let Some(code) = s.exit_code() {
                if code != 0 {
                    return code;
                }
            }
        }
        return 0;
    }
    statuses.last().and_then(|s| s.exit_code()).unwrap_or(0)
}

enum StageHandle {
    Pid(std::process::Child),
    InProcess,
}

fn background_pipeline(
    mut children: Vec<StageHandle>,
    pgid: i32,
    command_text: &str,
    job_table: &mut JobTable,
) -> PipelineOutcome {
    let mut flags = JobFlags { job_controlled: true, ..JobFlags::default() };
    flags.foreground = false;
    let mut job = Job::new(command_text.to_string(), pgid, flags);

    for handle in children.drain(..) {
        match handle {
            StageHandle::Pid(child) => {
                let _ = job.add_member(ProcessSlot::ExternalPid(child.id() as i32));
                std::mem::forget(child); // ownership of the pid now belongs to the job table
            }
            StageHandle::InProcess => {
                let _ = job.add_member(ProcessSlot::InProcess);
                job.update_inprocess(MemberStatus::Exited(0));
            }
        }
    }

    match job_table.add(job) {
        Ok(job_num) => {
            if let Some(job) = job_table.by_jobid(job_num) {
                println!("{}", job_table.notification_line(job, "Running"));
            }
            PipelineOutcome::Status(0)
        }
        Err(e) => {
            eprintln!("jsh: {e}");
            PipelineOutcome::Status(1)
        }
    }
}

#[cfg(unix)]
fn foreground_pipeline(
    mut children: Vec<StageHandle>,
    pgid: i32,
    negate: bool,
    inprocess_status: i32,
    pipefail: bool,
    command_text: &str,
    job_table: &mut JobTable,
    arbiter: &TerminalArbiter,
) -> PipelineOutcome {
    if children.is_empty() {
        return PipelineOutcome::Status(apply_negation(negate, inprocess_status));
    }

    let guard = arbiter.begin_foreground(pgid).ok().flatten();

    let mut statuses: Vec<MemberStatus> = Vec::new();
    let mut pids: Vec<i32> = Vec::new();
    for handle in &children {
        if let StageHandle::Pid(child) = handle {
            pids.push(child.id() as i32);
        }
    }

    let outcome = wait_for_group(&pids, pgid);

    drop(guard);

    match outcome {
        Ok(GroupWaitOutcome::Stopped) => {
            let attrs = arbiter.capture_attrs().ok();
            let flags = JobFlags { job_controlled: true, ..JobFlags::default() };
            let mut job = Job::new(command_text.to_string(), pgid, flags);
            job.saved_terminal_attrs = attrs;
            for handle in children.drain(..) {
                match handle {
                    StageHandle::Pid(child) => {
                        let _ = job.add_member(ProcessSlot::ExternalPid(child.id() as i32));
                        std::mem::forget(child);
                    }
                    StageHandle::InProcess => {
                        let _ = job.add_member(ProcessSlot::InProcess);
                        job.update_inprocess(MemberStatus::Exited(inprocess_status));
                    }
                }
            }
            match job_table.add(job) {
                Ok(job_num) => {
                    if let Some(job) = job_table.by_jobid(job_num) {
                        println!("{}", job_table.notification_line(job, "Stopped"));
                    }
                    PipelineOutcome::Stopped { job_num }
                }
                Err(e) => {
                    eprintln!("jsh: {e}");
                    PipelineOutcome::Status(1)
                }
            }
        }
        Ok(GroupWaitOutcome::Exited(by_pid)) => {
            for handle in &children {
                match handle {
                    StageHandle::Pid(child) => {
                        statuses.push(*by_pid.get(&(child.id() as i32)).unwrap_or(&MemberStatus::Exited(0)));
                    }
                    StageHandle::InProcess => statuses.push(MemberStatus::Exited(inprocess_status)),
                }
            }
            let code = aggregate(&statuses, pipefail);
            PipelineOutcome::Status(apply_negation(negate, code))
        }
        Err(e) => {
            eprintln!("jsh: failed waiting for pipeline: {e}");
            PipelineOutcome::Status(1)
        }
    }
}

#[cfg(not(unix))]
fn foreground_pipeline(
    mut children: Vec<StageHandle>,
    _pgid: i32,
    negate: bool,
    inprocess_status: i32,
    _pipefail: bool,
    _command_text: &str,
    _job_table: &mut JobTable,
    _arbiter: &TerminalArbiter,
) -> PipelineOutcome {
    let mut last = inprocess_status;
    for handle in children.drain(..) {
        if let StageHandle::Pid(mut child) = handle {
            if let Ok(st) = child.wait() {
                last = status::exit_code(st);
            }
        }
    }
    PipelineOutcome::Status(apply_negation(negate, last))
}

#[cfg(unix)]
pub(crate) enum GroupWaitOutcome {
    Exited(std::collections::HashMap<i32, MemberStatus>),
    Stopped,
}

/// Wait for every pid in `pids`, all members of process group `pgid`, to
/// either exit or stop (`WUNTRACED`). Shared by the multi-stage pipeline
/// path and `dispatch::run_external_foreground`'s single-command path, so
/// both detect a Ctrl-Z stop the same way (spec.md §4.4 step 8 / §4.7).
#[cfg(unix)]
pub(crate) fn wait_for_group(pids: &[i32], pgid: i32) -> io::Result<GroupWaitOutcome> {
    use std::collections::{HashMap, HashSet};

    if pids.is_empty() {
        return Ok(GroupWaitOutcome::Exited(HashMap::new()));
    }

    let mut remaining: HashSet<i32> = pids.iter().copied().collect();
    let mut results = HashMap::new();

    while !remaining.is_empty() {
        let mut raw_status: libc::c_int = 0;
        let waited = unsafe { libc::waitpid(-(pgid as libc::pid_t), &mut raw_status, libc::WUNTRACED) };
        if waited < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }

        if unsafe { libc::WIFSTOPPED(raw_status) } {
            return Ok(GroupWaitOutcome::Stopped);
        }

        if !remaining.remove(&(waited as i32)) {
            continue;
        }

        let status = if let Some(code) = status::exit_code_from_wait_status(raw_status) {
            if unsafe { libc::WIFSIGNALED(raw_status) } {
                MemberStatus::Signaled(code - 128)
            } else {
                MemberStatus::Exited(code)
            }
        } else {
            MemberStatus::Exited(1)
        };
        tracing::event!(tracing::Level::TRACE, pid = waited, ?status, "reaped pipeline stage");
        results.insert(waited as i32, status);
    }

    Ok(GroupWaitOutcome::Exited(results))
}

fn wait_all(children: &mut Vec<StageHandle>) {
    for handle in children.drain(..) {
        if let StageHandle::Pid(mut child) = handle {
            let _ = child.wait();
        }
    }
}

// ── Redirection resolution (shared shape with dispatch.rs's simple-command path) ──

pub(crate) enum InputHandle {
    Inherit,
    Pipe(PipeReader),
    File(File),
    HereString(String),
}

pub(crate) enum OutputHandle {
    Inherit,
    Null,
    File(File),
    Pipe(PipeWriter),
}

impl OutputHandle {
    fn try_clone(&self) -> Result<OutputHandle, String> {
        match self {
            OutputHandle::Inherit => Ok(OutputHandle::Inherit),
            OutputHandle::Null => Ok(OutputHandle::Null),
            OutputHandle::File(f) => f.try_clone().map(OutputHandle::File).map_err(|e| format!("jsh: {e}")),
            OutputHandle::Pipe(w) => w.try_clone().map(OutputHandle::Pipe).map_err(|e| format!("jsh: {e}")),
        }
    }

    pub(crate) fn into_stdio(self) -> Result<Stdio, String> {
        Ok(match self {
            OutputHandle::Inherit => Stdio::inherit(),
            OutputHandle::Null => Stdio::null(),
            OutputHandle::File(f) => Stdio::from(f),
            OutputHandle::Pipe(w) => Stdio::from(w),
        })
    }

    pub(crate) fn into_writer(self) -> Result<Box<dyn Write + Send>, String> {
        Ok(match self {
            OutputHandle::Inherit => Box::new(io::stdout()),
            OutputHandle::Null => Box::new(io::sink()),
            OutputHandle::File(f) => Box::new(f),
            OutputHandle::Pipe(w) => Box::new(w),
        })
    }
}

impl InputHandle {
    pub(crate) fn into_stdio(self) -> Result<(Stdio, Option<String>), String> {
        Ok(match self {
            InputHandle::Inherit => (Stdio::inherit(), None),
            InputHandle::Pipe(r) => (Stdio::from(r), None),
            InputHandle::File(f) => (Stdio::from(f), None),
            InputHandle::HereString(text) => (Stdio::piped(), Some(text)),
        })
    }

    pub(crate) fn into_reader(self) -> Result<Box<dyn Read + Send>, String> {
        Ok(match self {
            InputHandle::Inherit => Box::new(io::stdin()),
            InputHandle::Pipe(r) => Box::new(r),
            InputHandle::File(f) => Box::new(f),
            InputHandle::HereString(text) => Box::new(Cursor::new(format!("{text}\n"))),
        })
    }
}

pub(crate) struct ResolvedRedirections {
    pub(crate) stdin: InputHandle,
    pub(crate) stdout: OutputHandle,
    pub(crate) stderr: OutputHandle,
}

pub(crate) struct RedirectionDefaults {
    pub(crate) stdin: InputHandle,
    pub(crate) stdout: OutputHandle,
    pub(crate) stderr: OutputHandle,
}

pub(crate) fn resolve_redirections(
    redirections: &[Redirection],
    defaults: RedirectionDefaults,
    restricted: bool,
    last_status: i32,
) -> Result<ResolvedRedirections, String> {
    let mut stdin = defaults.stdin;
    let mut stdout = defaults.stdout;
    let mut stderr = defaults.stderr;

    for redir in redirections {
        if restricted && matches!(redir.target, RedirectTarget::File(_) | RedirectTarget::FileAppend(_)) {
            return Err("jsh: restricted: cannot redirect output".to_string());
        }

        match (&redir.target, redir.fd) {
            (RedirectTarget::Fd(target), fd) if *target == fd => {}
            (RedirectTarget::File(path), 1) => stdout = open_output(path, false, last_status)?,
            (RedirectTarget::FileAppend(path), 1) => stdout = open_output(path, true, last_status)?,
            (RedirectTarget::FileRead(path), 0) => stdin = open_input(path, last_status)?,
            (RedirectTarget::File(path), 2) => stderr = open_output(path, false, last_status)?,
            (RedirectTarget::FileAppend(path), 2) => stderr = open_output(path, true, last_status)?,
            (RedirectTarget::Fd(1), 2) => stderr = stdout.try_clone()?,
            (RedirectTarget::Fd(2), 1) => stdout = stderr.try_clone()?,
            (RedirectTarget::HereString(word), 0) => {
                stdin = InputHandle::HereString(expand::expand_word_single(word, last_status));
            }
            (RedirectTarget::ProcessSubstitution { .. }, _) => {
                return Err("jsh: process substitution requires the word-expansion collaborator".into());
            }
            _ => return Err(format!("jsh: unsupported redirection on fd {}", redir.fd)),
        }
    }

    Ok(ResolvedRedirections { stdin, stdout, stderr })
}

fn open_output(word: &crate::ast::Word, append: bool, last_status: i32) -> Result<OutputHandle, String> {
    let path = expand::expand_word_single(word, last_status);
    if path == "/dev/null" {
        return Ok(OutputHandle::Null);
    }
    let file = if append {
        OpenOptions::new().create(true).append(true).open(&path)
    } else {
        OpenOptions::new().create(true).write(true).truncate(true).open(&path)
    };
    file.map(OutputHandle::File).map_err(|e| format!("jsh: {path}: {e}"))
}

fn open_input(word: &crate::ast::Word, last_status: i32) -> Result<InputHandle, String> {
    let path = expand::expand_word_single(word, last_status);
    File::open(&path).map(InputHandle::File).map_err(|e| format!("jsh: {path}: {e}"))
}
