//! Command Dispatcher (spec.md §4.5): POSIX "Command Search and Execution"
//! for one simple command.
//!
//! Classification order: special built-in → function → regular built-in →
//! slash-path → hashed path → `PATH` search → `ENOEXEC` script fallback.
//! Function lookup and the word-expansion collaborator are external per
//! spec.md §1/§6; this module exposes narrow hooks for them and falls back
//! to an identity stub so the crate is self-contained for the demo binary.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::ast::{SimpleCommand, Word, WordSegment};
use crate::builtins::{self, ControlOutcome};
use crate::driver::{CallFrame, ControlFlow, Driver, DriverOptions, FunctionTable};
use crate::error::EngineError;
use crate::expand;
use crate::jobs::{Job, JobFlags, JobTable, ProcessSlot};
use crate::pipeline::ResolvedRedirections;
use crate::signal::SignalRouter;
use crate::status;
use crate::terminal::TerminalArbiter;
use crate::traps::{TrapEvent, TrapTable};

pub enum SimpleOutcome {
    Status(i32),
    Backgrounded { job_num: u32 },
    /// A foreground external command was stopped mid-flight (Ctrl-Z);
    /// caller should register the job and move on (spec.md §4.4 step 8 /
    /// §4.7), mirroring `pipeline::foreground_pipeline`'s handling.
    Stopped { job_num: u32 },
}

/// The engine-owned collaborators a simple command may need beyond its own
/// job table: the terminal arbiter (`jobs`/`fg`/`bg`), the trap table plus
/// signal router (`trap`), the driver's own options, and the function
/// registry/call-frame stack a defined-function invocation needs to recurse
/// back into the driver. Bundled so `run_simple`'s signature doesn't grow a
/// parameter per demo built-in that needs engine state.
pub struct EngineServices<'a> {
    pub arbiter: &'a TerminalArbiter,
    pub traps: &'a mut TrapTable,
    pub signals: &'a SignalRouter,
    pub options: &'a DriverOptions,
    pub functions: &'a mut FunctionTable,
    pub call_stack: &'a mut Vec<CallFrame>,
}

/// Special built-ins (POSIX XCU 2.4): never forked, their assignment scope
/// merges into the global scope, and under `-r` they cannot be overridden
/// by a function of the same name.
const SPECIAL_BUILTINS: &[&str] =
    &["break", "continue", "return", "exit", ":", ".", "eval", "exec", "export", "readonly",
      "set", "shift", "times", "trap", "unset"];

pub fn is_special_builtin(name: &str) -> bool {
    SPECIAL_BUILTINS.contains(&name)
}

/// Join a word's segments without quote removal or field splitting — a
/// stand-in for the shared word-expansion collaborator (spec.md §6), which
/// owns parameter/command/arithmetic substitution, tilde expansion,
/// pathname expansion and `$IFS` splitting.
pub fn expand_word_stub(word: &Word) -> String {
    word.iter()
        .map(|seg| match seg {
            WordSegment::Unquoted(s) | WordSegment::DoubleQuoted(s) | WordSegment::SingleQuoted(s) => {
                s.as_str()
            }
        })
        .collect()
}

/// Run one simple command: classification (phase 5), fork decision (phase
/// 6), execution (phase 8). Phases 1/2/3/4/7/9 (redirection prep, argument
/// assembly, special forms, empty-word rule, redirection apply, post-exec
/// bookkeeping) are the pipeline builder's and the caller's responsibility —
/// this function is reached once a single bare stage has no pipe apparatus.
pub fn run_simple(
    cmd: &SimpleCommand,
    background: bool,
    job_table: &mut JobTable,
    services: &mut EngineServices<'_>,
    command_text: &str,
    resolved: ResolvedRedirections,
    restricted: bool,
    last_status: i32,
    line: u32,
) -> SimpleOutcome {
    let argv = expand::expand_argv(&cmd.words, last_status);
    let Some(program) = argv.first().cloned() else {
        // Bare assignment, no command word: phase 2's assignments already
        // applied by the caller; nothing left to run.
        return SimpleOutcome::Status(0);
    };
    let args = &argv[1..];

    if builtins::is_control_builtin(&program) {
        return match builtins::execute(&program, args) {
            ControlOutcome::Status(code) => SimpleOutcome::Status(code),
            ControlOutcome::Exit(code) => std::process::exit(code),
        };
    }

    if program == "trap" {
        let mut stdout = match resolved.stdout.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let mut stderr = match resolved.stderr.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let code = crate::traps::trap_builtin(args, services.traps, services.signals, stdout.as_mut(), stderr.as_mut());
        let _ = stdout.flush();
        let _ = stderr.flush();
        return SimpleOutcome::Status(code);
    }

    // spec.md §4.5 phase 5 "defined function": checked ahead of the regular
    // built-ins and `run_external`, matching bash's rule that a function can
    // shadow anything but a special built-in.
    if let Some(body) = services.functions.get(&program).cloned() {
        return run_function(&program, &body, job_table, services, line);
    }

    if crate::jobbuiltins::is_job_builtin(&program) {
        let mut stdout = match resolved.stdout.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let mut stderr = match resolved.stderr.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let code = crate::jobbuiltins::execute(&program, args, job_table, services.arbiter, stdout.as_mut(), stderr.as_mut());
        let _ = stdout.flush();
        let _ = stderr.flush();
        return SimpleOutcome::Status(code);
    }

    // Regular built-ins and function lookup are external collaborators in
    // this crate's scope (spec.md §1); `refbuiltins` is the demo binary's
    // own stand-in for a few of them, checked here so the sample shell is
    // usable without a full symbol-table/builtin-registry collaborator.
    if crate::refbuiltins::is_reference_builtin(&program) {
        let mut stdout = match resolved.stdout.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let mut stderr = match resolved.stderr.into_writer() {
            Ok(w) => w,
            Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
        };
        let code = crate::refbuiltins::execute(&program, args, stdout.as_mut(), stderr.as_mut());
        let _ = stdout.flush();
        let _ = stderr.flush();
        return SimpleOutcome::Status(code);
    }

    if restricted {
        if program.contains('/') {
            eprintln!("jsh: {program}: restricted: cannot specify \"/\" in command names");
            return SimpleOutcome::Status(1);
        }
        if program == "exec" {
            eprintln!("jsh: exec: restricted");
            return SimpleOutcome::Status(1);
        }
        if program == "command" && args.first().map(String::as_str) == Some("-p") {
            eprintln!("jsh: command: -p: restricted");
            return SimpleOutcome::Status(1);
        }
    }

    run_external(&program, args, background, job_table, services.arbiter, services.options.job_control, command_text, resolved)
}

/// Invoke a defined function (spec.md §4.5 phase 8): enforce `FUNCNEST`,
/// push a call frame, reset `DEBUG`/`RETURN`/`ERR` the same way a subshell
/// would (spec.md §4.6a) so the function doesn't inherit the caller's, run
/// the body through a nested `Driver`, fire `RETURN` if the body armed one,
/// then restore the caller's trap state and pop the frame.
///
/// Positional parameters and `$0` rebinding for the call's duration are the
/// word-expansion collaborator's concern (spec.md §1) and aren't set here;
/// explicit redirections on the call itself (`f > file`) aren't honoured
/// either, since the body's own commands write through the process's real
/// stdio rather than this call's resolved handles.
fn run_function(
    name: &str,
    body: &std::rc::Rc<Vec<crate::ast::Node>>,
    job_table: &mut JobTable,
    services: &mut EngineServices<'_>,
    line: u32,
) -> SimpleOutcome {
    let funcnest: u32 = std::env::var("FUNCNEST").ok().and_then(|s| s.parse().ok()).unwrap_or(0);
    if funcnest != 0 && services.call_stack.len() as u32 >= funcnest {
        let err = EngineError::ResourceCap { what: "FUNCNEST exceeded" };
        eprintln!("jsh: {name}: {err}");
        return SimpleOutcome::Status(err.exit_status());
    }

    services.call_stack.push(CallFrame {
        function_name: name.to_string(),
        source_name: name.to_string(),
        line,
    });

    let prev_funcname = std::env::var("FUNCNAME").ok();
    // SAFETY: single-threaded driver loop; no concurrent env readers.
    unsafe { std::env::set_var("FUNCNAME", name) };

    let saved_traps = services.traps.clone();
    services.traps.reset_for_subshell(false);

    let flow = {
        let mut nested = Driver {
            options: services.options,
            job_table: &mut *job_table,
            arbiter: services.arbiter,
            traps: &mut *services.traps,
            signals: services.signals,
            functions: &mut *services.functions,
            call_stack: &mut *services.call_stack,
        };
        nested.run_list(body)
    };

    crate::driver::fire_trap_via_services(TrapEvent::Return, job_table, services);

    *services.traps = saved_traps;
    services.call_stack.pop();
    // SAFETY: single-threaded driver loop; no concurrent env readers.
    unsafe {
        match &prev_funcname {
            Some(v) => std::env::set_var("FUNCNAME", v),
            None => std::env::remove_var("FUNCNAME"),
        }
    }

    match flow {
        ControlFlow::Exit(code) => std::process::exit(code),
        other => SimpleOutcome::Status(other.status()),
    }
}

/// Execute a stage in-process for `lastpipe` (spec.md §4.4/§9): only
/// meaningful for built-ins, since externals always need their own fds.
/// Falls back to reporting *not found* for anything else, since running an
/// external program in-process is not possible.
pub fn run_inprocess(
    cmd: &SimpleCommand,
    _stdin: &mut dyn Read,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    last_status: i32,
) -> i32 {
    let argv = expand::expand_argv(&cmd.words, last_status);
    let Some(program) = argv.first() else { return 0 };
    let args = &argv[1..];

    if builtins::is_control_builtin(program) {
        return match builtins::execute(program, args) {
            ControlOutcome::Status(code) => code,
            ControlOutcome::Exit(code) => std::process::exit(code),
        };
    }

    let _ = stdout;
    let _ = writeln!(stderr, "jsh: {program}: in-process execution requires a built-in");
    127
}

fn run_external(
    program: &str,
    args: &[String],
    background: bool,
    job_table: &mut JobTable,
    arbiter: &TerminalArbiter,
    job_control: bool,
    command_text: &str,
    resolved: ResolvedRedirections,
) -> SimpleOutcome {
    let (stdin_stdio, here_string) = match resolved.stdin.into_stdio() {
        Ok(v) => v,
        Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
    };
    let stdout_stdio = match resolved.stdout.into_stdio() {
        Ok(v) => v,
        Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
    };
    let stderr_stdio = match resolved.stderr.into_stdio() {
        Ok(v) => v,
        Err(msg) => { eprintln!("{msg}"); return SimpleOutcome::Status(1); }
    };

    let mut process = build_command(program, args);
    process.stdin(stdin_stdio).stdout(stdout_stdio).stderr(stderr_stdio);

    let mut child = match crate::spawner::spawn(&mut process) {
        Ok(child) => child,
        Err(e) if is_enoexec(&e) => match spawn_via_script_fallback(program, args) {
            Ok(child) => child,
            Err(e) => return SimpleOutcome::Status(spawn_error_status(program, &e)),
        },
        Err(e) => return SimpleOutcome::Status(spawn_error_status(program, &e)),
    };

    if let Some(text) = here_string {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = writeln!(stdin, "{text}");
        }
    }

    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        let _ = crate::terminal::set_process_group(pid, pid);
    }

    if background {
        let pgid = child.id() as i32;
        let mut job = Job::new(command_text.to_string(), pgid, JobFlags { job_controlled: true, ..JobFlags::default() });
        let _ = job.add_member(ProcessSlot::ExternalPid(pgid));
        std::mem::forget(child);
        return match job_table.add(job) {
            Ok(job_num) => SimpleOutcome::Backgrounded { job_num },
            Err(e) => {
                eprintln!("jsh: {e}");
                SimpleOutcome::Status(1)
            }
        };
    }

    run_external_foreground(program, child, job_table, arbiter, job_control, command_text)
}

/// Foreground wait for a single external command (spec.md §4.4 step 8 /
/// §4.7): transfers terminal ownership to the child's process group for
/// the duration of the wait and detects a Ctrl-Z stop the same way
/// `pipeline::foreground_pipeline` does for multi-stage pipelines, rather
/// than a plain `child.wait()` that can neither suspend nor be notified on.
#[cfg(unix)]
fn run_external_foreground(
    program: &str,
    child: std::process::Child,
    job_table: &mut JobTable,
    arbiter: &TerminalArbiter,
    job_control: bool,
    command_text: &str,
) -> SimpleOutcome {
    let pid = child.id() as i32;

    let guard = job_control.then(|| arbiter.begin_foreground(pid).ok().flatten()).flatten();
    let outcome = crate::pipeline::wait_for_group(&[pid], pid);
    drop(guard);

    match outcome {
        Ok(crate::pipeline::GroupWaitOutcome::Stopped) => {
            let attrs = arbiter.capture_attrs().ok();
            let flags = JobFlags { job_controlled: job_control, ..JobFlags::default() };
            let mut job = Job::new(command_text.to_string(), pid, flags);
            job.saved_terminal_attrs = attrs;
            let _ = job.add_member(ProcessSlot::ExternalPid(pid));
            std::mem::forget(child);
            match job_table.add(job) {
                Ok(job_num) => {
                    if let Some(job) = job_table.by_jobid(job_num) {
                        println!("{}", job_table.notification_line(job, "Stopped"));
                    }
                    SimpleOutcome::Stopped { job_num }
                }
                Err(e) => {
                    eprintln!("jsh: {e}");
                    SimpleOutcome::Status(1)
                }
            }
        }
        Ok(crate::pipeline::GroupWaitOutcome::Exited(by_pid)) => {
            drop(child); // already reaped by wait_for_group's waitpid
            let code = by_pid.get(&pid).and_then(|s| s.exit_code()).unwrap_or(0);
            SimpleOutcome::Status(code)
        }
        Err(e) => {
            eprintln!("jsh: {program}: {e}");
            SimpleOutcome::Status(1)
        }
    }
}

#[cfg(not(unix))]
fn run_external_foreground(
    program: &str,
    mut child: std::process::Child,
    _job_table: &mut JobTable,
    _arbiter: &TerminalArbiter,
    _job_control: bool,
    _command_text: &str,
) -> SimpleOutcome {
    match child.wait() {
        Ok(status) => SimpleOutcome::Status(status::exit_code(status)),
        Err(e) => {
            eprintln!("jsh: {program}: {e}");
            SimpleOutcome::Status(1)
        }
    }
}

fn build_command(program: &str, args: &[String]) -> Command {
    let mut process = Command::new(program);
    process.args(args);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            process.pre_exec(|| crate::spawner::prepare_child(0, true));
        }
    }

    process
}

#[cfg(unix)]
fn is_enoexec(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOEXEC)
}

#[cfg(not(unix))]
fn is_enoexec(_e: &std::io::Error) -> bool {
    false
}

/// spec.md §4.5 "Script fallback": on `ENOEXEC`, read the first 256 bytes;
/// a leading `#!` names an interpreter (plus one optional argument),
/// otherwise the shell's own executable re-runs the file as a script.
fn spawn_via_script_fallback(program: &str, args: &[String]) -> std::io::Result<std::process::Child> {
    let mut header = [0u8; 256];
    let read = {
        let mut f = std::fs::File::open(program)?;
        f.read(&mut header)?
    };
    let text = String::from_utf8_lossy(&header[..read]);

    let (interpreter, interp_arg) = if let Some(rest) = text.strip_prefix("#!") {
        let line = rest.lines().next().unwrap_or("").trim();
        match line.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd.to_string(), Some(arg.trim().to_string())),
            None if !line.is_empty() => (line.to_string(), None),
            None => (std::env::current_exe()?.to_string_lossy().into_owned(), None),
        }
    } else {
        (std::env::current_exe()?.to_string_lossy().into_owned(), None)
    };

    let mut full_args = Vec::new();
    full_args.extend(interp_arg);
    full_args.push(program.to_string());
    full_args.extend(args.iter().cloned());

    crate::spawner::spawn(&mut build_command(&interpreter, &full_args))
}

/// Map a spawn/exec error to 126/127 (spec.md §7).
pub fn spawn_error_status(program: &str, e: &std::io::Error) -> i32 {
    if e.kind() == std::io::ErrorKind::NotFound {
        eprintln!("jsh: {program}: command not found");
        127
    } else {
        eprintln!("jsh: {program}: {e}");
        126
    }
}

/// `PATH` search (spec.md §4.5 phase 5 "hashed path / `PATH` search"). No
/// hashing cache is kept yet — every call re-walks `$PATH` (spec.md §6
/// lists `-h` hash-utility-paths as an option the engine honours; the cache
/// itself belongs to the symbol-table collaborator).
pub fn search_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return if is_executable(&candidate) { Some(candidate) } else { None };
    }

    let path_var = std::env::var("PATH").ok()?;
    let separator = if cfg!(windows) { ';' } else { ':' };
    for dir in path_var.split(separator) {
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else { return false };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_builtins_match_posix_list() {
        assert!(is_special_builtin("exit"));
        assert!(is_special_builtin("export"));
        assert!(!is_special_builtin("echo"));
    }

    #[test]
    fn expand_word_stub_concatenates_segments() {
        let word = vec![
            WordSegment::Unquoted("foo".into()),
            WordSegment::DoubleQuoted("bar ".into()),
            WordSegment::SingleQuoted("baz".into()),
        ];
        assert_eq!(expand_word_stub(&word), "foobar baz");
    }

    #[test]
    fn search_path_rejects_missing_command() {
        assert!(search_path("definitely-not-a-real-command-xyz").is_none());
    }
}
