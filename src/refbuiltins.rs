//! Demo-only builtins: `cd`, `pwd`, `echo`, `export`, `unset`, `type`.
//!
//! Out of scope for the engine per spec.md §1 ("individual built-in
//! utilities" are a separate collaborator) — kept here only so `bin/jsh.rs`
//! is a usable interactive shell rather than a bare pipeline/job-control
//! demo.

use std::io::Write;
use crate::dispatch;

const NAMES: &[&str] = &["cd", "pwd", "echo", "export", "unset", "type"];

pub fn is_reference_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

pub fn execute(program: &str, args: &[String], stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32 {
    match program {
        "cd" => cd(args, stderr),
        "pwd" => pwd(stdout, stderr),
        "echo" => echo(args, stdout),
        "export" => export(args, stderr),
        "unset" => unset(args),
        "type" => type_cmd(args, stdout, stderr),
        _ => {
            let _ = writeln!(stderr, "jsh: unknown reference builtin: {program}");
            1
        }
    }
}

fn cd(args: &[String], stderr: &mut dyn Write) -> i32 {
    let target = match args.first() {
        Some(dir) if dir == "-" => match std::env::var("OLDPWD") {
            Ok(prev) => prev,
            Err(_) => {
                let _ = writeln!(stderr, "cd: OLDPWD not set");
                return 1;
            }
        },
        Some(dir) => dir.clone(),
        None => std::env::var("HOME").unwrap_or_else(|_| ".".to_string()),
    };

    if let Ok(cwd) = std::env::current_dir() {
        unsafe { std::env::set_var("OLDPWD", cwd) };
    }

    if let Err(e) = std::env::set_current_dir(&target) {
        let _ = writeln!(stderr, "cd: {target}: {e}");
        return 1;
    }
    0
}

fn pwd(stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32 {
    match std::env::current_dir() {
        Ok(path) => {
            let _ = writeln!(stdout, "{}", path.display());
            0
        }
        Err(e) => {
            let _ = writeln!(stderr, "pwd: {e}");
            1
        }
    }
}

fn echo(args: &[String], stdout: &mut dyn Write) -> i32 {
    let _ = writeln!(stdout, "{}", args.join(" "));
    0
}

fn export(args: &[String], stderr: &mut dyn Write) -> i32 {
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            unsafe { std::env::set_var(key, value) };
        } else {
            let _ = writeln!(stderr, "export: usage: export VAR=value");
        }
    }
    0
}

fn unset(args: &[String]) -> i32 {
    for arg in args {
        unsafe { std::env::remove_var(arg) };
    }
    0
}

fn type_cmd(args: &[String], stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32 {
    let mut exit_code = 0;
    for arg in args {
        if is_reference_builtin(arg) || crate::builtins::is_control_builtin(arg) {
            let _ = writeln!(stdout, "{arg} is a shell builtin");
        } else {
            match dispatch::search_path(arg) {
                Some(path) => { let _ = writeln!(stdout, "{arg} is {}", path.display()); }
                None => {
                    let _ = writeln!(stderr, "{arg}: not found");
                    exit_code = 1;
                }
            }
        }
    }
    exit_code
}
