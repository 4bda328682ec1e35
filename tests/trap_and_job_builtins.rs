use std::io::Write;
use std::process::{Command, Stdio};

fn run_shell(lines: &[&str]) -> std::process::Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_jsh"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn james-shell");

    {
        let stdin = child.stdin.as_mut().expect("stdin");
        for line in lines {
            writeln!(stdin, "{line}").expect("write line");
        }
        writeln!(stdin, "exit").expect("write exit");
    }

    child.wait_with_output().expect("wait output")
}

// spec.md §8 scenario 4: `trap 'echo hi' USR1; kill -USR1 $$; echo after`
// emits `hi` then `after`.
#[cfg(unix)]
#[test]
fn trap_on_usr1_fires_before_the_next_command() {
    let output = run_shell(&["trap 'echo hi' USR1", "kill -USR1 $$", "echo after"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hi_pos = stdout.find("hi");
    let after_pos = stdout.find("after");
    assert!(hi_pos.is_some() && after_pos.is_some(), "stdout was: {stdout}");
    assert!(hi_pos < after_pos, "stdout was: {stdout}");
}

#[cfg(unix)]
#[test]
fn trap_minus_restores_default_disposition() {
    // Registering then un-trapping TERM should not leave the shell hung
    // waiting on a handler that no longer exists; the shell should still
    // process the next line normally.
    let output = run_shell(&["trap 'echo caught' TERM", "trap - TERM", "echo ALIVE"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ALIVE"), "stdout was: {stdout}");
}

#[cfg(unix)]
#[test]
fn trap_dash_p_prints_registered_traps_in_bash_format() {
    let output = run_shell(&["trap 'echo hi' USR1", "trap -p"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("trap -- 'echo hi'"), "stdout was: {stdout}");
}

// spec.md §8 scenario 3: `sleep 5 & jobs -l` immediately shows one line
// beginning `[1]+`.
#[cfg(unix)]
#[test]
fn jobs_lists_a_backgrounded_pipeline() {
    let output = run_shell(&["sleep 5 &", "jobs -l"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[1]+"), "stdout was: {stdout}");
}

#[cfg(unix)]
#[test]
fn kill_percent_job_then_wait_reports_signal_status() {
    // kill %1; wait %1; echo $? -> status 143 (128+SIGTERM).
    let output = run_shell(&["sleep 5 &", "kill %1", "wait %1", "echo STATUS:$?"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("STATUS:143"), "stdout was: {stdout}");
}

#[cfg(unix)]
#[test]
fn disown_marks_job_so_it_survives_shell_exit_policy() {
    let output = run_shell(&["sleep 5 &", "disown %1", "jobs"]);
    assert!(output.status.success(), "shell exited abnormally");
}
