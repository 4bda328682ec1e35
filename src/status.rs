/// Convert an OS process status into shell-style exit code semantics.
///
/// On Unix, processes terminated by signal map to `128 + signal`.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

#[cfg(unix)]
pub fn exit_code_from_wait_status(raw_status: libc::c_int) -> Option<i32> {
    if unsafe { libc::WIFEXITED(raw_status) } {
        return Some(unsafe { libc::WEXITSTATUS(raw_status) });
    }

    if unsafe { libc::WIFSIGNALED(raw_status) } {
        let signal = unsafe { libc::WTERMSIG(raw_status) };
        return Some(128 + signal);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[cfg(unix)]
    #[rstest]
    #[case::sigint(libc::SIGINT, 130)]
    #[case::sigterm(libc::SIGTERM, 143)]
    #[case::sigkill(libc::SIGKILL, 137)]
    #[case::sigpipe(libc::SIGPIPE, 141)]
    fn signaled_status_maps_to_128_plus_signal(#[case] signal: libc::c_int, #[case] expected: i32) {
        // WIFSIGNALED(status) is true and WTERMSIG(status) == signal when
        // the low 7 bits hold the signal number and bit 7 (core dump) is 0.
        let raw_status = signal;
        assert_eq!(exit_code_from_wait_status(raw_status), Some(expected));
    }
}
