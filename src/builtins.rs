//! Control built-ins (spec.md §1 scope: "`break`, `continue`, `return`,
//! `exit`" are the only built-ins this crate implements; everything else —
//! `cd`, `export`, `test`, etc. — is an "individual built-in utility" the
//! spec calls out of scope). `refbuiltins.rs` supplies demo-only versions
//! of a few of those for the sample binary.
//!
//! The driver (`driver.rs`) intercepts `break`/`continue`/`return` before
//! they would reach this module, since unwinding multiple loop levels needs
//! the `ControlFlow` value the driver already threads — this module's
//! handling of them is the degenerate case of being invoked directly as a
//! simple command with no enclosing loop/function, matching bash's
//! behaviour of treating that as a harmless no-op.

pub enum ControlOutcome {
    Status(i32),
    Exit(i32),
}

const CONTROL_BUILTINS: &[&str] = &["break", "continue", "return", "exit"];

pub fn is_control_builtin(name: &str) -> bool {
    CONTROL_BUILTINS.contains(&name)
}

pub fn execute(name: &str, args: &[String]) -> ControlOutcome {
    match name {
        "break" | "continue" => ControlOutcome::Status(0),
        "return" => {
            let code = parse_status_arg(args).unwrap_or(0);
            ControlOutcome::Status(code)
        }
        "exit" => {
            let code = parse_status_arg(args).unwrap_or(0);
            ControlOutcome::Exit(code)
        }
        _ => ControlOutcome::Status(1),
    }
}

fn parse_status_arg(args: &[String]) -> Option<i32> {
    args.first().and_then(|s| s.parse::<i32>().ok()).map(|n| n & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_parses_numeric_argument() {
        match execute("exit", &["7".to_string()]) {
            ControlOutcome::Exit(code) => assert_eq!(code, 7),
            _ => panic!("expected Exit"),
        }
    }

    #[test]
    fn exit_without_argument_defaults_to_zero() {
        match execute("exit", &[]) {
            ControlOutcome::Exit(code) => assert_eq!(code, 0),
            _ => panic!("expected Exit"),
        }
    }

    #[test]
    fn break_outside_a_loop_is_harmless() {
        matches!(execute("break", &[]), ControlOutcome::Status(0));
    }
}
