//! Trap Dispatcher (spec.md §4.8): deferred execution of shell-code
//! handlers at safe points.

use std::collections::BTreeMap;

/// A trap slot's disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapAction {
    Unset,
    Ignore,
    Code(String),
}

/// Pseudo-events in addition to real signal numbers (spec.md §3 "Trap
/// table").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrapEvent {
    Signal(i32),
    Exit,
    Err,
    Debug,
    Return,
    Chld,
}

#[derive(Clone)]
pub struct TrapTable {
    actions: BTreeMap<TrapEvent, TrapAction>,
    pending_signals: Vec<i32>,
    /// Guards against recursive delivery of the trap currently running
    /// (spec.md §4.8 "a trap body executing the same trap masks that
    /// trap's delivery for the body's duration").
    running: Option<TrapEvent>,
    exit_trap_fired: bool,
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapTable {
    pub fn new() -> Self {
        TrapTable {
            actions: BTreeMap::new(),
            pending_signals: Vec::new(),
            running: None,
            exit_trap_fired: false,
        }
    }

    pub fn set(&mut self, event: TrapEvent, action: TrapAction) {
        if action == TrapAction::Unset {
            self.actions.remove(&event);
        } else {
            self.actions.insert(event, action);
        }
    }

    pub fn get(&self, event: TrapEvent) -> Option<&TrapAction> {
        self.actions.get(&event)
    }

    /// Called from `reconcile_signals` (`context.rs`) with every real
    /// signal observed since the last drain; queued for `do_pending_traps`.
    pub fn queue_signal(&mut self, signal: i32) {
        if self.actions.contains_key(&TrapEvent::Signal(signal)) {
            self.pending_signals.push(signal);
        }
    }

    /// `do_pending_traps()` (spec.md §4.8): run pending real-signal traps
    /// in ascending signal-number order; returns the shell-code strings to
    /// execute (execution itself is the caller's — it needs the driver).
    pub fn take_pending(&mut self) -> Vec<(TrapEvent, String)> {
        self.pending_signals.sort_unstable();
        self.pending_signals.dedup();
        let mut out = Vec::new();
        for signal in self.pending_signals.drain(..) {
            let event = TrapEvent::Signal(signal);
            if self.running == Some(event) {
                continue; // masked: the handler for this signal is on the stack
            }
            if let Some(TrapAction::Code(code)) = self.actions.get(&event) {
                out.push((event, code.clone()));
            }
        }
        out
    }

    /// `EXIT` trap: fires exactly once (spec.md §4.8), guarded against
    /// re-entry during exit processing.
    pub fn take_exit_trap(&mut self) -> Option<String> {
        if self.exit_trap_fired {
            return None;
        }
        self.exit_trap_fired = true;
        match self.actions.get(&TrapEvent::Exit) {
            Some(TrapAction::Code(code)) => Some(code.clone()),
            _ => None,
        }
    }

    /// `ERR` trap (spec.md §4.8): caller has already excluded AND-OR/test/
    /// loop-test-clause/`!`-inverted contexts before calling this.
    pub fn err_trap(&self) -> Option<&str> {
        match self.actions.get(&TrapEvent::Err) {
            Some(TrapAction::Code(code)) => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn debug_trap(&self) -> Option<&str> {
        match self.actions.get(&TrapEvent::Debug) {
            Some(TrapAction::Code(code)) => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn return_trap(&self) -> Option<&str> {
        match self.actions.get(&TrapEvent::Return) {
            Some(TrapAction::Code(code)) => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn chld_trap(&self) -> Option<&str> {
        match self.actions.get(&TrapEvent::Chld) {
            Some(TrapAction::Code(code)) => Some(code.as_str()),
            _ => None,
        }
    }

    /// Marks `event`'s handler as currently executing, for the recursion
    /// guard; pair with `clear_running` once the trap body returns.
    pub fn mark_running(&mut self, event: TrapEvent) {
        self.running = Some(event);
    }

    pub fn clear_running(&mut self) {
        self.running = None;
    }

    /// Whether `event`'s handler is on the stack right now — the same
    /// recursion guard `take_pending` applies to real signals, reused by
    /// the driver for the pseudo-events it fires directly (spec.md §4.8).
    pub fn is_running(&self, event: TrapEvent) -> bool {
        self.running == Some(event)
    }

    /// Reset on entry to a subshell unless trace modes are set (spec.md
    /// §4.6a): `DEBUG`/`RETURN`/`ERR` revert to unset.
    pub fn reset_for_subshell(&mut self, keep_traced: bool) {
        if keep_traced {
            return;
        }
        self.actions.remove(&TrapEvent::Debug);
        self.actions.remove(&TrapEvent::Return);
        self.actions.remove(&TrapEvent::Err);
    }
}

/// The `trap` built-in (spec.md §4.8 "Handlers registered by the `trap`
/// built-in are strings parsed on demand"). Not itself part of the engine's
/// scope per spec.md §1 ("individual built-in utilities ... are a separate
/// collaborator"), but kept here rather than in a demo-only module since it
/// is the sole entry point into the `TrapTable` this crate owns — without
/// it the dispatcher contract has no way to exercise §4.8 end to end.
///
/// Forms: `trap` / `trap -p` (print current dispositions), `trap ACTION
/// SIGSPEC...` where `ACTION` is `-` (reset to default), `''` (ignore), or
/// a shell-code string, and `SIGSPEC` is a signal name/number or one of the
/// pseudo-events `EXIT`/`ERR`/`DEBUG`/`RETURN`/`CHLD`.
pub fn trap_builtin(
    args: &[String],
    table: &mut TrapTable,
    signals: &crate::signal::SignalRouter,
    stdout: &mut dyn std::io::Write,
    stderr: &mut dyn std::io::Write,
) -> i32 {
    if args.is_empty() || (args.len() == 1 && args[0] == "-p") {
        for (event, action) in table.actions.iter() {
            if let TrapAction::Code(code) = action {
                let _ = writeln!(stdout, "trap -- '{code}' {}", event_name(*event));
            }
        }
        return 0;
    }

    let (action_text, specs) = (&args[0], &args[1..]);
    if specs.is_empty() {
        let _ = writeln!(stderr, "jsh: trap: usage: trap [-lp] [[arg] signal_spec ...]");
        return 2;
    }

    let action = if action_text == "-" {
        TrapAction::Unset
    } else if action_text.is_empty() {
        TrapAction::Ignore
    } else {
        TrapAction::Code(action_text.clone())
    };

    let mut exit_code = 0;
    for spec in specs {
        let Some(event) = parse_trap_event(spec) else {
            let _ = writeln!(stderr, "jsh: trap: {spec}: invalid signal specification");
            exit_code = 1;
            continue;
        };

        if let TrapEvent::Signal(signo) = event {
            #[cfg(unix)]
            {
                if signo == libc::SIGKILL || signo == libc::SIGSTOP {
                    let _ = writeln!(stderr, "jsh: trap: {spec}: cannot trap this signal");
                    exit_code = 1;
                    continue;
                }
            }
            match action {
                TrapAction::Code(_) => signals.install_for_trap(signo),
                TrapAction::Unset | TrapAction::Ignore => signals.restore_default(signo),
            }
        }

        table.set(event, action.clone());
    }
    exit_code
}

fn parse_trap_event(spec: &str) -> Option<TrapEvent> {
    match spec.to_ascii_uppercase().as_str() {
        "EXIT" | "0" => Some(TrapEvent::Exit),
        "ERR" => Some(TrapEvent::Err),
        "DEBUG" => Some(TrapEvent::Debug),
        "RETURN" => Some(TrapEvent::Return),
        "CHLD" => Some(TrapEvent::Chld),
        other => {
            if let Ok(n) = other.parse::<i32>() {
                return Some(TrapEvent::Signal(n));
            }
            #[cfg(unix)]
            {
                crate::jobbuiltins::parse_signal(other).map(TrapEvent::Signal)
            }
            #[cfg(not(unix))]
            {
                None
            }
        }
    }
}

fn event_name(event: TrapEvent) -> String {
    match event {
        TrapEvent::Exit => "EXIT".to_string(),
        TrapEvent::Err => "ERR".to_string(),
        TrapEvent::Debug => "DEBUG".to_string(),
        TrapEvent::Return => "RETURN".to_string(),
        TrapEvent::Chld => "CHLD".to_string(),
        TrapEvent::Signal(n) => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_signals_run_in_ascending_order() {
        let mut table = TrapTable::new();
        table.set(TrapEvent::Signal(15), TrapAction::Code("echo term".into()));
        table.set(TrapEvent::Signal(2), TrapAction::Code("echo int".into()));
        table.queue_signal(15);
        table.queue_signal(2);
        let pending = table.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, TrapEvent::Signal(2));
        assert_eq!(pending[1].0, TrapEvent::Signal(15));
    }

    #[test]
    fn exit_trap_fires_exactly_once() {
        let mut table = TrapTable::new();
        table.set(TrapEvent::Exit, TrapAction::Code("cleanup".into()));
        assert_eq!(table.take_exit_trap(), Some("cleanup".to_string()));
        assert_eq!(table.take_exit_trap(), None);
    }

    #[test]
    fn masked_signal_does_not_redeliver_while_running() {
        let mut table = TrapTable::new();
        table.set(TrapEvent::Signal(2), TrapAction::Code("echo int".into()));
        table.mark_running(TrapEvent::Signal(2));
        table.queue_signal(2);
        assert!(table.take_pending().is_empty());
        table.clear_running();
    }
}
