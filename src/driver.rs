//! Control-Flow Driver (spec.md §4.6): walks a parsed tree and returns an
//! exit status.
//!
//! Re-architected per spec.md §9 to carry `break`/`continue`/`return`/`exit`
//! as an explicit sum type threaded through return values, rather than the
//! original's process-wide `req_break`/`req_continue`/`return_set` counters
//! (`original_source/src/shell_cmds.c`'s `break`/`continue`/`return`
//! builtins write three separate globals that every loop driver then has to
//! remember to check and clear — easy to get wrong, and not thread-portable
//! if the shell ever grew worker threads). A `match` on one enum can't be
//! left half-handled the way three independent globals can.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{CaseArm, ChainEntry, Connector, Node, NodeKind};
use crate::dispatch::{self, EngineServices};
use crate::jobs::JobTable;
use crate::pipeline::{self, PipelineOutcome, PipelineSettings};
use crate::signal::SignalRouter;
use crate::terminal::TerminalArbiter;
use crate::traps::{TrapEvent, TrapTable};

/// Defined-function bodies, keyed by name (spec.md §4.5 "defined function"
/// classification). Stored as `Rc` since invoking a function walks the same
/// body recursively without needing to clone the tree.
pub type FunctionTable = HashMap<String, Rc<Vec<Node>>>;

/// One entry of the call-frame stack (spec.md §3): the information `caller`
/// and error messages report for an active function invocation.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub function_name: String,
    pub source_name: String,
    pub line: u32,
}

/// Out-of-band control transfer a compound command may propagate upward
/// (spec.md §4.6 "break/continue/return are propagated out-of-band").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep walking; the attached code is the most recent command's exit
    /// status, threaded as `$?`.
    Normal(i32),
    /// `break n`: unwind through `n` nested loops. Decremented by each loop
    /// level it passes through; becomes `Normal` once it reaches 0.
    Break(u32),
    Continue(u32),
    /// `return n` inside a function or dot-script.
    Return(i32),
    /// `exit n`: unwinds all the way to the top-level driver.
    Exit(i32),
}

impl ControlFlow {
    pub fn status(self) -> i32 {
        match self {
            ControlFlow::Normal(code) => code,
            ControlFlow::Break(_) | ControlFlow::Continue(_) => 0,
            ControlFlow::Return(code) | ControlFlow::Exit(code) => code,
        }
    }

    fn is_loop_escape(self) -> bool {
        matches!(self, ControlFlow::Break(_) | ControlFlow::Continue(_))
    }

    fn is_unwind(self) -> bool {
        matches!(self, ControlFlow::Return(_) | ControlFlow::Exit(_))
    }
}

pub struct DriverOptions {
    pub errexit: bool,
    pub pipefail: bool,
    pub job_control: bool,
    pub lastpipe: bool,
    /// `-r`: spec.md §4.5 "Restricted-shell policy", enforced by the
    /// dispatcher at the point it classifies and spawns a command.
    pub restricted: bool,
}

pub struct Driver<'a> {
    pub options: &'a DriverOptions,
    pub job_table: &'a mut JobTable,
    pub arbiter: &'a TerminalArbiter,
    pub traps: &'a mut TrapTable,
    pub signals: &'a SignalRouter,
    pub functions: &'a mut FunctionTable,
    pub call_stack: &'a mut Vec<CallFrame>,
}


impl<'a> Driver<'a> {
    /// Evaluate a list of sibling statements (spec.md §4.6 "List").
    pub fn run_list(&mut self, nodes: &[Node]) -> ControlFlow {
        let mut last = ControlFlow::Normal(0);
        for node in nodes {
            last = self.run_node(node);
            if last.is_loop_escape() || last.is_unwind() {
                return last;
            }
        }
        last
    }

    pub fn run_node(&mut self, node: &Node) -> ControlFlow {
        match &node.kind {
            NodeKind::List(nodes) => self.run_list(nodes),
            NodeKind::AndOrList { chain, background } => self.run_and_or(chain, *background, node.line),
            NodeKind::BraceGroup(body) => self.run_list(body),
            NodeKind::Subshell(body) => self.run_subshell(body),
            NodeKind::If { branches, else_branch } => self.run_if(branches, else_branch.as_deref()),
            NodeKind::While { cond, body } => self.run_while(cond, body, false),
            NodeKind::Until { cond, body } => self.run_while(cond, body, true),
            NodeKind::For { var, words, body } => self.run_for(var, words, body),
            NodeKind::Case { subject, arms } => self.run_case(subject, arms),
            NodeKind::Select { var, words, body } => self.run_select(var, words, body),
            NodeKind::FunctionDef { name, body } => {
                self.functions.insert(name.clone(), body.clone());
                ControlFlow::Normal(0)
            }
        }
    }

    /// AND-OR list (spec.md §4.6): left to right, gated on `&&`/`||`;
    /// `-e` aborts iff the last pipeline of the list fails uninverted.
    fn run_and_or(&mut self, chain: &[ChainEntry], background: bool, line: u32) -> ControlFlow {
        if background {
            // spec.md §4.6 "a trailing & ... causes the driver to fork a
            // subshell that executes the sublist and exits with its
            // status" — modeled here as a background pipeline per entry,
            // since this crate's pipeline builder already owns backgrounding.
            let mut last = 0;
            for entry in chain {
                let settings = PipelineSettings {
                    background: true,
                    pipefail: self.options.pipefail,
                    lastpipe: false,
                    job_control: self.options.job_control,
                    restricted: self.options.restricted,
                    last_status: last,
                    line,
                };
                let text = describe_pipeline(entry);
                let mut services = EngineServices {
                    arbiter: self.arbiter,
                    traps: &mut *self.traps,
                    signals: self.signals,
                    options: self.options,
                    functions: &mut *self.functions,
                    call_stack: &mut *self.call_stack,
                };
                match pipeline::run(&entry.pipeline, &text, &settings, self.job_table, self.arbiter, &mut services) {
                    PipelineOutcome::Status(code) => last = code,
                    PipelineOutcome::Stopped { .. } => last = 0,
                }
            }
            return ControlFlow::Normal(last);
        }

        let mut status = 0;
        let mut idx = 0;
        while idx < chain.len() {
            let entry = &chain[idx];

            // spec.md §4.8 "DEBUG fires before each simple command": each
            // AND-OR entry is one pipeline, the finest granularity the
            // driver itself sees (per-stage firing for multi-stage
            // pipelines lives closer to where stages actually run).
            self.fire_trap(TrapEvent::Debug);

            if let Some(flow) = self.try_control_builtin(entry, status) {
                return flow;
            }

            let settings = PipelineSettings {
                background: false,
                pipefail: self.options.pipefail,
                lastpipe: self.options.lastpipe,
                job_control: self.options.job_control,
                restricted: self.options.restricted,
                last_status: status,
                line,
            };
            let text = describe_pipeline(entry);
            let mut services = EngineServices {
                arbiter: self.arbiter,
                traps: &mut *self.traps,
                signals: self.signals,
                options: self.options,
                functions: &mut *self.functions,
                call_stack: &mut *self.call_stack,
            };
            status = match pipeline::run(&entry.pipeline, &text, &settings, self.job_table, self.arbiter, &mut services) {
                PipelineOutcome::Status(code) => code,
                PipelineOutcome::Stopped { .. } => 0,
            };

            // spec.md §4.8 "ERR fires on non-zero uninverted status": not for
            // a command gated into a further `&&`/`||` (only the entry whose
            // own connector is `;`/end-of-chain reports its failure), and not
            // for a negated (`!`) pipeline.
            if !entry.pipeline.negate && status != 0 && matches!(entry.connector, Connector::Sequence) {
                self.fire_trap(TrapEvent::Err);
            }

            // Skip forward past entries whose connector doesn't license
            // execution, mirroring bash's left-to-right short-circuit.
            idx += 1;
            while idx < chain.len() {
                let gate = chain[idx - 1].connector;
                let should_skip = match gate {
                    Connector::And => status != 0,
                    Connector::Or => status == 0,
                    Connector::Sequence => false,
                };
                if !should_skip || matches!(chain[idx].connector, Connector::Sequence) {
                    break;
                }
                idx += 1;
            }
        }

        if self.options.errexit && status != 0 {
            return ControlFlow::Exit(status);
        }

        ControlFlow::Normal(status)
    }

    /// Run a list as an `if`/`while`/`until` test clause: a failing command
    /// here doesn't fire `ERR` (spec.md §4.8), implemented by borrowing the
    /// same re-entrancy guard that already masks a trap body from
    /// retriggering itself while it runs.
    fn run_test_list(&mut self, nodes: &[Node]) -> ControlFlow {
        let already_masked = self.traps.is_running(TrapEvent::Err);
        if !already_masked {
            self.traps.mark_running(TrapEvent::Err);
        }
        let flow = self.run_list(nodes);
        if !already_masked {
            self.traps.clear_running();
        }
        flow
    }

    /// Run a pseudo-event trap's handler if one is set and not already
    /// running (spec.md §4.8's recursion guard applied to `DEBUG`/`ERR`/
    /// `RETURN`/`CHLD` the same way `take_pending` applies it to signals).
    fn fire_trap(&mut self, event: TrapEvent) {
        if self.traps.is_running(event) {
            return;
        }
        let code = match event {
            TrapEvent::Debug => self.traps.debug_trap(),
            TrapEvent::Err => self.traps.err_trap(),
            TrapEvent::Return => self.traps.return_trap(),
            TrapEvent::Chld => self.traps.chld_trap(),
            TrapEvent::Exit | TrapEvent::Signal(_) => None,
        }
        .map(str::to_string);
        let Some(code) = code else { return };

        self.traps.mark_running(event);
        if let Ok(Some(node)) = crate::reference_parser::parse_line(&code, 0) {
            let _ = self.run_node(&node);
        }
        self.traps.clear_running();
    }

    /// `break`/`continue`/`return` need the `ControlFlow` value itself —
    /// unlike every other simple command they don't just produce an exit
    /// status, they unwind. Intercepted here, ahead of the pipeline
    /// builder, rather than threaded through `SimpleOutcome` (spec.md §4.6
    /// "propagated out-of-band").
    fn try_control_builtin(&self, entry: &ChainEntry, last_status: i32) -> Option<ControlFlow> {
        if entry.pipeline.negate || entry.pipeline.stages.len() != 1 {
            return None;
        }
        let stage = &entry.pipeline.stages[0];
        let words = crate::expand::expand_argv(&stage.words, last_status);
        let name = words.first()?.as_str();
        let n = words.get(1).and_then(|s| s.parse::<u32>().ok()).unwrap_or(1).max(1);
        let status_arg = || words.get(1).and_then(|s| s.parse::<i32>().ok()).unwrap_or(0) & 0xff;

        match name {
            "break" => Some(ControlFlow::Break(n)),
            "continue" => Some(ControlFlow::Continue(n)),
            "return" => Some(ControlFlow::Return(status_arg())),
            "exit" => Some(ControlFlow::Exit(status_arg())),
            _ => None,
        }
    }

    /// Subshell (spec.md §4.6 "fork; child runs ... with a re-initialised
    /// signal/job state (§4.6a)"). The actual fork/wait mechanics are the
    /// spawner's; here we only apply the re-initialisation contract to a
    /// freshly derived driver state before walking the body.
    fn run_subshell(&mut self, body: &[Node]) -> ControlFlow {
        let mut sub_options = DriverOptions {
            errexit: self.options.errexit,
            pipefail: self.options.pipefail,
            job_control: false, // §4.6a "clears job control"
            lastpipe: self.options.lastpipe,
            restricted: self.options.restricted,
        };
        let mut sub_table = JobTable::new();
        // spec.md §3 "Traps inherit into subshells by default"; §4.6a resets
        // DEBUG/RETURN/ERR unless functrace/errtrace is set (not modeled
        // separately here, so always reset — matches the common case).
        let mut sub_traps = self.traps.clone();
        sub_traps.reset_for_subshell(false);
        // spec.md §4.6a: a fork duplicates the address space, so functions
        // already defined in the parent are visible; ones the subshell
        // defines itself vanish with the child when it exits.
        let mut sub_functions = self.functions.clone();
        let mut sub_call_stack = self.call_stack.clone();
        let mut sub = Driver {
            options: &mut sub_options,
            job_table: &mut sub_table,
            arbiter: self.arbiter,
            traps: &mut sub_traps,
            signals: self.signals,
            functions: &mut sub_functions,
            call_stack: &mut sub_call_stack,
        };
        sub.run_list(body)
    }

    fn run_if(&mut self, branches: &[(Vec<Node>, Vec<Node>)], else_branch: Option<&[Node]>) -> ControlFlow {
        for (cond, body) in branches {
            let cond_flow = self.run_test_list(cond);
            if cond_flow.is_unwind() || cond_flow.is_loop_escape() {
                return cond_flow;
            }
            if cond_flow.status() == 0 {
                return self.run_list(body);
            }
        }
        match else_branch {
            Some(body) => self.run_list(body),
            None => ControlFlow::Normal(0),
        }
    }

    fn run_while(&mut self, cond: &[Node], body: &[Node], until: bool) -> ControlFlow {
        loop {
            let cond_flow = self.run_test_list(cond);
            if cond_flow.is_unwind() {
                return cond_flow;
            }
            let cond_true = cond_flow.status() == 0;
            let should_run = if until { !cond_true } else { cond_true };
            if !should_run {
                return ControlFlow::Normal(0);
            }

            self.fire_trap(TrapEvent::Debug);
            match self.run_list(body) {
                ControlFlow::Break(n) if n <= 1 => return ControlFlow::Normal(0),
                ControlFlow::Break(n) => return ControlFlow::Break(n - 1),
                ControlFlow::Continue(n) if n <= 1 => continue,
                ControlFlow::Continue(n) => return ControlFlow::Continue(n - 1),
                flow @ (ControlFlow::Return(_) | ControlFlow::Exit(_)) => return flow,
                ControlFlow::Normal(_) => continue,
            }
        }
    }

    fn run_for(&mut self, var: &str, words: &[crate::ast::Word], body: &[Node]) -> ControlFlow {
        for word in words {
            let value = crate::expand::expand_word_single(word, 0);
            // SAFETY: single-threaded driver loop; no concurrent env readers.
            unsafe { std::env::set_var(var, &value) };
            self.fire_trap(TrapEvent::Debug);
            match self.run_list(body) {
                ControlFlow::Break(n) if n <= 1 => return ControlFlow::Normal(0),
                ControlFlow::Break(n) => return ControlFlow::Break(n - 1),
                ControlFlow::Continue(n) if n <= 1 => continue,
                ControlFlow::Continue(n) => return ControlFlow::Continue(n - 1),
                flow @ (ControlFlow::Return(_) | ControlFlow::Exit(_)) => return flow,
                ControlFlow::Normal(_) => continue,
            }
        }
        ControlFlow::Normal(0)
    }

    /// `case` (spec.md §4.6): first arm whose pattern list matches the
    /// (unquoted-glob-style) subject wins; no fallthrough between arms.
    fn run_case(&mut self, subject: &crate::ast::Word, arms: &[CaseArm]) -> ControlFlow {
        let value = crate::expand::expand_word_single(subject, 0);
        for arm in arms {
            let matched = arm.patterns.iter().any(|pat| {
                let text = crate::expand::expand_word_single(pat, 0);
                glob::Pattern::new(&text).map(|p| p.matches(&value)).unwrap_or_else(|_| text == value)
            });
            if matched {
                self.fire_trap(TrapEvent::Debug);
                return self.run_list(&arm.body);
            }
        }
        ControlFlow::Normal(0)
    }

    /// `select` (spec.md §4.6): prints a numbered menu to stderr, reads one
    /// line from stdin, binds it to `var` as-typed and the chosen word to
    /// `REPLY`, then loops until stdin is exhausted or the body breaks out.
    fn run_select(&mut self, var: &str, words: &[crate::ast::Word], body: &[Node]) -> ControlFlow {
        let choices: Vec<String> = words.iter().map(|w| crate::expand::expand_word_single(w, 0)).collect();
        if choices.is_empty() {
            return ControlFlow::Normal(0);
        }

        loop {
            for (idx, choice) in choices.iter().enumerate() {
                eprintln!("{}) {choice}", idx + 1);
            }
            eprint!("#? ");

            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                return ControlFlow::Normal(0);
            }
            let typed = line.trim();

            let chosen = typed
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| choices.get(idx))
                .cloned()
                .unwrap_or_default();

            // SAFETY: single-threaded driver loop; no concurrent env readers.
            unsafe {
                std::env::set_var(var, &chosen);
                std::env::set_var("REPLY", typed);
            }

            self.fire_trap(TrapEvent::Debug);
            match self.run_list(body) {
                ControlFlow::Break(n) if n <= 1 => return ControlFlow::Normal(0),
                ControlFlow::Break(n) => return ControlFlow::Break(n - 1),
                ControlFlow::Continue(n) if n <= 1 => continue,
                ControlFlow::Continue(n) => return ControlFlow::Continue(n - 1),
                flow @ (ControlFlow::Return(_) | ControlFlow::Exit(_)) => return flow,
                ControlFlow::Normal(_) => continue,
            }
        }
    }
}

/// Fire a pseudo-event trap from a call site that only holds an
/// `EngineServices` borrow, not a live `Driver` — the dispatcher's function-
/// call path uses this for the `RETURN` trap (spec.md §4.8 "fires when a
/// function ... returns"), building a throwaway `Driver` over the same
/// borrowed state purely to run the trap's shell-code.
pub fn fire_trap_via_services(
    event: TrapEvent,
    job_table: &mut JobTable,
    services: &mut EngineServices<'_>,
) {
    let mut driver = Driver {
        options: services.options,
        job_table,
        arbiter: services.arbiter,
        traps: &mut *services.traps,
        signals: services.signals,
        functions: &mut *services.functions,
        call_stack: &mut *services.call_stack,
    };
    driver.fire_trap(event);
}

fn describe_pipeline(entry: &ChainEntry) -> String {
    entry
        .pipeline
        .stages
        .iter()
        .map(|stage| {
            stage
                .words
                .first()
                .map(dispatch::expand_word_stub)
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_decrements_through_nesting() {
        assert_eq!(ControlFlow::Break(2).status(), 0);
    }

    #[test]
    fn exit_and_return_carry_their_status() {
        assert_eq!(ControlFlow::Exit(7).status(), 7);
        assert_eq!(ControlFlow::Return(3).status(), 3);
    }

    fn literal_word(s: &str) -> crate::ast::Word {
        vec![crate::ast::WordSegment::Unquoted(s.to_string())]
    }

    fn test_driver() -> (DriverOptions, JobTable, TerminalArbiter, TrapTable, SignalRouter, FunctionTable, Vec<CallFrame>) {
        let options = DriverOptions {
            errexit: false,
            pipefail: false,
            job_control: false,
            lastpipe: false,
            restricted: false,
        };
        (
            options,
            JobTable::new(),
            TerminalArbiter::new(false),
            TrapTable::new(),
            SignalRouter::new(crate::signal::Interactivity::NonInteractive, false),
            FunctionTable::new(),
            Vec::new(),
        )
    }

    #[test]
    fn case_runs_first_matching_arm_only() {
        let (options, mut jobs, arbiter, mut traps, signals, mut functions, mut call_stack) = test_driver();
        let mut driver = Driver {
            options: &options,
            job_table: &mut jobs,
            arbiter: &arbiter,
            traps: &mut traps,
            signals: &signals,
            functions: &mut functions,
            call_stack: &mut call_stack,
        };

        let arms = vec![
            CaseArm { patterns: vec![literal_word("foo")], body: vec![] },
            CaseArm { patterns: vec![literal_word("ba*")], body: vec![] },
        ];
        let flow = driver.run_case(&literal_word("bar"), &arms);
        assert_eq!(flow, ControlFlow::Normal(0));
    }

    #[test]
    fn case_falls_through_to_no_match() {
        let (options, mut jobs, arbiter, mut traps, signals, mut functions, mut call_stack) = test_driver();
        let mut driver = Driver {
            options: &options,
            job_table: &mut jobs,
            arbiter: &arbiter,
            traps: &mut traps,
            signals: &signals,
            functions: &mut functions,
            call_stack: &mut call_stack,
        };

        let arms = vec![CaseArm { patterns: vec![literal_word("zzz")], body: vec![] }];
        let flow = driver.run_case(&literal_word("bar"), &arms);
        assert_eq!(flow, ControlFlow::Normal(0));
    }

    #[test]
    fn function_def_registers_body_without_running_it() {
        let (options, mut jobs, arbiter, mut traps, signals, mut functions, mut call_stack) = test_driver();
        let mut driver = Driver {
            options: &options,
            job_table: &mut jobs,
            arbiter: &arbiter,
            traps: &mut traps,
            signals: &signals,
            functions: &mut functions,
            call_stack: &mut call_stack,
        };

        let body = Rc::new(vec![Node::new(NodeKind::List(vec![]), 1)]);
        let node = Node::new(NodeKind::FunctionDef { name: "greet".to_string(), body: body.clone() }, 1);
        let flow = driver.run_node(&node);
        assert_eq!(flow, ControlFlow::Normal(0));
        assert!(driver.functions.contains_key("greet"));
    }
}
