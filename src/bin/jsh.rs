use std::io::{self, Write};

use jsh_engine::context::ShellContext;
use jsh_engine::driver::Driver;
use jsh_engine::editor::{EDITOR_ACTIVE, LineEditor};
use jsh_engine::reference_parser;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    ctrlc::set_handler(|| {
        use std::sync::atomic::Ordering;
        if !EDITOR_ACTIVE.load(Ordering::Relaxed) {
            println!();
            let _ = io::stdout().flush();
        }
    })
    .expect("failed to install Ctrl-C handler");

    let interactive = io::IsTerminal::is_terminal(&io::stdin());
    let mut ctx = ShellContext::new(interactive, true);
    ctx.install_signal_handlers();

    let mut editor = LineEditor::new();
    let mut last_status = 0;
    let mut line_no: u32 = 0;

    loop {
        let chld_ready = ctx.reconcile_signals();
        run_pending_traps(&mut ctx);
        if chld_ready {
            run_chld_trap(&mut ctx);
        }

        let prompt = format!("jsh[{last_status}]> ");
        match editor.read_line(&prompt) {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_to_history(&line);
                line_no += 1;

                match reference_parser::parse_line(&line, line_no) {
                    Ok(Some(node)) => {
                        let mut driver = Driver {
                            options: &ctx.options,
                            job_table: &mut ctx.job_table,
                            arbiter: &ctx.arbiter,
                            traps: &mut ctx.traps,
                            signals: &ctx.signals,
                            functions: &mut ctx.functions,
                            call_stack: &mut ctx.call_stack,
                        };
                        last_status = driver.run_node(&node).status();
                    }
                    Ok(None) => {}
                    Err(msg) => {
                        eprintln!("{msg}");
                        last_status = 2;
                    }
                }
            }
            Ok(None) => {
                run_exit_trap(&mut ctx);
                break;
            }
            Err(e) => {
                eprintln!("jsh: {e}");
                break;
            }
        }
    }
}

fn run_pending_traps(ctx: &mut ShellContext) {
    for (event, code) in ctx.pending_traps() {
        ctx.traps.mark_running(event);
        if let Ok(Some(node)) = reference_parser::parse_line(&code, 0) {
            let mut driver = Driver {
                options: &ctx.options,
                job_table: &mut ctx.job_table,
                arbiter: &ctx.arbiter,
                traps: &mut ctx.traps,
                signals: &ctx.signals,
                functions: &mut ctx.functions,
                call_stack: &mut ctx.call_stack,
            };
            let _ = driver.run_node(&node);
        }
        ctx.traps.clear_running();
    }
}

/// `CHLD` trap (spec.md §4.8): fires once a background job's final member
/// has terminated, per the completion `reconcile_signals` just observed.
fn run_chld_trap(ctx: &mut ShellContext) {
    use jsh_engine::traps::TrapEvent;

    if ctx.traps.is_running(TrapEvent::Chld) {
        return;
    }
    let Some(code) = ctx.traps.chld_trap().map(str::to_string) else { return };
    ctx.traps.mark_running(TrapEvent::Chld);
    if let Ok(Some(node)) = reference_parser::parse_line(&code, 0) {
        let mut driver = Driver {
            options: &ctx.options,
            job_table: &mut ctx.job_table,
            arbiter: &ctx.arbiter,
            traps: &mut ctx.traps,
            signals: &ctx.signals,
            functions: &mut ctx.functions,
            call_stack: &mut ctx.call_stack,
        };
        let _ = driver.run_node(&node);
    }
    ctx.traps.clear_running();
}

fn run_exit_trap(ctx: &mut ShellContext) {
    if let Some(code) = ctx.traps.take_exit_trap() {
        if let Ok(Some(node)) = reference_parser::parse_line(&code, 0) {
            let mut driver = Driver {
                options: &ctx.options,
                job_table: &mut ctx.job_table,
                arbiter: &ctx.arbiter,
                traps: &mut ctx.traps,
                signals: &ctx.signals,
                functions: &mut ctx.functions,
                call_stack: &mut ctx.call_stack,
            };
            let _ = driver.run_node(&node);
        }
    }
}
