//! Shared surface between the `lox` binary and its integration tests: the
//! same `run_source`/`run_repl_line`/exit-code mapping the binary uses is
//! exercised directly here so tests don't have to spawn a subprocess.

pub mod config;
pub mod repl;

use lox_core::Value;
use lox_runtime::{InterpretOutcome, Vm};

/// `0` success, `65` compile error, `70` runtime error (`64` usage is
/// decided by `main` before any source is ever read).
pub fn exit_code_for(outcome: &InterpretOutcome) -> i32 {
    match outcome {
        InterpretOutcome::Ok => 0,
        InterpretOutcome::CompileError => 65,
        InterpretOutcome::RuntimeError => 70,
    }
}

/// Compile and run one chunk of source against a persistent `Vm`. Used by
/// the file runner; the REPL uses [`run_repl_line`] instead so a bare
/// expression's value gets echoed the way it does at a real Lox prompt.
pub fn run_source(vm: &mut Vm, source: &str) -> InterpretOutcome {
    match lox_compiler::compile(source, &mut vm.heap) {
        Ok(function) => vm.interpret(function).0,
        Err(_) => InterpretOutcome::CompileError,
    }
}

/// Compile and run one REPL line. A trailing bare expression (no `print`)
/// has its value rendered to stdout, the way a Lox prompt echoes the
/// result of whatever you just typed — everything else behaves like
/// `run_source`.
pub fn run_repl_line(vm: &mut Vm, source: &str) -> InterpretOutcome {
    match lox_compiler::compile_repl(source, &mut vm.heap) {
        Ok((function, leaves_value)) => {
            let (outcome, value) = vm.interpret(function);
            if leaves_value {
                if let (InterpretOutcome::Ok, Some(v)) = (&outcome, value) {
                    vm.print_value(v);
                }
            }
            outcome
        }
        Err(_) => InterpretOutcome::CompileError,
    }
}

/// Read and run a script file. A file that can't be read is reported as a
/// runtime error — the fixed `{0, 64, 65, 70}` exit-code palette has no
/// dedicated slot for I/O failure, and unlike a usage error this one
/// depends on the filesystem rather than the command line the user typed.
pub fn run_file(vm: &mut Vm, path: &std::path::Path) -> InterpretOutcome {
    match std::fs::read_to_string(path) {
        Ok(source) => run_source(vm, &source),
        Err(e) => {
            eprintln!("Can't open file \"{}\": {e}", path.display());
            InterpretOutcome::RuntimeError
        }
    }
}

/// Seconds since the Unix epoch, for the canonical `clock()` native.
fn clock_native(_args: &[Value]) -> Result<Value, String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::number(now.as_secs_f64()))
}

/// Install the native-function surface an embedder gets for free: just
/// `clock`, the canonical built-in every Lox implementation ships.
pub fn install_natives(vm: &mut Vm) {
    vm.define_native("clock", 0, clock_native);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_capture() -> (Vm, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        struct SharedBuf(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl std::io::Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let vm = Vm::with_stdout(Box::new(SharedBuf(buf.clone())));
        (vm, buf)
    }

    #[test]
    fn run_source_prints_and_reports_success() {
        let (mut vm, out) = vm_with_capture();
        let outcome = run_source(&mut vm, "print 1 + 2 * 3;");
        assert_eq!(exit_code_for(&outcome), 0);
        assert_eq!(&*out.borrow(), b"7.0\n");
    }

    #[test]
    fn run_source_maps_compile_errors_to_65() {
        let (mut vm, _out) = vm_with_capture();
        let outcome = run_source(&mut vm, "var = ;");
        assert_eq!(exit_code_for(&outcome), 65);
    }

    #[test]
    fn run_source_maps_runtime_errors_to_70() {
        let (mut vm, _out) = vm_with_capture();
        let outcome = run_source(&mut vm, "var x; x();");
        assert_eq!(exit_code_for(&outcome), 70);
    }

    #[test]
    fn vm_state_stays_usable_across_repl_style_calls() {
        let (mut vm, out) = vm_with_capture();
        assert_eq!(exit_code_for(&run_source(&mut vm, "var x = 1;")), 0);
        assert_eq!(exit_code_for(&run_source(&mut vm, "x = x + 1;")), 0);
        assert_eq!(exit_code_for(&run_source(&mut vm, "print x;")), 0);
        assert_eq!(&*out.borrow(), b"2.0\n");
    }

    #[test]
    fn clock_native_returns_a_number() {
        let (mut vm, out) = vm_with_capture();
        install_natives(&mut vm);
        let outcome = run_source(&mut vm, "print clock() >= 0.0;");
        assert_eq!(exit_code_for(&outcome), 0);
        assert_eq!(&*out.borrow(), b"true\n");
    }

    #[test]
    fn run_repl_line_echoes_a_bare_expression_result() {
        let (mut vm, out) = vm_with_capture();
        let outcome = run_repl_line(&mut vm, "1 + 2;");
        assert_eq!(exit_code_for(&outcome), 0);
        assert_eq!(&*out.borrow(), b"3.0\n");
    }

    #[test]
    fn run_repl_line_does_not_double_print_an_explicit_print_statement() {
        let (mut vm, out) = vm_with_capture();
        let outcome = run_repl_line(&mut vm, "print 1 + 2;");
        assert_eq!(exit_code_for(&outcome), 0);
        assert_eq!(&*out.borrow(), b"3.0\n");
    }

    #[test]
    fn run_repl_line_prints_nothing_for_a_declaration() {
        let (mut vm, out) = vm_with_capture();
        let outcome = run_repl_line(&mut vm, "var x = 1;");
        assert_eq!(exit_code_for(&outcome), 0);
        assert!(out.borrow().is_empty());
    }

    #[test]
    fn run_repl_line_keeps_echoing_across_calls_that_share_vm_state() {
        let (mut vm, out) = vm_with_capture();
        assert_eq!(exit_code_for(&run_repl_line(&mut vm, "var x = 1;")), 0);
        assert_eq!(exit_code_for(&run_repl_line(&mut vm, "x = x + 1;")), 0);
        assert_eq!(&*out.borrow(), b"2.0\n");
    }
}
