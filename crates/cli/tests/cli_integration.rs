//! Black-box-ish integration suite: compiles and runs each fixture in
//! `tests/fixtures/*.lox` against a fresh `Vm` and checks its captured
//! stdout against the file's `//> ` trailer lines, one expected line per
//! trailer comment. A discover-then-compare harness simplified to a single
//! expected-stdout block per file since Lox has no in-language test
//! keyword.

use lox_cli::exit_code_for;
use lox_runtime::Vm;
use std::fs;
use std::io::Write;
use std::path::Path;

struct CapturingWriter(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

impl Write for CapturingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn parse_fixture(source: &str) -> (String, String) {
    let mut program_lines = Vec::new();
    let mut expected_lines = Vec::new();
    for line in source.lines() {
        match line.strip_prefix("//> ") {
            Some(expected) => expected_lines.push(expected.to_string()),
            None => program_lines.push(line),
        }
    }
    let mut expected = expected_lines.join("\n");
    if !expected.is_empty() {
        expected.push('\n');
    }
    (program_lines.join("\n"), expected)
}

fn run_fixture(path: &Path) {
    let source = fs::read_to_string(path).expect("fixture should be readable");
    let (program, expected_stdout) = parse_fixture(&source);

    let captured = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut vm = Vm::with_stdout(Box::new(CapturingWriter(captured.clone())));

    let outcome = lox_cli::run_source(&mut vm, &program);
    assert_eq!(
        exit_code_for(&outcome),
        0,
        "fixture {} should run to completion",
        path.display()
    );

    let actual = String::from_utf8(captured.borrow().clone()).expect("stdout should be utf-8");
    assert_eq!(actual, expected_stdout, "fixture {} stdout mismatch", path.display());
}

fn fixtures_dir() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

#[test]
fn all_fixtures_match_their_expected_stdout() {
    let dir = fixtures_dir();
    let mut ran = 0;
    for entry in fs::read_dir(&dir).expect("fixtures directory should exist") {
        let entry = entry.expect("fixture directory entry should be readable");
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "lox") {
            run_fixture(&path);
            ran += 1;
        }
    }
    assert!(ran >= 5, "expected at least 5 fixtures, found {ran}");
}

#[test]
fn calling_a_non_callable_is_a_runtime_error_with_code_70() {
    let mut vm = Vm::new();
    let outcome = lox_cli::run_source(&mut vm, "var x; x();");
    assert_eq!(exit_code_for(&outcome), 70);
}

#[test]
fn a_syntax_error_is_a_compile_error_with_code_65() {
    let mut vm = Vm::new();
    let outcome = lox_cli::run_source(&mut vm, "var = ;");
    assert_eq!(exit_code_for(&outcome), 65);
}

#[test]
fn run_file_reads_and_executes_a_real_script_on_disk() {
    let mut script = tempfile::NamedTempFile::new().expect("should create a temp file");
    writeln!(script, "print 1 + 1;").expect("should write to temp file");

    let mut vm = Vm::new();
    let outcome = lox_cli::run_file(&mut vm, script.path());
    assert_eq!(exit_code_for(&outcome), 0);
}

#[test]
fn run_file_reports_a_missing_path_as_a_runtime_error() {
    let mut vm = Vm::new();
    let missing = Path::new("/nonexistent/does-not-exist.lox");
    let outcome = lox_cli::run_file(&mut vm, missing);
    assert_eq!(exit_code_for(&outcome), 70);
}
