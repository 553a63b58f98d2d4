//! Line-at-a-time REPL. Each line is compiled and run against the same
//! persistent `Vm`, so `var`/`fun`/`class` declarations accumulate across
//! lines the way they would in a file. A `DefaultEditor`, `~/.lox_history`
//! persisted across sessions, and `ReadlineError::{Interrupted,Eof}` mapped
//! to "keep going" and "exit" respectively.

use lox_runtime::Vm;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "> ";

pub fn run(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Failed to start line editor: {e}");
            return;
        }
    };

    let history_path = dirs_history_path();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    println!("lox {}", env!("CARGO_PKG_VERSION"));
    println!("Ctrl-D to exit.");

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                crate::run_repl_line(vm, &line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
}

fn dirs_history_path() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(|home| std::path::PathBuf::from(home).join(".lox_history"))
}
