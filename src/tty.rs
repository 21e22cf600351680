//! Terminal helpers for the CLI.

use std::io::{self, IsTerminal};

/// Print status message to stderr if running in a terminal.
pub fn status(message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("{}", message);
    }
}

/// Stream a transcript line to stderr while a long command runs.
pub fn progress(label: &str, message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("[{}] {}", label, message);
    }
}
