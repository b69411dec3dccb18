//! Interactive yes/no confirmation.

use std::io::{self, BufRead, Write};

/// Asks `question` on stdout and reads the answer from stdin.
pub fn confirm(question: &str) -> io::Result<bool> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    confirm_with(question, stdin.lock(), stdout.lock())
}

/// Asks `question` on `output` and reads one answer line from `input`.
///
/// `y`, `yes` and `1` (case-insensitive) confirm; anything else, including
/// end of input, declines.
pub fn confirm_with<R: BufRead, W: Write>(
    question: &str,
    mut input: R,
    mut output: W,
) -> io::Result<bool> {
    write!(output, "{question} (y/N): ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;

    Ok(matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes" | "1"
    ))
}
