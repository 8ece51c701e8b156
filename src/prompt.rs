use std::io::{self, BufRead, Write};

/// Asks a yes/no question. Only `e`, `y` and `yes` (any case) confirm;
/// end of input declines.
pub fn confirm(question: &str, input: &mut impl BufRead, out: &mut impl Write) -> io::Result<bool> {
    write!(out, "{question} [y/N]: ")?;
    out.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(false);
    }
    let answer = line.trim().to_ascii_lowercase();
    Ok(matches!(answer.as_str(), "e" | "y" | "yes"))
}
