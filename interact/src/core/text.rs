//! Text helpers for student-facing feedback.

/// Appended when [`truncate_text`] drops anything.
pub const TRUNCATION_MARKER: &str = "\n---Remaining text truncated---";

/// Limit `text` to `max_lines` lines and then `max_chars` characters.
pub fn truncate_text(text: &str, max_lines: usize, max_chars: usize) -> String {
    let mut truncated = false;

    let mut kept = text.to_string();
    if text.lines().count() > max_lines {
        kept = text.lines().take(max_lines).collect::<Vec<_>>().join("\n");
        truncated = true;
    }

    if kept.chars().count() > max_chars {
        kept = kept.chars().take(max_chars).collect();
        truncated = true;
    }

    if truncated {
        kept.push_str(TRUNCATION_MARKER);
    }
    kept
}

/// Join items into a readable list: `a`, `a and b`, `a, b, and c`.
pub fn pretty_list<S: AsRef<str>>(items: &[S], conjunction: &str, none: &str) -> String {
    match items {
        [] => none.to_string(),
        [only] => only.as_ref().to_string(),
        [first, second] => format!("{} {conjunction} {}", first.as_ref(), second.as_ref()),
        [init @ .., last] => {
            let head = init.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ");
            format!("{head}, {conjunction} {}", last.as_ref())
        }
    }
}

/// Format a command for display. Not suitable for passing to a shell.
pub fn display_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| display_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn display_arg(arg: &str) -> String {
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    if escaped.contains(' ') {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}
