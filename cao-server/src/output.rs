//! Pane-text post-processing: ANSI stripping, line normalization, completion
//! markers, and result extraction.
//!
//! Markers are per-terminal *and* per-injection: `[cao-done <id>.<seq>]`.
//! The id keeps one terminal's marker from being attributed to another; the
//! sequence number keeps a stale marker from an earlier turn from satisfying
//! a later turn's readback. A marker only counts when it is the entire
//! (trimmed) content of a pane line, so the echoed instruction text — which
//! embeds the marker in surrounding prose — never matches.

use regex::Regex;

/// Fragment of the injected sentinel instruction, used to locate the echo of
/// the injection when extracting the task result.
pub const SUFFIX_FRAGMENT: &str = "on a line by itself";

pub fn completion_marker(terminal_id: &str, seq: u64) -> String {
    format!("[cao-done {terminal_id}.{seq}]")
}

pub fn error_marker(terminal_id: &str, seq: u64) -> String {
    format!("[cao-fail {terminal_id}.{seq}]")
}

/// The sentinel suffix appended to an injected task body.
pub fn marker_suffix(terminal_id: &str, seq: u64) -> String {
    format!(
        "When you are done, print {done} {SUFFIX_FRAGMENT}. If you could not complete the task, print {fail} {SUFFIX_FRAGMENT} instead.",
        done = completion_marker(terminal_id, seq),
        fail = error_marker(terminal_id, seq),
    )
}

/// Strip ANSI escape sequences (CSI, OSC, charset selection) so pattern
/// matching sees what a human sees.
pub fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: parameters end at the first alphabetic final byte.
            Some('[') => {
                chars.next();
                while let Some(&nc) = chars.peek() {
                    chars.next();
                    if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC-backslash.
            Some(']') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc == '\x07' {
                        break;
                    }
                    if nc == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Charset selection takes one designator byte.
            Some('(' | ')' | '*' | '+') => {
                chars.next();
                chars.next();
            }
            Some(c) if *c >= '0' && *c <= '~' => {
                chars.next();
            }
            _ => {}
        }
    }
    result
}

/// Collapse CRLF and stray carriage returns into plain newlines.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Byte offset of the start of the *last* pane line whose trimmed content is
/// exactly `marker`. Later-positioned markers win tie-breaks, so callers
/// compare offsets directly.
pub fn find_marker_line(clean: &str, marker: &str) -> Option<usize> {
    let mut found = None;
    let mut offset = 0;
    for line in clean.split('\n') {
        if line.trim() == marker {
            found = Some(offset);
        }
        offset += line.len() + 1;
    }
    found
}

/// Extract the task result: the text between the echo of the injected
/// sentinel instruction and the completion marker line.
pub fn extract_task_result(clean: &str, done_marker: &str) -> String {
    let lines: Vec<&str> = clean.split('\n').collect();
    let Some(marker_idx) = lines.iter().rposition(|l| l.trim() == done_marker) else {
        return String::new();
    };
    let start = lines[..marker_idx]
        .iter()
        .rposition(|l| l.contains(SUFFIX_FRAGMENT))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    lines[start..marker_idx].join("\n").trim().to_string()
}

/// Extract the agent's most recent message: the content between the last two
/// ready-prompt lines (or everything before the last one).
pub fn extract_last_message(clean: &str, ready: &Regex) -> Option<String> {
    let lines: Vec<&str> = clean.split('\n').collect();
    let prompt_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| ready.is_match(line))
        .map(|(idx, _)| idx)
        .collect();

    let last = *prompt_lines.last()?;
    let start = prompt_lines
        .iter()
        .rev()
        .find(|&&idx| idx < last)
        .map(|&idx| idx + 1)
        .unwrap_or(0);

    let message = lines[start..last].join("\n").trim().to_string();
    if message.is_empty() {
        None
    } else {
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::{
        completion_marker, error_marker, extract_last_message, extract_task_result,
        find_marker_line, marker_suffix, normalize_line_endings, strip_ansi,
    };

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mgreen\x1b[0m text"), "green text");
    }

    #[test]
    fn strips_osc_title_sequences() {
        assert_eq!(strip_ansi("\x1b]0;window title\x07done"), "done");
    }

    #[test]
    fn normalizes_crlf() {
        assert_eq!(normalize_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn marker_matches_only_exact_lines() {
        let marker = completion_marker("ab12cd34", 1);
        let pane = format!(
            "When you are done, print {marker} on a line by itself.\nworking...\n{marker}\n> "
        );
        let offset = find_marker_line(&pane, &marker).unwrap();
        // The hit is the bare marker line, not the instruction echo.
        assert!(pane[offset..].starts_with(&marker));
        assert!(offset > 0);
    }

    #[test]
    fn marker_in_instruction_echo_alone_is_not_a_hit() {
        let marker = completion_marker("ab12cd34", 1);
        let pane = format!("When you are done, print {marker} on a line by itself.\nworking...");
        assert_eq!(find_marker_line(&pane, &marker), None);
    }

    #[test]
    fn later_marker_wins_tie_break() {
        let done = completion_marker("t1", 3);
        let fail = error_marker("t1", 3);
        let pane = format!("{fail}\nsome recovery output\n{done}\n");
        let done_at = find_marker_line(&pane, &done).unwrap();
        let fail_at = find_marker_line(&pane, &fail).unwrap();
        assert!(done_at > fail_at);
    }

    #[test]
    fn extracts_result_between_injection_and_marker() {
        let id = "ab12cd34";
        let marker = completion_marker(id, 1);
        let pane = format!(
            "> review the diff\n{}\nThe diff looks correct.\nOne nit: missing test.\n{marker}\n> ",
            marker_suffix(id, 1)
        );
        assert_eq!(
            extract_task_result(&pane, &marker),
            "The diff looks correct.\nOne nit: missing test."
        );
    }

    #[test]
    fn extract_result_without_marker_is_empty() {
        assert_eq!(extract_task_result("no markers here", "[cao-done x.1]"), "");
    }

    #[test]
    fn extracts_last_message_between_prompts() {
        let ready = Regex::new(r"(?m)^\s*>\s*$").unwrap();
        let pane = "> \nfirst answer\n> \nsecond answer\nspanning lines\n> ";
        assert_eq!(
            extract_last_message(pane, &ready).unwrap(),
            "second answer\nspanning lines"
        );
    }

    #[test]
    fn extract_last_message_requires_a_prompt() {
        let ready = Regex::new(r"(?m)^\s*>\s*$").unwrap();
        assert!(extract_last_message("still streaming output", &ready).is_none());
    }
}
