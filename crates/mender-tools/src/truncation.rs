//! Output truncation for gate findings and fixer prompts.

use std::sync::OnceLock;

use regex::Regex;

/// How to truncate output that exceeds the maximum character limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    /// Keep first 40% and last 60%, with a marker in the middle.
    HeadTail,
    /// Keep last `max_chars`, with a marker at the start.
    Tail,
}

/// Largest char boundary in `s` that is `<= idx`.
fn floor_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary in `s` that is `>= idx`.
fn ceil_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Truncate `output` to roughly `max_chars` bytes using the given mode.
///
/// If the output is within the limit, it is returned unchanged.
/// Otherwise a warning marker is inserted indicating how many characters were removed.
pub fn truncate_output(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }

    match mode {
        TruncationMode::HeadTail => {
            let head_end = floor_boundary(output, max_chars * 40 / 100);
            let tail_start = ceil_boundary(output, output.len() - (max_chars - max_chars * 40 / 100));
            let removed = tail_start - head_end;
            format!(
                "{}\n[WARNING: Output truncated. {} characters removed from middle]\n{}",
                &output[..head_end],
                removed,
                &output[tail_start..]
            )
        }
        TruncationMode::Tail => {
            let tail_start = ceil_boundary(output, output.len() - max_chars);
            format!(
                "\n[WARNING: Output truncated. {} characters removed from start]\n{}",
                tail_start,
                &output[tail_start..]
            )
        }
    }
}

fn diagnostic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(^\s*(error|warning)(\[[A-Z0-9]+\])?:|^\s*-->|^\s*help:|^\s*\|\s|panicked at|\.\.\. FAILED|(?i:vulnerab))")
            .expect("diagnostic pattern is a valid regex")
    })
}

/// Pick the lines of compiler/test/linter output that carry a diagnosis.
///
/// Returns at most `max_lines` lines. Empty when nothing matched.
pub fn extract_diagnostics(output: &str, max_lines: usize) -> Vec<String> {
    output
        .lines()
        .filter(|line| diagnostic_pattern().is_match(line))
        .take(max_lines)
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Condense a failing command's output into a findings list.
///
/// Prefers diagnostic lines; falls back to the tail of the raw output so the
/// fixer always has something to work with.
pub fn findings_from_output(output: &str, max_lines: usize, max_chars: usize) -> Vec<String> {
    let diagnostics = extract_diagnostics(output, max_lines);
    if !diagnostics.is_empty() {
        return diagnostics
            .into_iter()
            .map(|line| truncate_output(&line, max_chars, TruncationMode::HeadTail))
            .collect();
    }
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    vec![truncate_output(trimmed, max_chars, TruncationMode::Tail)]
}
