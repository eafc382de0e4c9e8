//! YAML range locator and caret snippet rendering
//!
//! Given a config path like `spec.ports[1].name` and the original YAML
//! text, finds the line holding the failing key and renders a caret-marked
//! snippet for the validation error.

use super::PathSegment;

/// Locate the (0-based line, column) of the key addressed by `path`.
///
/// Walks the document line by line tracking mapping indentation and
/// sequence entries. Good for the config shapes trellis reads; returns
/// None rather than guessing when the document is irregular.
pub fn locate(source: &str, path: &[PathSegment]) -> Option<(usize, usize)> {
    let lines: Vec<&str> = source.lines().collect();
    let mut line_idx = 0usize;
    let mut indent = 0usize;
    let mut found: Option<(usize, usize)> = None;

    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                let (hit_line, hit_col) = find_key(&lines, line_idx, indent, key)?;
                found = Some((hit_line, hit_col));
                line_idx = hit_line;
                indent = hit_col + 2; // children are indented past the key
                line_idx += 1;
            }
            PathSegment::Index(index) => {
                let (hit_line, hit_col) = find_sequence_entry(&lines, line_idx, indent, *index)?;
                found = Some((hit_line, hit_col));
                // Entry keys start at the column right after the dash
                line_idx = hit_line;
                indent = hit_col;
            }
        }
    }

    found
}

fn find_key(lines: &[&str], from: usize, min_indent: usize, key: &str) -> Option<(usize, usize)> {
    for (offset, line) in lines.iter().enumerate().skip(from) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let col = line.len() - trimmed.len();
        if col < min_indent && offset > from {
            // Dedented past our scope; the key is not here
            return None;
        }
        let stripped = trimmed.strip_prefix("- ").unwrap_or(trimmed);
        let entry_col = line.len() - stripped.len();
        if let Some(rest) = stripped.strip_prefix(key) {
            if rest.starts_with(':') {
                return Some((offset, entry_col));
            }
        }
    }
    None
}

fn find_sequence_entry(
    lines: &[&str],
    from: usize,
    min_indent: usize,
    index: usize,
) -> Option<(usize, usize)> {
    let mut seen = 0usize;
    for (offset, line) in lines.iter().enumerate().skip(from) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let col = line.len() - trimmed.len();
        if col < min_indent && offset > from {
            return None;
        }
        if trimmed.starts_with('-') && col >= min_indent {
            if seen == index {
                return Some((offset, col + 2));
            }
            seen += 1;
        }
    }
    None
}

/// Render a caret-marked snippet around the located line.
pub fn render(source: &str, line_idx: usize, col: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = String::new();

    let start = line_idx.saturating_sub(1);
    let end = (line_idx + 2).min(lines.len());
    for i in start..end {
        out.push_str(&format!("{:>4} | {}\n", i + 1, lines[i]));
        if i == line_idx {
            out.push_str(&format!("     | {}^\n", " ".repeat(col)));
        }
    }
    out
}
