//! Parsing of toolchain logs into structured diagnostics.
//!
//! Two layouts are recognized:
//! - NVRTC/EDG: `file(12): error: message` and `file(12): warning #177-D: message`
//! - clang/GCC: `file:12:5: error: message`
//!
//! Lines that match neither (source excerpts, caret markers, summaries) are
//! left in the raw log only.

use crate::error::{Diagnostic, Severity};

/// Parses every recognizable diagnostic line in `log`.
pub fn parse_diagnostics(log: &str) -> Vec<Diagnostic> {
    log.lines()
        .filter_map(|line| parse_edg(line).or_else(|| parse_gnu(line)))
        .collect()
}

/// Extracts the header name from a "cannot open source file" diagnostic.
pub fn missing_include(log: &str) -> Option<String> {
    const MARKER: &str = "cannot open source file \"";
    log.lines().find_map(|line| {
        let start = line.find(MARKER)? + MARKER.len();
        let rest = &line[start..];
        let end = rest.find('"')?;
        Some(rest[..end].to_string())
    })
}

fn parse_edg(line: &str) -> Option<Diagnostic> {
    let open = line.find('(')?;
    let close = open + line[open..].find("): ")?;
    let file = line[..open].trim();
    let line_no: u32 = line[open + 1..close].trim().parse().ok()?;
    if file.is_empty() {
        return None;
    }
    let (severity, message) = split_severity(&line[close + 3..])?;
    Some(Diagnostic {
        file: file.to_string(),
        line: line_no,
        column: None,
        severity,
        message,
    })
}

fn parse_gnu(line: &str) -> Option<Diagnostic> {
    let mut parts = line.splitn(4, ':');
    let file = parts.next()?.trim();
    let line_no: u32 = parts.next()?.trim().parse().ok()?;
    let third = parts.next()?;
    let (column, rest) = match third.trim().parse::<u32>() {
        Ok(column) => (Some(column), parts.next()?.to_string()),
        Err(_) => {
            let mut rest = third.to_string();
            if let Some(tail) = parts.next() {
                rest.push(':');
                rest.push_str(tail);
            }
            (None, rest)
        }
    };
    if file.is_empty() {
        return None;
    }
    let (severity, message) = split_severity(rest.trim_start())?;
    Some(Diagnostic {
        file: file.to_string(),
        line: line_no,
        column,
        severity,
        message,
    })
}

/// Splits `error: msg`, `warning #177-D: msg`, `catastrophic error: msg`.
fn split_severity(text: &str) -> Option<(Severity, String)> {
    let colon = text.find(':')?;
    let head = text[..colon].trim();
    let severity = if head.ends_with("error") || head.starts_with("error") {
        Severity::Error
    } else if head.starts_with("warning") {
        Severity::Warning
    } else if head.starts_with("note") || head.starts_with("remark") {
        Severity::Note
    } else {
        return None;
    };
    Some((severity, text[colon + 1..].trim().to_string()))
}
