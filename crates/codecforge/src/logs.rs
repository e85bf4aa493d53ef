//! Subprocess output handling.
//!
//! Raw output goes verbatim to a per-target log file. Anything surfaced to the
//! terminal or a diagnostic passes through [`sanitize_line`] first.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

/// Drop terminal escape sequences, control and bidi characters; cap the length.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut state: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match (state, c) {
            (None, '\x1b') => Some(Escape::Start),
            (None, _) => {
                let mapped = match c {
                    '\t' => Some(' '),
                    '\r' | '\n' => None,
                    c if c.is_control() || is_bidi_control(c) => None,
                    c => Some(c),
                };
                if let Some(m) = mapped {
                    if kept == MAX_LINE_CHARS {
                        out.push_str(" ...[truncated]");
                        return out;
                    }
                    out.push(m);
                    kept += 1;
                }
                None
            }
            (Some(Escape::Start), '[') => Some(Escape::Csi),
            (Some(Escape::Start), ']') => Some(Escape::Osc),
            (Some(Escape::Start), 'P' | 'X' | '^' | '_') => Some(Escape::String),
            (Some(Escape::Start), _) => None,
            (Some(Escape::Csi), '@'..='~') => None,
            (Some(Escape::Csi), _) => Some(Escape::Csi),
            (Some(Escape::Osc), '\x07') => None,
            (Some(Escape::Osc | Escape::OscEsc), '\x1b') => Some(Escape::OscEsc),
            (Some(Escape::OscEsc), '\\') => None,
            (Some(Escape::Osc | Escape::OscEsc), _) => Some(Escape::Osc),
            (Some(Escape::String | Escape::StringEsc), '\x1b') => Some(Escape::StringEsc),
            (Some(Escape::StringEsc), '\\') => None,
            (Some(Escape::String | Escape::StringEsc), _) => Some(Escape::String),
        };
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// Append-only raw log of one target. Cloning shares the file handle.
#[derive(Clone)]
pub struct TargetLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl TargetLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::msg(format!("failed to open log {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &str) {
        // A poisoned handle or full disk must not fail the build itself.
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{line}");
        }
    }

    pub fn banner(&self, text: &str) {
        self.append(&format!(
            "==== {} {text}",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));
    }
}

/// Last `n` sanitized lines of a log, for diagnostic details.
pub fn tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| sanitize_line(l))
        .collect()
}
