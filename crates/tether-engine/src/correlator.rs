//! Extracting a tool's native session id from drained launch output.
//!
//! Correlation runs once, over the full output, so a marker split across
//! reads is never acted on half-formed.

use std::sync::LazyLock;

use regex::Regex;
use tether_core::{NativeSessionId, TransactionId};

static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// `session=<id>` / `session_id: <id>` carried on the marker line itself.
static INLINE_SESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bsession(?:[_ -]?id)?"?\s*[=:]\s*"?([A-Za-z0-9][A-Za-z0-9._:-]*)"#).unwrap()
});

/// Last-resort `session id: <id>` in any spelling.
static GENERIC_SESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bsession[ _-]?id\b"?\s*[=:]\s*"?([A-Za-z0-9][A-Za-z0-9._:-]*)"#).unwrap()
});

/// Lines after a marker that may carry its session id. Tools print their
/// session banner first; anything later is model output.
pub const DEFAULT_SESSION_WINDOW: usize = 40;

/// Strategy for finding the native session id of one launch.
///
/// Tools with a structured session channel (side file, socket) can plug in
/// their own implementation without touching the launcher or the store.
pub trait SessionCorrelator: Send + Sync {
    /// `None` means the tool exposed nothing resumable. That is not an error.
    fn correlate(&self, output: &str, token: &TransactionId) -> Option<NativeSessionId>;
}

/// Finds the `<prefix>: <token>` line, then the session id on it or on the
/// next `window` lines (stopping early at another marker line).
#[derive(Clone, Debug)]
pub struct MarkerCorrelator {
    prefix: String,
    session_pattern: Option<Regex>,
    window: usize,
}

impl MarkerCorrelator {
    pub fn new(prefix: impl Into<String>, session_pattern: Option<Regex>) -> Self {
        Self {
            prefix: prefix.into(),
            session_pattern,
            window: DEFAULT_SESSION_WINDOW,
        }
    }

    pub fn with_window(mut self, lines: usize) -> Self {
        self.window = lines;
        self
    }

    /// `(token, rest)` when `line` is a marker line.
    fn parse_marker<'l>(&self, line: &'l str) -> Option<(&'l str, &'l str)> {
        let body = line.trim_start().strip_prefix(self.prefix.as_str())?;
        let body = body.strip_prefix(':')?.trim_start();
        let end = body.find(char::is_whitespace).unwrap_or(body.len());
        let (token, rest) = body.split_at(end);
        (!token.is_empty()).then_some((token, rest))
    }

    fn search_window(&self, window: &[&str]) -> Option<NativeSessionId> {
        if let Some(pattern) = &self.session_pattern {
            if let Some(id) = window.iter().find_map(|l| capture(pattern, l)) {
                return Some(id);
            }
        }
        window.iter().find_map(|l| capture(&GENERIC_SESSION, l))
    }
}

impl SessionCorrelator for MarkerCorrelator {
    fn correlate(&self, output: &str, token: &TransactionId) -> Option<NativeSessionId> {
        let clean = strip_ansi(output);
        let lines: Vec<&str> = clean.split(['\n', '\r']).collect();

        for (idx, line) in lines.iter().enumerate() {
            let Some((found, rest)) = self.parse_marker(line) else {
                continue;
            };
            if found != token.as_str() {
                continue;
            }
            if let Some(id) = capture(&INLINE_SESSION, rest) {
                return Some(id);
            }
            let window: Vec<&str> = lines[idx + 1..]
                .iter()
                .copied()
                .take(self.window)
                .take_while(|l| self.parse_marker(l).is_none())
                .collect();
            if let Some(id) = self.search_window(&window) {
                return Some(id);
            }
        }
        None
    }
}

pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI.replace_all(text, "")
}

fn capture(pattern: &Regex, line: &str) -> Option<NativeSessionId> {
    let raw = pattern.captures(line)?.get(1)?.as_str();
    let id = raw.trim_end_matches(['.', ':', ',']);
    (!id.is_empty()).then(|| NativeSessionId::from_raw(id))
}
