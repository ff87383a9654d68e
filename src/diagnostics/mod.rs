// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the adsynth project (automatic differentiation by source transformation).

//! Pretty diagnostics: spans, line/col, caret-highlights.

use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub line: usize, // 1-based
    pub col: usize,  // 1-based, counts chars
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub phase: &'static str,
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    /// Byte range in the source the diagnostic was produced from.
    pub span: Range<usize>,
    pub start: Location,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {}:{}: {}",
            self.severity, self.code, self.start.line, self.start.col, self.message
        )
    }
}

/// Compute (line, col) from byte offset.
fn offset_to_loc(src: &str, offset: usize) -> Location {
    let mut line = 1usize;
    let mut col = 1usize;
    for (idx, ch) in src.char_indices() {
        if idx >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    Location { line, col }
}

/// The source line containing `offset` and the byte offset where it starts.
fn line_at(src: &str, offset: usize) -> (&str, usize) {
    let offset = offset.min(src.len());
    let start = src[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = src[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(src.len());
    (&src[start..end], start)
}

/// Render caret-highlight under the selected span (single-line best effort).
pub fn render(src: &str, diag: &Diagnostic) -> String {
    let (line_str, line_off) = line_at(src, diag.span.start);
    let caret_start = diag.span.start.saturating_sub(line_off);
    let caret_len = diag.span.end.saturating_sub(diag.span.start).max(1);
    let caret_len = caret_len.min(line_str.len().saturating_sub(caret_start).max(1));

    format!(
        "{}[{}]: {}\n--> line {}, col {}\n{}\n{}{}",
        diag.severity,
        diag.code,
        diag.message,
        diag.start.line,
        diag.start.col,
        line_str,
        " ".repeat(caret_start),
        "^".repeat(caret_len)
    )
}

impl Diagnostic {
    pub fn error(
        src: &str,
        phase: &'static str,
        code: &'static str,
        span: Range<usize>,
        message: impl Into<String>,
    ) -> Self {
        let start = offset_to_loc(src, span.start);
        Diagnostic {
            phase,
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
            start,
        }
    }

    /// Construct from a chumsky `Simple` error.
    pub fn from_chumsky(src: &str, e: chumsky::error::Simple<char>) -> Self {
        let span = e.span();
        let message = match e.reason() {
            chumsky::error::SimpleReason::Custom(msg) => msg.clone(),
            _ => match e.found() {
                Some(found) => format!("unexpected '{found}'"),
                None => "unexpected end of input".to_string(),
            },
        };
        Diagnostic::error(src, "parse", "E1001", span, message)
    }
}
