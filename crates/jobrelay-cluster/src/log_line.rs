use chrono::{DateTime, Utc};

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

impl OutputLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            text: text.into(),
        }
    }

    pub fn at(timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Some(timestamp),
            text: text.into(),
        }
    }
}

/// Splits a `timestamps=true` log line (`<rfc3339nano> <text>`). Lines without
/// a parseable prefix are kept whole.
pub fn parse_log_line(raw: &str, timestamps: bool) -> OutputLine {
    let raw = raw.strip_suffix('\r').unwrap_or(raw);
    if !timestamps {
        return OutputLine::new(raw);
    }
    let (head, rest) = match raw.split_once(' ') {
        Some(parts) => parts,
        None => (raw, ""),
    };
    match DateTime::parse_from_rfc3339(head) {
        Ok(ts) => OutputLine::at(ts.with_timezone(&Utc), rest),
        Err(_) => OutputLine::new(raw),
    }
}

/// Accumulates raw body chunks and yields complete lines. Bytes are buffered
/// rather than text so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Remaining partial line once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
