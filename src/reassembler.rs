//! Reassembly of newline-delimited protocol lines from BLE notification
//! fragments.
//!
//! Notifications arrive MTU-sized, so a single line is commonly split across
//! several chunks and a single chunk commonly carries the tail of one line
//! plus the head of the next. Fragments are appended to a text buffer and
//! complete lines are split off on `\n`. A trailing fragment without `\n` is
//! retained; the session force-flushes it after [`FLUSH_TIMEOUT`] of
//! inactivity, because the device sometimes terminates the last line of a
//! burst without a newline.

use crate::codec;
use std::time::Duration;

/// Inactivity window after which a retained partial line is flushed.
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct LineReassembler {
    buffer: String,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an inbound chunk and return every complete line it closed.
    ///
    /// Lines that are empty after trimming are dropped. The caller must
    /// (re)arm the flush timer whenever [`has_pending`](Self::has_pending)
    /// is true after this returns.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&codec::decode(chunk));

        if !self.buffer.contains('\n') {
            return Vec::new();
        }

        let ends_complete = self.buffer.ends_with('\n');
        let mut segments: Vec<String> = self.buffer.split('\n').map(str::to_owned).collect();

        // The final segment is either empty (buffer ended with '\n') or an
        // incomplete line that must wait for more data.
        let tail = segments.pop().unwrap_or_default();
        self.buffer = if ends_complete { String::new() } else { tail };

        segments
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Force out the retained partial line after an inactivity timeout.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop any buffered fragment, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
