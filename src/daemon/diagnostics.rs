//! Bounded capture of worker output streams.

/// Keeps the most recent portion of one worker stream for error reporting.
///
/// Model-loading daemons are chatty at startup and then live for days, so the
/// capture enforces a hard cap instead of accumulating forever. Only the tail
/// matters: it is what an initialization error embeds.
#[derive(Debug)]
pub struct DiagnosticBuffer {
    buf: String,
    capacity: usize,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity,
        }
    }

    /// Append a chunk, discarding the oldest content beyond capacity.
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            let cut = (excess..self.buf.len())
                .find(|i| self.buf.is_char_boundary(*i))
                .unwrap_or(self.buf.len());
            self.buf.drain(..cut);
        }
    }

    /// The retained tail of the stream.
    pub fn tail(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
