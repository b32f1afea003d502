//! Output capture for the sandboxed `print`.

use std::sync::Arc;

use parking_lot::Mutex;

/// Upper bound on buffered output per lease; later writes are dropped.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Captures guest output to a shared, bounded buffer.
///
/// Clones share the same buffer, so the `print` replacement installed in the
/// interpreter and the pipeline reading the output after a call see the same bytes.
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl CapturedOutput {
    /// Create a new captured output buffer with the default limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_OUTPUT_LIMIT)
    }

    /// Create a buffer that keeps at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    /// Append one `print` line, tab-joined and newline-terminated.
    pub fn push_line(&self, parts: &[String]) {
        let mut buffer = self.buffer.lock();
        let line = parts.join("\t");
        let room = self.limit.saturating_sub(buffer.len());
        let bytes = line.as_bytes();
        buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
        if buffer.len() < self.limit {
            buffer.push(b'\n');
        }
    }

    /// Take the captured output, leaving the buffer empty.
    pub fn take(&self) -> String {
        let mut buffer = self.buffer.lock();
        let bytes = std::mem::take(&mut *buffer);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Clear the buffer.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Get the length of captured data.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::new()
    }
}
