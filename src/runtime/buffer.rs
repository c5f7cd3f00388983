//! Per-connection read buffer and CRLF line framing.
//!
//! Each connection owns one fixed-capacity [`ReadBuffer`]. Socket reads land
//! in the spare tail, and [`ReadBuffer::lines`] yields every complete line
//! currently buffered. Whatever was consumed is compacted away when the
//! iterator is dropped, so position 0 always marks the start of the next
//! undispatched byte.
//!
//! ## Framing rules
//!
//! - A line ends at CR LF; the terminator is not part of the line.
//! - A CR that is the last buffered byte stays pending until more data arrives.
//! - A CR followed by anything but LF ends the pass; scanning restarts from
//!   the beginning of that line on the next pass.
//! - CR LF directly after the previous boundary is an empty line and is
//!   yielded like any other.

/// Fixed-capacity byte buffer with a fill level.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    /// Bytes currently buffered, always starting at index 0.
    filled: usize,
}

impl ReadBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// True when no room is left for another read.
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Free space to read into. Follow with [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` bytes of the spare space as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len(), "commit past capacity");
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Copy `bytes` into the spare space, returning how many fit.
    #[cfg(test)]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.filled);
        self.data[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
        n
    }

    /// Drop the first `n` bytes and move the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.filled);
        if n == 0 {
            return;
        }
        if n < self.filled {
            self.data.copy_within(n..self.filled, 0);
        }
        self.filled -= n;
    }

    /// Iterate over the complete lines currently buffered.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines {
            buf: self,
            consumed: 0,
        }
    }
}

/// Lazy iterator over complete lines in a [`ReadBuffer`].
///
/// Lines that have been yielded are removed from the buffer on drop; lines
/// never pulled from the iterator stay buffered for the next pass.
pub struct Lines<'a> {
    buf: &'a mut ReadBuffer,
    /// Start of the first line not yet yielded.
    consumed: usize,
}

impl Lines<'_> {
    /// Find the next CR LF at or after `consumed`, returning the index of CR.
    fn next_terminator(&self) -> Option<usize> {
        let data = self.buf.as_slice();
        let mut pos = self.consumed;

        while pos < data.len() {
            if data[pos] == b'\r' {
                return match data.get(pos + 1) {
                    Some(b'\n') => Some(pos),
                    // Bare CR: not a terminator. Stop here and leave the
                    // bytes for a later pass.
                    Some(_) => None,
                    // CR is the last byte; its LF may be in the next read.
                    None => None,
                };
            }
            pos += 1;
        }
        None
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let end = self.next_terminator()?;
        let line = String::from_utf8_lossy(&self.buf.as_slice()[self.consumed..end]).into_owned();
        self.consumed = end + 2;
        Some(line)
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.buf.consume(self.consumed);
    }
}
