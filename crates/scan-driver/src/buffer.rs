//! Bounded ring of raw device lines shared by the reader and the consumer.
//!
//! Two monotone counters track progress: lines written by the reader and
//! lines released by the consumer. Each sits behind its own lock and no code
//! path holds both at once. `written - consumed` never leaves
//! `[0, capacity]`.

use parking_lot::Mutex;
use scan_core::{Result, ScanError};

/// Ring buffer of fixed-size raw lines.
#[derive(Debug)]
pub struct TransferBuffer {
    line_bytes: usize,
    capacity: usize,
    data: Mutex<Vec<u8>>,
    written: Mutex<u64>,
    consumed: Mutex<u64>,
}

impl TransferBuffer {
    /// Buffer holding `capacity` lines of `line_bytes` each.
    pub fn new(line_bytes: usize, capacity: usize) -> Result<Self> {
        if line_bytes == 0 || capacity == 0 {
            return Err(ScanError::invalid(
                "transfer_buffer",
                format!("{capacity} lines of {line_bytes} bytes"),
            ));
        }
        Ok(Self {
            line_bytes,
            capacity,
            data: Mutex::new(vec![0; line_bytes * capacity]),
            written: Mutex::new(0),
            consumed: Mutex::new(0),
        })
    }

    /// Buffer sized from a byte budget, never smaller than `min_lines`.
    pub fn with_budget(line_bytes: usize, budget: usize, min_lines: usize) -> Result<Self> {
        let lines = (budget / line_bytes.max(1)).max(min_lines);
        Self::new(line_bytes, lines)
    }

    /// Bytes per line.
    #[must_use]
    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    /// Capacity in lines.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        *self.written.lock()
    }

    /// Lines released so far.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        *self.consumed.lock()
    }

    /// Lines held.
    #[must_use]
    pub fn pending(&self) -> u64 {
        let consumed = self.consumed();
        self.written().saturating_sub(consumed)
    }

    /// Whether `lines` more lines fit without overwriting unreleased ones.
    #[must_use]
    pub fn can_write(&self, lines: usize) -> bool {
        self.pending() + lines as u64 <= self.capacity as u64
    }

    /// Append whole lines. Only the reader calls this.
    pub fn write_lines(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() % self.line_bytes != 0 {
            return Err(ScanError::invalid(
                "transfer_buffer",
                format!("{} bytes is not a whole number of lines", bytes.len()),
            ));
        }
        let lines = bytes.len() / self.line_bytes;
        if !self.can_write(lines) {
            return Err(ScanError::InvalidState {
                expected: "free buffer space",
                actual: format!("{} of {} lines pending", self.pending(), self.capacity),
            });
        }
        let start = self.written();
        {
            let mut data = self.data.lock();
            for (i, line) in bytes.chunks_exact(self.line_bytes).enumerate() {
                let slot = ((start + i as u64) % self.capacity as u64) as usize;
                let offset = slot * self.line_bytes;
                data[offset..offset + self.line_bytes].copy_from_slice(line);
            }
        }
        *self.written.lock() += lines as u64;
        Ok(lines)
    }

    /// Copy line `index` into `out`. The line must be written and unreleased.
    pub fn read_line(&self, index: u64, out: &mut [u8]) -> Result<()> {
        let written = self.written();
        let consumed = self.consumed();
        if index < consumed || index >= written {
            return Err(ScanError::InvalidState {
                expected: "buffered line",
                actual: format!("line {index} outside [{consumed}, {written})"),
            });
        }
        if out.len() != self.line_bytes {
            return Err(ScanError::invalid(
                "line_buffer",
                format!("{} bytes, need {}", out.len(), self.line_bytes),
            ));
        }
        let slot = (index % self.capacity as u64) as usize;
        let offset = slot * self.line_bytes;
        out.copy_from_slice(&self.data.lock()[offset..offset + self.line_bytes]);
        Ok(())
    }

    /// Owned copy of line `index`.
    pub fn line(&self, index: u64) -> Result<Vec<u8>> {
        let mut out = vec![0; self.line_bytes];
        self.read_line(index, &mut out)?;
        Ok(out)
    }

    /// Release every line below `index`. Never moves backwards or past the
    /// write counter.
    pub fn release_until(&self, index: u64) {
        let written = self.written();
        let mut consumed = self.consumed.lock();
        *consumed = (*consumed).max(index.min(written));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_write_read_release() {
        let buf = TransferBuffer::new(4, 3).unwrap();
        buf.write_lines(&[1, 1, 1, 1, 2, 2, 2, 2]).unwrap();
        assert_eq!(buf.written(), 2);
        assert_eq!(buf.line(1).unwrap(), vec![2; 4]);
        buf.release_until(1);
        assert!(buf.line(0).is_err());
        assert_eq!(buf.pending(), 1);
    }

    #[test]
    fn test_back_pressure() {
        let buf = TransferBuffer::new(2, 2).unwrap();
        buf.write_lines(&[0; 4]).unwrap();
        assert!(!buf.can_write(1));
        assert!(matches!(
            buf.write_lines(&[0; 2]),
            Err(ScanError::InvalidState { .. })
        ));
        buf.release_until(1);
        buf.write_lines(&[9, 9]).unwrap();
        assert_eq!(buf.line(2).unwrap(), vec![9, 9]);
        assert_eq!(buf.line(1).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_release_clamped_to_written() {
        let buf = TransferBuffer::new(1, 4).unwrap();
        buf.write_lines(&[1, 2]).unwrap();
        buf.release_until(10);
        assert_eq!(buf.consumed(), 2);
        buf.release_until(1);
        assert_eq!(buf.consumed(), 2);
    }

    #[test]
    fn test_rejects_partial_lines_and_zero_size() {
        let buf = TransferBuffer::new(4, 4).unwrap();
        assert!(buf.write_lines(&[0; 6]).is_err());
        assert!(TransferBuffer::new(0, 4).is_err());
    }

    #[test]
    fn test_budget_sizing() {
        let buf = TransferBuffer::with_budget(100, 1000, 2).unwrap();
        assert_eq!(buf.capacity(), 10);
        let buf = TransferBuffer::with_budget(100, 50, 6).unwrap();
        assert_eq!(buf.capacity(), 6);
    }

    proptest! {
        #[test]
        fn prop_cursor_gap_within_capacity(
            capacity in 1usize..16,
            steps in prop::collection::vec((any::<bool>(), 1usize..6), 1..200),
        ) {
            let buf = TransferBuffer::new(3, capacity).unwrap();
            let mut next_value = 0u8;
            for (write, n) in steps {
                if write {
                    let lines = n.min(capacity);
                    if buf.can_write(lines) {
                        let bytes: Vec<u8> = (0..lines).flat_map(|_| {
                            next_value = next_value.wrapping_add(1);
                            [next_value; 3]
                        }).collect();
                        buf.write_lines(&bytes).unwrap();
                    } else {
                        prop_assert!(buf.write_lines(&vec![0; lines * 3]).is_err());
                    }
                } else {
                    let target = buf.consumed() + n as u64;
                    buf.release_until(target);
                }
                let gap = buf.written() - buf.consumed();
                prop_assert!(gap <= capacity as u64);
                if gap > 0 {
                    let newest = buf.line(buf.written() - 1).unwrap();
                    prop_assert_eq!(newest, vec![next_value; 3]);
                }
            }
        }
    }
}
