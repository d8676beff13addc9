//! Inbound sequence tracking. A sliding 256-bit map over the most recently
//! accepted sequence numbers; anything older than the window or already
//! flagged is a replay.

use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Width of the replay window in sequence numbers.
pub const WINDOW: u32 = 256;

const WORDS: usize = (WINDOW / 64) as usize;

/// Sliding replay window. `check` validates without mutating so a packet can
/// be vetted before its ciphertext is authenticated; `commit` flags the
/// sequence once the packet has fully decrypted.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    max_seen: u32,
    seeded: bool,
    bitmap: [u64; WORDS],
}

impl SequenceWindow {
    #[inline]
    pub fn new() -> SequenceWindow {
        SequenceWindow {
            max_seen: 0,
            seeded: false,
            bitmap: [0u64; WORDS],
        }
    }

    /// Highest sequence accepted so far.
    #[inline]
    pub fn max_seen(&self) -> u32 {
        self.max_seen
    }

    /// True if the sequence would be admitted right now.
    pub fn check(&self, sequence: u32) -> NetworkResult<()> {
        if !self.seeded || sequence > self.max_seen {
            return Ok(());
        }

        let diff = self.max_seen - sequence;

        if diff >= WINDOW {
            return Err(NetworkError::Fatal(ErrorType::Replay));
        }

        if self.flagged(diff) {
            return Err(NetworkError::Fatal(ErrorType::Replay));
        }

        Ok(())
    }

    /// Flags the sequence as seen, sliding the window forward if needed. The
    /// caller must have `check`ed the sequence first.
    pub fn commit(&mut self, sequence: u32) {
        if !self.seeded {
            self.seeded = true;
            self.max_seen = sequence;
            self.bitmap = [0u64; WORDS];
            self.flag(0);
            return;
        }

        if sequence > self.max_seen {
            self.slide(sequence - self.max_seen);
            self.max_seen = sequence;
            self.flag(0);
        } else {
            self.flag(self.max_seen - sequence);
        }
    }

    /// Resets to the pristine state. Only the RENEW exchange may do this.
    #[inline]
    pub fn renew(&mut self) {
        *self = SequenceWindow::new();
    }

    #[inline]
    fn flagged(&self, diff: u32) -> bool {
        self.bitmap[(diff / 64) as usize] & (1u64 << (diff % 64)) != 0
    }

    #[inline]
    fn flag(&mut self, diff: u32) {
        self.bitmap[(diff / 64) as usize] |= 1u64 << (diff % 64);
    }

    /// Shift every flag towards older positions by `count` sequences.
    fn slide(&mut self, count: u32) {
        if count >= WINDOW {
            self.bitmap = [0u64; WORDS];
            return;
        }

        let words = (count / 64) as usize;
        let bits = count % 64;

        if words > 0 {
            for index in (0..WORDS).rev() {
                self.bitmap[index] = if index >= words {
                    self.bitmap[index - words]
                } else {
                    0
                };
            }
        }

        if bits > 0 {
            for index in (0..WORDS).rev() {
                let mut word = self.bitmap[index] << bits;
                if index > 0 {
                    word |= self.bitmap[index - 1] >> (64 - bits);
                }
                self.bitmap[index] = word;
            }
        }
    }
}
