//! Anti-replay sequence number history.
//!
//! The receiver keeps a 512-bit window made of two 256-bit halves. The upper
//! half covers `[base, base + 256)` where `base` is the high-water mark rounded
//! down to a multiple of 256, the lower half covers `[base - 256, base)`.
//!
//! ```text
//!        lower half             upper half
//! |<------ 256 bits ------>|<------ 256 bits ------>|
//! base - 256               base                base + 256
//! ```
//!
//! When a seqno lands exactly one half above the window the halves slide;
//! anything further ahead clears the window and restarts it at the new seqno.

use tracing::trace;

const HALF_BITS: u64 = 256;
const WORD_BITS: u64 = 64;
const HALF_WORDS: usize = (HALF_BITS / WORD_BITS) as usize;
const WORDS: usize = 2 * HALF_WORDS;
const INDEX_MASK: u64 = HALF_BITS - 1;

/// Number of sequence numbers tracked by a receiver.
pub const HISTORY_BITS: u64 = 2 * HALF_BITS;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    base: u64,
    bits: [u64; WORDS],
}

impl Window {
    fn slide(&mut self) {
        self.bits.copy_within(HALF_WORDS.., 0);
        self.bits[HALF_WORDS..].fill(0);
    }
}

/// Sequence number history for one direction of a peer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketsHistory {
    /// `None` for the sending side, which only counts.
    window: Option<Window>,
    seqno: u64,
}

impl PacketsHistory {
    /// History for outgoing packets: a plain counter.
    pub fn for_sender() -> Self {
        Self {
            window: None,
            seqno: 0,
        }
    }

    /// History for incoming packets with a full replay window.
    pub fn for_receiver() -> Self {
        let mut history = Self {
            window: Some(Window {
                base: 0,
                bits: [0; WORDS],
            }),
            seqno: 0,
        };
        history.reset();
        history
    }

    /// Highest seqno seen (receiver) or issued (sender).
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Issues the next outgoing seqno.
    pub fn next_seqno(&mut self) -> u64 {
        self.seqno = self.seqno.saturating_add(1);
        self.seqno
    }

    /// Forgets everything, as after a peer restart.
    ///
    /// Seqno 0 is marked as already seen so it can never be admitted.
    pub fn reset(&mut self) {
        self.seqno = 0;
        if let Some(window) = &mut self.window {
            window.base = 0;
            window.bits = [0; WORDS];
            window.bits[HALF_WORDS] = 1;
        }
    }

    /// Returns whether a packet with `seqno` should be accepted, and records it.
    pub fn deliver(&mut self, seqno: u64) -> bool {
        let Some(window) = &mut self.window else {
            self.seqno = self.seqno.max(seqno);
            return true;
        };

        let seqno_norm = seqno & !INDEX_MASK;
        if seqno_norm.saturating_add(HALF_BITS) < window.base {
            trace!(seqno, base = window.base, "seqno too old");
            return false;
        }

        let half = if seqno_norm < window.base {
            0
        } else {
            if seqno_norm > window.base {
                if window.base.checked_add(HALF_BITS) == Some(seqno_norm) {
                    window.slide();
                } else {
                    window.bits = [0; WORDS];
                }
                window.base = seqno_norm;
            }
            HALF_WORDS
        };

        let bit = seqno & INDEX_MASK;
        let word = half + (bit / WORD_BITS) as usize;
        let mask = 1u64 << (bit % WORD_BITS);
        if window.bits[word] & mask != 0 {
            trace!(seqno, "duplicate seqno");
            return false;
        }
        window.bits[word] |= mask;

        self.seqno = self.seqno.max(seqno);
        true
    }
}
