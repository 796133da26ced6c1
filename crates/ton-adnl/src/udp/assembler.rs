//! Reassembly of `adnl.message.part` fragments.
//!
//! A transfer is keyed by the SHA-256 of the complete boxed message. Parts may
//! arrive in any order and may overlap; only the bytes that fill a gap are
//! copied. Once every gap is closed the buffer is checked against the hash and
//! decoded as a single [`AdnlMessage`].

use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::AdnlMessage;

/// Number of live transfers above which expired ones are swept.
const SWEEP_THRESHOLD: usize = 16;

struct Transfer {
    total_size: usize,
    buffer: Vec<u8>,
    /// Byte ranges still missing, ordered and disjoint.
    gaps: Vec<Range<usize>>,
    deadline: Instant,
}

impl Transfer {
    fn new(total_size: usize, deadline: Instant) -> Self {
        Self {
            total_size,
            buffer: vec![0; total_size],
            gaps: vec![0..total_size],
            deadline,
        }
    }

    /// Copies the parts of `data` that land in a gap. Returns bytes written.
    fn fill(&mut self, start: usize, data: &[u8]) -> usize {
        let end = start + data.len();
        let mut written = 0;
        let mut remaining = Vec::with_capacity(self.gaps.len() + 1);

        for gap in self.gaps.drain(..) {
            let from = gap.start.max(start);
            let to = gap.end.min(end);
            if from >= to {
                remaining.push(gap);
                continue;
            }

            self.buffer[from..to].copy_from_slice(&data[from - start..to - start]);
            written += to - from;

            if gap.start < from {
                remaining.push(gap.start..from);
            }
            if to < gap.end {
                remaining.push(to..gap.end);
            }
        }

        self.gaps = remaining;
        written
    }

    fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Per-peer reassembly state.
pub(crate) struct MessageAssembler {
    max_total_bytes: usize,
    ttl: Duration,
    transfers: HashMap<[u8; 32], Transfer>,
}

impl MessageAssembler {
    pub fn new(max_total_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_total_bytes,
            ttl,
            transfers: HashMap::new(),
        }
    }

    /// Feeds one part. Returns the reassembled message when this part
    /// completes a transfer whose content matches its hash.
    pub fn accept(
        &mut self,
        hash: [u8; 32],
        total_size: i32,
        offset: i32,
        data: &[u8],
    ) -> Option<AdnlMessage> {
        let total_size = usize::try_from(total_size)
            .ok()
            .filter(|size| (1..=self.max_total_bytes).contains(size))?;
        let offset = usize::try_from(offset).ok()?;
        if offset + data.len() > total_size {
            trace!(offset, len = data.len(), total_size, "part out of bounds");
            return None;
        }

        if self.transfers.len() > SWEEP_THRESHOLD {
            self.sweep_expired();
        }

        let now = Instant::now();
        let transfer = self
            .transfers
            .entry(hash)
            .or_insert_with(|| Transfer::new(total_size, now + self.ttl));

        if transfer.total_size != total_size {
            debug!(
                expected = transfer.total_size,
                got = total_size,
                "part size mismatch, discarding transfer"
            );
            self.transfers.remove(&hash);
            return None;
        }

        if transfer.fill(offset, data) == 0 {
            return None;
        }
        transfer.deadline = now + self.ttl;

        if !transfer.is_complete() {
            return None;
        }

        let transfer = self.transfers.remove(&hash)?;
        if ton_crypto::sha256(&transfer.buffer) != hash {
            debug!("reassembled message hash mismatch");
            return None;
        }

        match AdnlMessage::from_bytes(&transfer.buffer) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("failed to decode reassembled message: {}", e);
                None
            }
        }
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.transfers.retain(|_, transfer| transfer.deadline > now);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.transfers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(message: &AdnlMessage, chunk: usize) -> ([u8; 32], i32, Vec<(i32, Vec<u8>)>) {
        let bytes = message.to_bytes();
        let hash = ton_crypto::sha256(&bytes);
        let parts = bytes
            .chunks(chunk)
            .enumerate()
            .map(|(i, data)| ((i * chunk) as i32, data.to_vec()))
            .collect();
        (hash, bytes.len() as i32, parts)
    }

    fn assembler() -> MessageAssembler {
        MessageAssembler::new(64 * 1024, Duration::from_secs(10))
    }

    fn big_message() -> AdnlMessage {
        AdnlMessage::Custom {
            data: (0..3000u32).map(|i| i as u8).collect(),
        }
    }

    #[test]
    fn test_in_order_reassembly() {
        let message = big_message();
        let (hash, total, parts) = split(&message, 1000);
        let mut assembler = assembler();

        let last = parts.len() - 1;
        for (i, (offset, data)) in parts.into_iter().enumerate() {
            let result = assembler.accept(hash, total, offset, &data);
            if i == last {
                assert_eq!(result, Some(message.clone()));
            } else {
                assert!(result.is_none());
            }
        }
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_out_of_order_and_overlapping() {
        let message = big_message();
        let bytes = message.to_bytes();
        let hash = ton_crypto::sha256(&bytes);
        let total = bytes.len() as i32;
        let mut assembler = assembler();

        assert!(assembler.accept(hash, total, 2000, &bytes[2000..]).is_none());
        assert!(assembler.accept(hash, total, 500, &bytes[500..2500]).is_none());
        // duplicate adds nothing
        assert!(assembler.accept(hash, total, 600, &bytes[600..700]).is_none());
        assert_eq!(
            assembler.accept(hash, total, 0, &bytes[..600]),
            Some(message)
        );
    }

    #[test]
    fn test_hash_mismatch_discards() {
        let message = big_message();
        let (_, total, parts) = split(&message, 1000);
        let mut assembler = assembler();

        for (offset, data) in parts {
            assert!(assembler.accept([9; 32], total, offset, &data).is_none());
        }
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_total_size_mismatch_drops_transfer() {
        let message = big_message();
        let (hash, total, parts) = split(&message, 1000);
        let mut assembler = assembler();

        assert!(assembler.accept(hash, total, parts[0].0, &parts[0].1).is_none());
        assert_eq!(assembler.pending(), 1);
        assert!(assembler.accept(hash, total + 1, 0, &[1]).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_bounds_rejected() {
        let mut assembler = assembler();
        assert!(assembler.accept([1; 32], 0, 0, &[]).is_none());
        assert!(assembler.accept([1; 32], 64 * 1024 + 1, 0, &[1]).is_none());
        assert!(assembler.accept([1; 32], 10, -1, &[1]).is_none());
        assert!(assembler.accept([1; 32], 10, 8, &[1, 2, 3]).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_expired_transfers_swept() {
        let mut assembler = MessageAssembler::new(1024, Duration::ZERO);
        for i in 0..=SWEEP_THRESHOLD as u8 {
            assembler.accept([i; 32], 10, 0, &[1]);
        }
        assert_eq!(assembler.pending(), SWEEP_THRESHOLD + 1);

        assembler.accept([0xFF; 32], 10, 0, &[1]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_nested_part_message() {
        let inner = AdnlMessage::Nop;
        let bytes = inner.to_bytes();
        let mut assembler = assembler();

        assert_eq!(
            assembler.accept(ton_crypto::sha256(&bytes), bytes.len() as i32, 0, &bytes),
            Some(AdnlMessage::Nop)
        );
    }
}
