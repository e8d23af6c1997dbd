// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Splits a transfer's byte count into bounded chunks.
//!
//! Sender and receiver walk the same sequence: the sender to know how many
//! host bytes to pull next, the receiver to know how many to expect.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk within the transfer, starting at 0
    pub index: u32,
    /// Payload bytes carried by this chunk
    pub size: usize,
}

impl Chunk {
    /// Sequence number carried in the chunk trailer.
    ///
    /// Wraps after 65536 chunks; compare with [`seq_order`].
    pub fn sequence(&self) -> u16 {
        self.index as u16
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    total: u32,
    max_payload: usize,
    consumed: u32,
    index: u32,
}

impl Chunker {
    pub fn new(total: u32, max_payload: usize) -> Self {
        assert!(max_payload > 0, "chunk payload size must be non-zero");
        Chunker {
            total,
            max_payload,
            consumed: 0,
            index: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn remaining(&self) -> u32 {
        self.total - self.consumed
    }

    pub fn chunk_count(&self) -> u32 {
        self.total.div_ceil(self.max_payload as u32)
    }
}

impl Iterator for Chunker {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let remaining = self.remaining();
        if remaining == 0 {
            return None;
        }

        let size = remaining.min(self.max_payload as u32);
        let chunk = Chunk {
            index: self.index,
            size: size as usize,
        };
        self.consumed += size;
        self.index += 1;
        Some(chunk)
    }
}

/// Orders a received sequence number against the expected one.
///
/// Serial-number arithmetic over 16 bits, so the ordering survives the
/// trailer wrapping on very long transfers.
pub fn seq_order(got: u16, expected: u16) -> Ordering {
    match expected.wrapping_sub(got) as i16 {
        0 => Ordering::Equal,
        d if d > 0 => Ordering::Less,
        _ => Ordering::Greater,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_sum_to_total() {
        for total in [0u32, 1, 29, 30, 31, 59, 60, 61, 65, 300, 1000, 4096] {
            let chunks: Vec<Chunk> = Chunker::new(total, 30).collect();
            assert_eq!(chunks.len() as u32, total.div_ceil(30), "count for {}", total);
            assert_eq!(chunks.iter().map(|c| c.size as u32).sum::<u32>(), total);
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i as u32);
                assert!(chunk.size > 0 && chunk.size <= 30);
            }
            // only the last chunk may be short
            for chunk in chunks.iter().rev().skip(1) {
                assert_eq!(chunk.size, 30);
            }
        }
    }

    #[test]
    fn test_sixty_five_bytes() {
        let chunks: Vec<(u16, usize)> = Chunker::new(65, 30)
            .map(|c| (c.sequence(), c.size))
            .collect();
        assert_eq!(chunks, vec![(0, 30), (1, 30), (2, 5)]);
    }

    #[test]
    fn test_single_byte() {
        let mut chunker = Chunker::new(1, 30);
        assert_eq!(chunker.chunk_count(), 1);
        assert_eq!(chunker.next(), Some(Chunk { index: 0, size: 1 }));
        assert_eq!(chunker.next(), None);
        assert_eq!(chunker.next(), None);
    }

    #[test]
    fn test_empty_transfer() {
        let mut chunker = Chunker::new(0, 30);
        assert_eq!(chunker.chunk_count(), 0);
        assert_eq!(chunker.next(), None);
    }

    #[test]
    fn test_fresh_copy_replays_the_sequence() {
        let fresh = Chunker::new(61, 30);
        let mut chunker = fresh.clone();
        let first: Vec<Chunk> = chunker.by_ref().collect();
        assert_eq!(chunker.remaining(), 0);
        assert_eq!(fresh.remaining(), 61);
        let second: Vec<Chunk> = fresh.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sequence_wraps() {
        let chunk = Chunk { index: 65_537, size: 30 };
        assert_eq!(chunk.sequence(), 1);
    }

    #[test]
    fn test_seq_order() {
        assert_eq!(seq_order(5, 5), Ordering::Equal);
        assert_eq!(seq_order(4, 5), Ordering::Less);
        assert_eq!(seq_order(6, 5), Ordering::Greater);
        assert_eq!(seq_order(0xFFFF, 0), Ordering::Less);
        assert_eq!(seq_order(0, 0xFFFF), Ordering::Greater);
    }
}
