//! Resynchronizes an arbitrarily-chunked byte stream onto 188-byte TS packet
//! boundaries.
//!
//! A socket read can split or coalesce packets in any way; the reassembler
//! buffers raw bytes and only emits a `TsPacket` once it has located a sync
//! byte that repeats every 188 bytes for `verify_count` consecutive packets,
//! so a stray `0x47` inside a payload can't be mistaken for the real
//! alignment.

use crate::ts::types::{TsPacket, TS_PACKET_SIZE};
use bytes::BytesMut;

const SYNC_BYTE: u8 = 0x47;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Searching,
    Verifying { offset: usize },
    Synced,
}

/// Byte-stream-to-packet resynchronizer.
///
/// Per source: one reassembler. It owns no notion of PID or PSI, only the
/// 188-byte alignment.
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    state: SyncState,
    verify_count: usize,
    max_buffer: usize,
    output: Vec<TsPacket>,
    bytes_discarded: u64,
    sync_losses: u64,
    packets_output: u64,
}

impl Reassembler {
    /// Creates a reassembler with the given hard cap on buffered bytes while
    /// searching for alignment.
    pub fn new(max_buffer: usize) -> Self {
        Self::with_verify_count(max_buffer, 3)
    }

    pub fn with_verify_count(max_buffer: usize, verify_count: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: SyncState::Searching,
            verify_count: verify_count.max(1),
            max_buffer,
            output: Vec::new(),
            bytes_discarded: 0,
            sync_losses: 0,
            packets_output: 0,
        }
    }

    /// Feeds raw bytes from the ingress transport. Complete packets become
    /// available via [`drain_packets`](Self::drain_packets).
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.advance();
    }

    /// Takes every packet reassembled so far, leaving the internal queue empty.
    pub fn drain_packets(&mut self) -> Vec<TsPacket> {
        std::mem::take(&mut self.output)
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    pub fn sync_losses(&self) -> u64 {
        self.sync_losses
    }

    pub fn packets_output(&self) -> u64 {
        self.packets_output
    }

    fn advance(&mut self) {
        loop {
            match self.state {
                SyncState::Searching => {
                    if !self.search() {
                        break;
                    }
                }
                SyncState::Verifying { offset } => {
                    if !self.verify(offset) {
                        break;
                    }
                }
                SyncState::Synced => {
                    if !self.drain_synced() {
                        break;
                    }
                }
            }
        }
        self.enforce_cap();
    }

    /// Looks for a candidate sync byte. Returns `true` if it should be
    /// called again (state changed), `false` if it needs more data.
    fn search(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == SYNC_BYTE) {
            Some(0) => {
                self.state = SyncState::Verifying { offset: 0 };
                true
            }
            Some(i) => {
                self.bytes_discarded += i as u64;
                let _ = self.buffer.split_to(i);
                self.state = SyncState::Verifying { offset: 0 };
                true
            }
            None => {
                // No candidate anywhere in the buffer; drop it all, the
                // last byte might itself be a partial-sync false start but
                // is cheaper to rediscover than to special-case.
                self.bytes_discarded += self.buffer.len() as u64;
                self.buffer.clear();
                false
            }
        }
    }

    /// Checks whether the candidate at `offset` repeats every 188 bytes for
    /// `verify_count` packets. Returns `true` if it resolved (synced or
    /// rejected), `false` if more data is needed.
    fn verify(&mut self, offset: usize) -> bool {
        let needed = offset + TS_PACKET_SIZE * self.verify_count;
        if self.buffer.len() < needed {
            return false;
        }

        let aligned = (0..self.verify_count)
            .all(|n| self.buffer[offset + n * TS_PACKET_SIZE] == SYNC_BYTE);

        if aligned {
            self.bytes_discarded += offset as u64;
            let _ = self.buffer.split_to(offset);
            self.state = SyncState::Synced;
        } else {
            // False candidate; resume the search just past it.
            self.bytes_discarded += (offset + 1) as u64;
            let _ = self.buffer.split_to(offset + 1);
            self.state = SyncState::Searching;
        }
        true
    }

    /// Emits complete packets while still aligned. Returns `true` if it
    /// should be called again.
    fn drain_synced(&mut self) -> bool {
        if self.buffer.len() < TS_PACKET_SIZE {
            return false;
        }
        if self.buffer[0] != SYNC_BYTE {
            self.sync_losses += 1;
            self.state = SyncState::Searching;
            return true;
        }
        let raw = self.buffer.split_to(TS_PACKET_SIZE);
        if let Ok(packet) = TsPacket::from_slice(&raw) {
            self.output.push(packet);
            self.packets_output += 1;
        }
        true
    }

    fn enforce_cap(&mut self) {
        if self.buffer.len() > self.max_buffer {
            let excess = self.buffer.len() - self.max_buffer;
            self.bytes_discarded += excess as u64;
            let _ = self.buffer.split_to(excess);
            // The buffer no longer starts on a known boundary.
            self.state = SyncState::Searching;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pid: u16, cc: u8) -> [u8; TS_PACKET_SIZE] {
        let mut raw = [0xFFu8; TS_PACKET_SIZE];
        raw[0] = 0x47;
        raw[1] = (pid >> 8) as u8 & 0x1F;
        raw[2] = (pid & 0xFF) as u8;
        raw[3] = 0x10 | (cc & 0x0F);
        raw
    }

    #[test]
    fn syncs_on_clean_stream_and_emits_packets() {
        let mut r = Reassembler::new(1 << 20);
        for i in 0..5u8 {
            r.push_bytes(&packet(0x100, i));
        }
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 5);
        assert_eq!(r.bytes_discarded(), 0);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.continuity_counter(), i as u8);
        }
    }

    #[test]
    fn skips_garbage_prefix_before_locking_sync() {
        let mut r = Reassembler::new(1 << 20);
        let mut data = vec![0x00, 0x47, 0x01, 0x02]; // stray 0x47 that doesn't repeat
        for i in 0..4u8 {
            data.extend_from_slice(&packet(0x100, i));
        }
        r.push_bytes(&data);
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 4);
        assert!(r.bytes_discarded() > 0);
    }

    #[test]
    fn handles_fragmented_feed() {
        let mut r = Reassembler::with_verify_count(1 << 20, 1);
        let full = packet(0x101, 2);
        r.push_bytes(&full[..100]);
        assert!(r.drain_packets().is_empty());
        r.push_bytes(&full[100..]);
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pid(), 0x101);
    }

    #[test]
    fn detects_sync_loss_and_recovers() {
        let mut r = Reassembler::with_verify_count(1 << 20, 3);
        for i in 0..3u8 {
            r.push_bytes(&packet(0x100, i));
        }
        assert_eq!(r.drain_packets().len(), 3);

        // Corrupt a packet while already synced: the next 188 bytes no
        // longer start with the sync byte.
        let mut corrupt = packet(0x100, 9);
        corrupt[0] = 0x00;
        r.push_bytes(&corrupt);
        assert!(r.drain_packets().is_empty());
        assert_eq!(r.sync_losses(), 1);

        for i in 0..3u8 {
            r.push_bytes(&packet(0x100, 10 + i));
        }
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn enforces_buffer_cap() {
        let mut r = Reassembler::new(100);
        let mut data = vec![0x47u8];
        data.extend(std::iter::repeat(0x00u8).take(499));
        r.push_bytes(&data);
        assert!(r.bytes_discarded() >= 400);
    }

    // Reassembler alignment: a stream of back-to-back, correctly-spaced
    // 188-byte packets always comes out one-for-one with nothing discarded,
    // no matter how many are fed in a single push.
    #[quickcheck_macros::quickcheck]
    fn aligned_clean_stream_yields_one_packet_per_188_bytes(n: u8) -> bool {
        let n = (n % 20) as usize + 1;
        let mut r = Reassembler::with_verify_count(1 << 20, 1);
        for i in 0..n {
            r.push_bytes(&packet(0x100, (i % 16) as u8));
        }
        let packets = r.drain_packets();
        packets.len() == n && r.bytes_discarded() == 0
    }
}
