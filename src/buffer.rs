//! Per-slot buffering of in-flight and decrypted file pieces
//!
//! The direct (non-RAID) manager hands byte ranges to connections, collects
//! downloaded pieces into an output queue, and releases them to the writer
//! in ascending offset order when ordered delivery is requested. Failed
//! pieces return their range to a retry pool so the bytes are re-requested.

use std::collections::BTreeMap;

use bytes::BytesMut;

use crate::chunk::chunk_ceil;
use crate::raid::RaidBufferManager;

/// A contiguous run of file bytes moving through the pipeline.
///
/// `finalized` means authenticated en/decryption has been applied. The
/// buffer length is a multiple of the cipher block size except for the last
/// piece of the file.
#[derive(Debug)]
pub struct FilePiece {
    pub pos: u64,
    pub buf: BytesMut,
    pub finalized: bool,
}

impl FilePiece {
    pub fn new(pos: u64, buf: BytesMut) -> Self {
        Self {
            pos,
            buf,
            finalized: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Buffer manager for direct (single-source) transfers.
pub struct DirectBufferManager {
    size: u64,
    /// Next byte never handed to any connection
    next_pos: u64,
    /// Ranges that must be re-requested, served before `next_pos`
    retry: BTreeMap<u64, u64>,
    /// Outstanding range per connection
    assigned: Vec<Option<(u64, u64)>>,
    /// Downloaded pieces keyed by file offset
    output: BTreeMap<u64, FilePiece>,
    /// Next offset the writer may consume when ordered delivery is on
    next_output: u64,
    ordered: bool,
}

impl DirectBufferManager {
    pub fn new(size: u64, resume_pos: u64, connections: usize, ordered: bool) -> Self {
        Self {
            size,
            next_pos: resume_pos,
            retry: BTreeMap::new(),
            assigned: vec![None; connections],
            output: BTreeMap::new(),
            next_output: resume_pos,
            ordered,
        }
    }

    /// Next range for connection `i`: retry ranges first, then fresh bytes.
    /// Fresh ranges start at the pending position and extend over whole
    /// chunks until `max_req` is reached, clamped to the file size. Returns
    /// `None` when everything is assigned.
    pub fn next_range_for_connection(&mut self, i: usize, max_req: u64) -> Option<(u64, u64)> {
        debug_assert!(self.assigned[i].is_none(), "connection already has a range");

        if let Some((&start, &end)) = self.retry.iter().next() {
            self.retry.remove(&start);
            let take_end = if end - start > max_req {
                let cut = chunk_ceil(start, end);
                if cut < end {
                    self.retry.insert(cut, end);
                    cut
                } else {
                    end
                }
            } else {
                end
            };
            self.assigned[i] = Some((start, take_end));
            return Some((start, take_end));
        }

        if self.next_pos >= self.size {
            return None;
        }
        let start = self.next_pos;
        let mut end = chunk_ceil(start, self.size);
        while end - start < max_req && end < self.size {
            end = chunk_ceil(end, self.size);
        }
        self.next_pos = end;
        self.assigned[i] = Some((start, end));
        Some((start, end))
    }

    /// Returns connection `i`'s outstanding range to the retry pool.
    pub fn connection_failed(&mut self, i: usize) {
        if let Some((start, end)) = self.assigned[i].take() {
            self.retry.insert(start, end);
        }
    }

    /// Marks connection `i`'s range complete without producing output (PUT).
    pub fn connection_completed(&mut self, i: usize) {
        self.assigned[i] = None;
    }

    pub fn assigned_range(&self, i: usize) -> Option<(u64, u64)> {
        self.assigned[i]
    }

    /// Attaches a downloaded piece from connection `i` to the output queue.
    /// A short piece (shutdown flush, truncated body) returns the missing
    /// tail of the assigned range to the retry pool.
    pub fn submit_piece(&mut self, i: usize, piece: FilePiece) {
        if let Some((start, end)) = self.assigned[i].take() {
            debug_assert_eq!(piece.pos, start);
            let covered = piece.pos + piece.len();
            if covered < end {
                self.retry.insert(covered, end);
            }
        }
        if !piece.is_empty() {
            self.output.insert(piece.pos, piece);
        }
    }

    /// Next finalized piece the writer may consume. With ordered delivery a
    /// piece is held until its predecessor has been written.
    pub fn next_ready_piece(&mut self) -> Option<FilePiece> {
        let key = if self.ordered {
            let (&pos, piece) = self.output.iter().next()?;
            if pos != self.next_output || !piece.finalized {
                return None;
            }
            pos
        } else {
            let (&pos, _) = self.output.iter().find(|(_, p)| p.finalized)?;
            pos
        };
        self.output.remove(&key)
    }

    /// Puts a piece back into the queue (after the crypto worker returns it).
    pub fn store_piece(&mut self, piece: FilePiece) {
        self.output.insert(piece.pos, piece);
    }

    /// Releases a written piece. On success the ordered watermark advances;
    /// on failure the bytes return to the retry pool and will be
    /// re-requested.
    pub fn write_completed(&mut self, pos: u64, len: u64, ok: bool) {
        if ok {
            if self.ordered && pos == self.next_output {
                self.next_output = pos + len;
            }
        } else {
            self.retry.insert(pos, pos + len);
        }
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// All bytes assigned and written or handed over; nothing queued.
    pub fn exhausted(&self) -> bool {
        self.next_pos >= self.size
            && self.retry.is_empty()
            && self.output.is_empty()
            && self.assigned.iter().all(Option::is_none)
            && (!self.ordered || self.next_output >= self.size)
    }
}

/// The slot-facing buffer, in direct or RAID mode.
pub enum TransferBuffer {
    Direct(DirectBufferManager),
    Raid(RaidBufferManager),
}

impl TransferBuffer {
    pub fn is_raid(&self) -> bool {
        matches!(self, TransferBuffer::Raid(_))
    }

    pub fn as_direct_mut(&mut self) -> Option<&mut DirectBufferManager> {
        match self {
            TransferBuffer::Direct(m) => Some(m),
            TransferBuffer::Raid(_) => None,
        }
    }

    pub fn as_raid_mut(&mut self) -> Option<&mut RaidBufferManager> {
        match self {
            TransferBuffer::Raid(m) => Some(m),
            TransferBuffer::Direct(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SEGSIZE;

    fn piece(pos: u64, len: usize, finalized: bool) -> FilePiece {
        let mut p = FilePiece::new(pos, BytesMut::from(&vec![0u8; len][..]));
        p.finalized = finalized;
        p
    }

    #[test]
    fn ranges_follow_chunk_boundaries() {
        let mut m = DirectBufferManager::new(1 << 20, 0, 2, true);
        let (s0, e0) = m.next_range_for_connection(0, 512 * 1024).unwrap();
        assert_eq!(s0, 0);
        // 128K + 256K + 384K = 768K: the first boundary at or past 512K
        assert_eq!(e0, 786_432);
        let (s1, e1) = m.next_range_for_connection(1, 512 * 1024).unwrap();
        assert_eq!(s1, 786_432);
        assert_eq!(e1, 1 << 20);
    }

    #[test]
    fn small_file_single_range() {
        let mut m = DirectBufferManager::new(65_536, 0, 1, true);
        assert_eq!(m.next_range_for_connection(0, 4 << 20), Some((0, 65_536)));
        m.connection_completed(0);
        assert_eq!(m.next_range_for_connection(0, 4 << 20), None);
    }

    #[test]
    fn failed_connection_bytes_are_rerequested() {
        let mut m = DirectBufferManager::new(SEGSIZE * 3, 0, 2, true);
        let r0 = m.next_range_for_connection(0, SEGSIZE).unwrap();
        m.connection_failed(0);
        // The same range is served again before fresh bytes
        assert_eq!(m.next_range_for_connection(1, SEGSIZE), Some(r0));
    }

    #[test]
    fn ordered_output_holds_out_of_order_pieces() {
        let mut m = DirectBufferManager::new(65_536, 0, 4, true);
        for i in 0..4 {
            let r = m.next_range_for_connection(i, 16_384);
            assert!(r.is_some());
        }
        m.submit_piece(1, piece(16_384, 16_384, true));
        assert!(m.next_ready_piece().is_none());
        m.submit_piece(0, piece(0, 16_384, true));
        let first = m.next_ready_piece().unwrap();
        assert_eq!(first.pos, 0);
        // Predecessor not yet written: still held
        assert!(m.next_ready_piece().is_none());
        m.write_completed(0, 16_384, true);
        assert_eq!(m.next_ready_piece().unwrap().pos, 16_384);
    }

    #[test]
    fn unordered_output_releases_any_finalized_piece() {
        let mut m = DirectBufferManager::new(65_536, 0, 2, false);
        m.next_range_for_connection(0, 16_384);
        m.next_range_for_connection(1, 16_384);
        m.submit_piece(1, piece(16_384, 16_384, true));
        assert_eq!(m.next_ready_piece().unwrap().pos, 16_384);
    }

    #[test]
    fn failed_write_rerequests_bytes() {
        let mut m = DirectBufferManager::new(32_768, 0, 1, true);
        m.next_range_for_connection(0, 32_768);
        m.submit_piece(0, piece(0, 32_768, true));
        let p = m.next_ready_piece().unwrap();
        m.write_completed(p.pos, p.len(), false);
        assert_eq!(m.next_range_for_connection(0, 32_768), Some((0, 32_768)));
    }

    #[test]
    fn short_piece_returns_tail_to_retry_pool() {
        let mut m = DirectBufferManager::new(SEGSIZE, 0, 1, true);
        m.next_range_for_connection(0, SEGSIZE);
        // Only the first 16 KiB arrived before the connection died
        m.submit_piece(0, piece(0, 16_384, true));
        assert_eq!(
            m.next_range_for_connection(0, SEGSIZE),
            Some((16_384, SEGSIZE))
        );
    }

    #[test]
    fn resume_starts_past_completed_prefix() {
        let mut m = DirectBufferManager::new(1 << 20, 524_288, 1, true);
        let (start, _) = m.next_range_for_connection(0, 4 << 20).unwrap();
        assert_eq!(start, 524_288);
    }

    #[test]
    fn exhausted_after_all_written() {
        let mut m = DirectBufferManager::new(16_384, 0, 1, true);
        m.next_range_for_connection(0, 1 << 20);
        m.submit_piece(0, piece(0, 16_384, true));
        let p = m.next_ready_piece().unwrap();
        assert!(!m.exhausted());
        m.write_completed(p.pos, p.len(), true);
        assert!(m.exhausted());
    }
}
