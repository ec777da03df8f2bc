//! Six-part striped download reassembly
//!
//! A RAID download spreads the ciphertext over six storage parts. Each
//! stripe line holds 80 data bytes: five 16-byte sectors on parts 1..=5
//! (sector `s` of line `L` lives in part `s + 1` at part-offset `L * 16`)
//! and an XOR parity sector on part 0. Any five parts recover a line, so
//! one slow or failed source can be tolerated; a second failure is fatal.

use bytes::BytesMut;
use tracing::{debug, info};

use crate::buffer::FilePiece;

/// Number of storage parts per RAID transfer.
pub const RAIDPARTS: usize = 6;

/// Sector length per part per line.
pub const RAIDSECTOR: u64 = 16;

/// Data bytes per stripe line.
pub const RAIDLINE: u64 = (RAIDPARTS as u64 - 1) * RAIDSECTOR;

/// How far the other parts must be ahead before one counts as the slow one.
pub const RAID_LAG_THRESHOLD: u64 = 65_536;

/// Reassembly buffer for one RAID download.
pub struct RaidBufferManager {
    file_size: u64,
    /// Next part-offset to hand out per part
    part_req_pos: [u64; RAIDPARTS],
    /// Received, unconsumed bytes per part
    part_data: [BytesMut; RAIDPARTS],
    /// Part-offset of the first unconsumed byte per part
    part_front: [u64; RAIDPARTS],
    /// File offset assembled so far
    assembled: u64,
    /// Assembled ciphertext not yet emitted as a piece
    scratch: BytesMut,
    /// File offset of `scratch[0]`
    scratch_pos: u64,
    /// Permanently abandoned part, if any
    bad_part: Option<usize>,
    recovery_used: bool,
}

impl RaidBufferManager {
    /// `resume_pos` is rounded down to a stripe-line boundary; the caller
    /// discards the re-emitted prefix up to its durable watermark.
    pub fn new(file_size: u64, resume_pos: u64) -> Self {
        let start = resume_pos / RAIDLINE * RAIDLINE;
        let front = start / RAIDLINE * RAIDSECTOR;
        Self {
            file_size,
            part_req_pos: [front; RAIDPARTS],
            part_data: std::array::from_fn(|_| BytesMut::new()),
            part_front: [front; RAIDPARTS],
            assembled: start,
            scratch: BytesMut::new(),
            scratch_pos: start,
            bad_part: None,
            recovery_used: false,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn bad_part(&self) -> Option<usize> {
        self.bad_part
    }

    /// Length of part `part` on the wire for this file.
    pub fn part_size(&self, part: usize) -> u64 {
        let full_lines = self.file_size / RAIDLINE;
        let residual = self.file_size % RAIDLINE;
        if part == 0 {
            // parity: one full sector per (possibly partial) line
            full_lines * RAIDSECTOR + if residual > 0 { RAIDSECTOR } else { 0 }
        } else {
            let tail = residual.saturating_sub((part as u64 - 1) * RAIDSECTOR);
            full_lines * RAIDSECTOR + tail.min(RAIDSECTOR)
        }
    }

    fn delivered(&self, part: usize) -> u64 {
        self.part_front[part] + self.part_data[part].len() as u64
    }

    /// Next part-offset range to request for `part`; `None` when the part is
    /// exhausted or abandoned.
    pub fn next_range_for_part(&mut self, part: usize, max_req: u64) -> Option<(u64, u64)> {
        if self.bad_part == Some(part) {
            return None;
        }
        let psize = self.part_size(part);
        let start = self.part_req_pos[part];
        if start >= psize {
            return None;
        }
        let end = (start + max_req).min(psize);
        self.part_req_pos[part] = end;
        Some((start, end))
    }

    /// Rewinds `part`'s request position to what has actually been
    /// delivered; called after its connection is disconnected.
    pub fn reset_part(&mut self, part: usize) {
        self.part_req_pos[part] = self.delivered(part);
    }

    /// Buffers bytes received for `part` starting at `part_offset`. Data
    /// below the consumption watermark (a sector already recovered by XOR)
    /// is dropped.
    pub fn submit_part_data(&mut self, part: usize, part_offset: u64, data: &[u8]) {
        if self.bad_part == Some(part) || data.is_empty() {
            return;
        }
        let have = self.delivered(part);
        let end = part_offset + data.len() as u64;
        if end <= have {
            return;
        }
        let skip = have.saturating_sub(part_offset) as usize;
        debug_assert!(
            part_offset <= have,
            "part data arrived with a hole (offset {part_offset}, delivered {have})"
        );
        self.part_data[part].extend_from_slice(&data[skip..]);
    }

    /// Assembles every stripe line for which enough sectors are buffered,
    /// appending recovered bytes to the scratch output.
    pub fn assemble(&mut self) {
        while self.assembled < self.file_size {
            if !self.assemble_line() {
                break;
            }
        }
    }

    fn assemble_line(&mut self) -> bool {
        let line = self.assembled / RAIDLINE;
        let sec_off = line * RAIDSECTOR;
        let line_len = (self.file_size - self.assembled).min(RAIDLINE);

        let mut sectors: [Option<[u8; RAIDSECTOR as usize]>; RAIDPARTS] = [None; RAIDPARTS];
        let mut missing = RAIDPARTS;

        for part in 0..RAIDPARTS {
            if self.bad_part == Some(part) {
                continue;
            }
            let avail = self.part_size(part).saturating_sub(sec_off).min(RAIDSECTOR);
            if avail == 0 {
                // part ends before this line; contributes an all-zero sector
                sectors[part] = Some([0u8; RAIDSECTOR as usize]);
                missing -= 1;
                continue;
            }
            if self.delivered(part) >= sec_off + avail {
                let lo = (sec_off - self.part_front[part]) as usize;
                let mut sector = [0u8; RAIDSECTOR as usize];
                sector[..avail as usize]
                    .copy_from_slice(&self.part_data[part][lo..lo + avail as usize]);
                sectors[part] = Some(sector);
                missing -= 1;
            }
        }

        let required_absent = if self.bad_part.is_some() { 1 } else { 0 };
        if missing > 1 + required_absent {
            return false;
        }
        if missing == 1 + required_absent {
            // exactly one buffered sector absent: recover it by XOR
            let absent = (0..RAIDPARTS)
                .find(|&p| self.bad_part != Some(p) && sectors[p].is_none())
                .unwrap();
            let mut recovered = [0u8; RAIDSECTOR as usize];
            for (p, sector) in sectors.iter().enumerate() {
                if p == absent {
                    continue;
                }
                if let Some(s) = sector {
                    for (r, b) in recovered.iter_mut().zip(s.iter()) {
                        *r ^= *b;
                    }
                } else if let Some(bad) = self.bad_part {
                    debug_assert_eq!(p, bad);
                    // the abandoned part is itself recovered from the others
                    return false;
                }
            }
            sectors[absent] = Some(recovered);
        }
        if let Some(bad) = self.bad_part {
            // rebuild the abandoned part's sector from the five others
            let mut recovered = [0u8; RAIDSECTOR as usize];
            for (p, sector) in sectors.iter().enumerate() {
                if p == bad {
                    continue;
                }
                let s = match sector {
                    Some(s) => s,
                    None => return false,
                };
                for (r, b) in recovered.iter_mut().zip(s.iter()) {
                    *r ^= *b;
                }
            }
            sectors[bad] = Some(recovered);
        }

        // Emit the data sectors (parts 1..=5) clamped to the file size
        let mut remaining = line_len;
        for part in 1..RAIDPARTS {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(RAIDSECTOR) as usize;
            self.scratch
                .extend_from_slice(&sectors[part].unwrap()[..take]);
            remaining -= take as u64;
        }

        // Consume buffered sectors and advance every front in lockstep
        for part in 0..RAIDPARTS {
            if self.bad_part == Some(part) {
                continue;
            }
            let avail = self.part_size(part).saturating_sub(sec_off).min(RAIDSECTOR);
            let buffered = self.delivered(part) >= sec_off + avail && avail > 0;
            if buffered {
                let _ = self.part_data[part].split_to(avail as usize);
            } else {
                // a partial sector superseded by XOR recovery is obsolete
                self.part_data[part].clear();
            }
            self.part_front[part] = sec_off + avail;
            if !buffered && self.part_req_pos[part] < self.part_front[part] {
                // sector was recovered before this part delivered it; never
                // re-request the obsolete bytes
                self.part_req_pos[part] = self.part_front[part];
            }
        }

        self.assembled += line_len;
        true
    }

    /// Takes an output piece once at least `min_len` bytes are assembled, or
    /// whatever remains once the file is fully assembled.
    pub fn take_piece(&mut self, min_len: u64) -> Option<FilePiece> {
        if self.scratch.is_empty() {
            return None;
        }
        if (self.scratch.len() as u64) < min_len && self.assembled < self.file_size {
            return None;
        }
        let buf = self.scratch.split();
        let piece = FilePiece::new(self.scratch_pos, buf);
        self.scratch_pos += piece.len();
        Some(piece)
    }

    /// Bytes sitting in part buffers and scratch, counted into progress.
    pub fn bytes_in_reassembly(&self) -> u64 {
        self.scratch.len() as u64
            + self
                .part_data
                .iter()
                .map(|d| d.len() as u64)
                .sum::<u64>()
    }

    /// Flags the one part whose data lags the current stripe while the five
    /// others have advanced past it by [`RAID_LAG_THRESHOLD`]. Only
    /// meaningful while all six parts are still in use.
    pub fn detect_slowest_part(&self) -> Option<usize> {
        if self.bad_part.is_some() {
            return None;
        }
        let sec_off = (self.assembled / RAIDLINE) * RAIDSECTOR;
        let mut lagging = None;
        for part in 0..RAIDPARTS {
            let psize = self.part_size(part);
            let target = (sec_off + RAID_LAG_THRESHOLD).min(psize);
            if self.delivered(part) < target {
                if self.delivered(part) + RAID_LAG_THRESHOLD <= target {
                    match lagging {
                        None => lagging = Some(part),
                        Some(_) => return None, // more than one slow part
                    }
                } else {
                    return None; // the others have not advanced far enough
                }
            }
        }
        if let Some(part) = lagging {
            debug!(target: "raid", part, "Detected lagging raid part");
        }
        lagging
    }

    /// Switches reassembly to five-part mode without `failed`. Allowed once
    /// per transfer; returns `false` when the budget is spent.
    pub fn try_raid_error_recovery(&mut self, failed: usize) -> bool {
        if self.bad_part == Some(failed) {
            return true;
        }
        if self.recovery_used {
            return false;
        }
        info!(target: "raid", part = failed, "Switching to five-part reassembly");
        self.recovery_used = true;
        self.bad_part = Some(failed);
        self.part_data[failed].clear();
        self.assemble();
        true
    }

    /// Whether every line has been assembled and emitted.
    pub fn exhausted(&self) -> bool {
        self.assembled >= self.file_size && self.scratch.is_empty()
    }
}

/// Splits a ciphertext stream into the six wire parts (test fixture).
#[cfg(test)]
pub(crate) fn split_into_parts(data: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = vec![Vec::new(); RAIDPARTS];
    let mut pos = 0usize;
    while pos < data.len() {
        let line = &data[pos..(pos + RAIDLINE as usize).min(data.len())];
        let mut parity = [0u8; RAIDSECTOR as usize];
        for s in 0..(RAIDPARTS - 1) {
            let lo = s * RAIDSECTOR as usize;
            if lo >= line.len() {
                break;
            }
            let sector = &line[lo..(lo + RAIDSECTOR as usize).min(line.len())];
            parts[s + 1].extend_from_slice(sector);
            for (p, b) in parity.iter_mut().zip(sector.iter()) {
                *p ^= *b;
            }
        }
        parts[0].extend_from_slice(&parity);
        pos += RAIDLINE as usize;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn drain(m: &mut RaidBufferManager) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(piece) = m.take_piece(0) {
            assert_eq!(piece.pos as usize, out.len());
            out.extend_from_slice(&piece.buf);
        }
        out
    }

    #[test]
    fn part_sizes_sum_to_data_plus_parity() {
        for size in [0u64, 1, 79, 80, 81, 160, 4096, 100_000] {
            let m = RaidBufferManager::new(size, 0);
            let data: u64 = (1..RAIDPARTS).map(|p| m.part_size(p)).sum();
            assert_eq!(data, size, "size {size}");
            let lines = size.div_ceil(RAIDLINE);
            assert_eq!(m.part_size(0), lines * RAIDSECTOR);
        }
    }

    #[test]
    fn six_part_reassembly_round_trip() {
        let data = payload(100_000);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(data.len() as u64, 0);
        for (p, bytes) in parts.iter().enumerate() {
            m.submit_part_data(p, 0, bytes);
        }
        m.assemble();
        assert_eq!(drain(&mut m), data);
        assert!(m.exhausted());
    }

    #[test]
    fn five_parts_suffice_via_xor() {
        let data = payload(8_000);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(data.len() as u64, 0);
        // part 3 never arrives
        for (p, bytes) in parts.iter().enumerate() {
            if p != 3 {
                m.submit_part_data(p, 0, bytes);
            }
        }
        m.assemble();
        assert_eq!(drain(&mut m), data);
    }

    #[test]
    fn failed_part_recovery_is_single_use() {
        let data = payload(1_000);
        let mut m = RaidBufferManager::new(data.len() as u64, 0);
        assert!(m.try_raid_error_recovery(4));
        assert!(m.try_raid_error_recovery(4), "same part is idempotent");
        assert!(!m.try_raid_error_recovery(2), "second part failure is fatal");
    }

    #[test]
    fn recovery_completes_with_remaining_five() {
        let data = payload(50_000);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(data.len() as u64, 0);
        // part 1 fails on its first byte
        assert!(m.try_raid_error_recovery(1));
        assert_eq!(m.next_range_for_part(1, 1 << 20), None);
        for (p, bytes) in parts.iter().enumerate() {
            if p != 1 {
                m.submit_part_data(p, 0, bytes);
            }
        }
        m.assemble();
        assert_eq!(drain(&mut m), data);
    }

    #[test]
    fn late_sixth_part_data_is_discarded() {
        let data = payload(4_000);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(data.len() as u64, 0);
        for (p, bytes) in parts.iter().enumerate() {
            if p != 5 {
                m.submit_part_data(p, 0, bytes);
            }
        }
        m.assemble();
        let out = drain(&mut m);
        assert_eq!(out, data);
        // the straggler shows up afterwards; its bytes are obsolete
        m.submit_part_data(5, 0, &parts[5]);
        m.assemble();
        assert!(m.take_piece(0).is_none());
        assert_eq!(m.next_range_for_part(5, 1 << 20), None);
    }

    #[test]
    fn slow_part_is_detected_once_others_advance() {
        let size = 1_000_000u64;
        let data = payload(size as usize);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(size, 0);
        // part 4 stalls after 128 bytes; the others deliver everything
        for (p, bytes) in parts.iter().enumerate() {
            if p == 4 {
                m.submit_part_data(p, 0, &bytes[..128]);
            } else {
                m.submit_part_data(p, 0, bytes);
            }
        }
        m.assemble();
        assert_eq!(m.detect_slowest_part(), Some(4));

        // after recovery the download completes without part 4
        assert!(m.try_raid_error_recovery(4));
        assert_eq!(drain(&mut m), data);
    }

    #[test]
    fn no_detection_when_two_parts_lag() {
        let size = 1_000_000u64;
        let data = payload(size as usize);
        let parts = split_into_parts(&data);
        let mut m = RaidBufferManager::new(size, 0);
        for (p, bytes) in parts.iter().enumerate() {
            if p == 2 || p == 4 {
                continue;
            }
            m.submit_part_data(p, 0, bytes);
        }
        m.assemble();
        assert_eq!(m.detect_slowest_part(), None);
    }

    #[test]
    fn ranges_are_capped_and_sequential() {
        let mut m = RaidBufferManager::new(1_000_000, 0);
        let psize = m.part_size(2);
        let (s, e) = m.next_range_for_part(2, 65_536).unwrap();
        assert_eq!((s, e), (0, 65_536));
        let (s, e) = m.next_range_for_part(2, 1 << 20).unwrap();
        assert_eq!((s, e), (65_536, psize));
        assert_eq!(m.next_range_for_part(2, 1 << 20), None);
        // a disconnect rewinds to what was actually delivered
        m.submit_part_data(2, 0, &vec![0u8; 70_000]);
        m.reset_part(2);
        assert_eq!(m.next_range_for_part(2, 1 << 20), Some((70_000, psize)));
    }

    #[test]
    fn odd_size_final_line_round_trip() {
        for size in [1usize, 15, 16, 17, 79, 81, 4097] {
            let data = payload(size);
            let parts = split_into_parts(&data);
            let mut m = RaidBufferManager::new(size as u64, 0);
            for (p, bytes) in parts.iter().enumerate() {
                if p != 0 {
                    m.submit_part_data(p, 0, bytes);
                }
            }
            m.assemble();
            assert_eq!(drain(&mut m), data, "size {size}");
        }
    }
}
