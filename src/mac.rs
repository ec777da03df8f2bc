//! Per-chunk MAC bookkeeping and the mac-of-macs integrity fold

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chunk::{chunk_ceil, chunk_floor};
use crate::crypto::{BLOCK_SIZE, TransferCipher, condense_mac};

/// MAC state for one chunk.
///
/// `offset` is the number of chunk bytes folded into `mac` so far; partial
/// state occurs only for RAID downloads, where reassembled pieces do not
/// align with chunk boundaries. `finished` means the chunk is fully MAC'd
/// and its bytes are durably written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMac {
    pub mac: [u8; BLOCK_SIZE],
    pub offset: u64,
    pub finished: bool,
}

/// Ordered map from chunk-start offset to per-chunk MAC state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMacMap {
    entries: BTreeMap<u64, ChunkMac>,
}

impl ChunkMacMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fully computed MAC for the chunk starting at `pos`.
    pub fn insert(&mut self, pos: u64, mac: [u8; BLOCK_SIZE]) {
        self.entries.insert(
            pos,
            ChunkMac {
                mac,
                offset: 0,
                finished: false,
            },
        );
    }

    pub fn mark_finished(&mut self, pos: u64) {
        if let Some(entry) = self.entries.get_mut(&pos) {
            entry.finished = true;
        }
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.entries.contains_key(&pos)
    }

    pub fn get(&self, pos: u64) -> Option<&ChunkMac> {
        self.entries.get(&pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ChunkMac)> {
        self.entries.iter()
    }

    /// Merges completed uploader-local chunk MACs in, marking them finished.
    /// Entries already present keep their state.
    pub fn finished_upload_chunks(&mut self, other: &ChunkMacMap) {
        for (&pos, entry) in &other.entries {
            self.entries
                .entry(pos)
                .or_insert(*entry)
                .finished = true;
        }
    }

    /// Folds an in-order decrypted piece into per-chunk MAC state. Used by
    /// RAID downloads where pieces cross chunk boundaries; relies on pieces
    /// arriving in strictly ascending offset order (partial chunk state
    /// cannot be resumed out of order).
    pub fn update_with_piece(
        &mut self,
        cipher: &TransferCipher,
        ctriv: u64,
        pos: u64,
        plaintext: &[u8],
        file_size: u64,
    ) {
        let mut off = pos;
        let end = pos + plaintext.len() as u64;
        while off < end {
            let cstart = chunk_floor(off);
            let cend = chunk_ceil(cstart, file_size);
            let take = cend.min(end) - off;
            let entry = self.entries.entry(cstart).or_insert_with(|| {
                let mut mac = [0u8; BLOCK_SIZE];
                mac[..8].copy_from_slice(&ctriv.to_be_bytes());
                mac[8..].copy_from_slice(&ctriv.to_be_bytes());
                ChunkMac {
                    mac,
                    offset: 0,
                    finished: false,
                }
            });
            debug_assert_eq!(cstart + entry.offset, off, "piece folded out of order");
            let lo = (off - pos) as usize;
            cipher.chunk_mac_update(&mut entry.mac, &plaintext[lo..lo + take as usize]);
            entry.offset += take;
            if cstart + entry.offset == cend {
                entry.finished = true;
            }
            off += take;
        }
    }

    /// The mac-of-macs: XOR each chunk MAC into a zero accumulator and
    /// encrypt it with the transfer key, in offset order; the result is
    /// condensed to 64 bits.
    pub fn macsmac(&self, cipher: &TransferCipher) -> u64 {
        let mut acc = [0u8; BLOCK_SIZE];
        for entry in self.entries.values() {
            for (a, m) in acc.iter_mut().zip(entry.mac.iter()) {
                *a ^= *m;
            }
            cipher.encrypt_block(&mut acc);
        }
        condense_mac(&acc)
    }

    /// [`macsmac`](Self::macsmac) with the entries at indices
    /// `[a, b) ∪ [c, d)` omitted. Used for legacy MAC recovery.
    pub fn macsmac_gaps(&self, cipher: &TransferCipher, a: usize, b: usize, c: usize, d: usize) -> u64 {
        let mut acc = [0u8; BLOCK_SIZE];
        for (idx, entry) in self.entries.values().enumerate() {
            if (idx >= a && idx < b) || (idx >= c && idx < d) {
                continue;
            }
            for (x, m) in acc.iter_mut().zip(entry.mac.iter()) {
                *x ^= *m;
            }
            cipher.encrypt_block(&mut acc);
        }
        condense_mac(&acc)
    }

    /// Scans for a gap configuration under which the stored meta-MAC
    /// matches. Some legacy uploads recorded a MAC missing a few late
    /// chunks; when a single gap (last 96 entries, width up to 64) or a
    /// double gap (last 40 entries, widths up to 16) reproduces `metamac`,
    /// the downloaded data is authentic and the full MAC can be adopted.
    pub fn check_metamac_with_missing_late_entries(
        &self,
        cipher: &TransferCipher,
        metamac: u64,
    ) -> bool {
        let n = self.entries.len();
        if n == 0 {
            return false;
        }

        let window = n.min(96);
        for start1 in (n - window)..n {
            for len1 in 1..=64usize.min(n - start1) {
                if self.macsmac_gaps(cipher, start1, start1 + len1, n, n) == metamac {
                    return true;
                }
            }
        }

        let window = n.min(40);
        for start1 in (n - window)..n {
            for len1 in 1..=16usize.min(n - start1) {
                for start2 in (start1 + len1)..n {
                    for len2 in 1..=16usize.min(n - start2) {
                        if self.macsmac_gaps(cipher, start1, start1 + len1, start2, start2 + len2)
                            == metamac
                        {
                            return true;
                        }
                    }
                }
            }
        }

        false
    }

    /// Appends the wire form of the map: entry count (u32 LE) followed by
    /// `pos` (u64 LE), the 16 MAC bytes, `offset` (u64 LE), and the
    /// finished flag per entry.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (&pos, entry) in &self.entries {
            out.extend_from_slice(&pos.to_le_bytes());
            out.extend_from_slice(&entry.mac);
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.push(entry.finished as u8);
        }
    }

    /// Reads the wire form back, returning the map and the bytes consumed.
    /// Fails on short input.
    pub fn deserialize_from(buf: &[u8]) -> Option<(Self, usize)> {
        const ENTRY_LEN: usize = 8 + BLOCK_SIZE + 8 + 1;
        if buf.len() < 4 {
            return None;
        }
        let count = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        let total = 4 + count * ENTRY_LEN;
        if buf.len() < total {
            return None;
        }
        let mut entries = BTreeMap::new();
        let mut off = 4;
        for _ in 0..count {
            let pos = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            let mut mac = [0u8; BLOCK_SIZE];
            mac.copy_from_slice(&buf[off + 8..off + 24]);
            let offset = u64::from_le_bytes(buf[off + 24..off + 32].try_into().unwrap());
            let finished = buf[off + 32] != 0;
            entries.insert(
                pos,
                ChunkMac {
                    mac,
                    offset,
                    finished,
                },
            );
            off += ENTRY_LEN;
        }
        Some((Self { entries }, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SEGSIZE;

    fn cipher() -> TransferCipher {
        TransferCipher::new([0u8; 16])
    }

    fn map_with(n: usize) -> ChunkMacMap {
        let mut map = ChunkMacMap::new();
        let mut pos = 0;
        for i in 0..n {
            let mut mac = [0u8; 16];
            mac[0] = i as u8;
            mac[15] = (i * 7 + 1) as u8;
            map.insert(pos, mac);
            map.mark_finished(pos);
            pos = chunk_ceil(pos, u64::MAX);
        }
        map
    }

    #[test]
    fn empty_map_macs_to_zero() {
        assert_eq!(ChunkMacMap::new().macsmac(&cipher()), 0);
    }

    #[test]
    fn gaps_of_prefix_equal_suffix_mac() {
        // macsmac_gaps(m, 0, k, N, N) == macsmac(m[k..])
        let c = cipher();
        let map = map_with(12);
        let n = map.len();
        let offsets: Vec<u64> = map.iter().map(|(p, _)| *p).collect();
        for k in 0..=n {
            let mut suffix = ChunkMacMap::new();
            for &pos in &offsets[k..] {
                suffix.insert(pos, map.get(pos).unwrap().mac);
            }
            assert_eq!(map.macsmac_gaps(&c, 0, k, n, n), suffix.macsmac(&c), "k = {k}");
        }
    }

    #[test]
    fn recovers_single_late_gap() {
        let c = cipher();
        let map = map_with(10);
        let n = map.len();
        // Server recorded a MAC missing the next-to-last chunk
        let buggy = map.macsmac_gaps(&c, n - 2, n - 1, n, n);
        assert_ne!(buggy, map.macsmac(&c));
        assert!(map.check_metamac_with_missing_late_entries(&c, buggy));
    }

    #[test]
    fn recovers_double_gap() {
        let c = cipher();
        let map = map_with(9);
        let n = map.len();
        let buggy = map.macsmac_gaps(&c, n - 5, n - 4, n - 2, n - 1);
        assert!(map.check_metamac_with_missing_late_entries(&c, buggy));
    }

    #[test]
    fn rejects_unrelated_mac() {
        let c = cipher();
        let map = map_with(6);
        assert!(!map.check_metamac_with_missing_late_entries(&c, 0xDEAD_BEEF_DEAD_BEEF));
    }

    #[test]
    fn upload_merge_marks_finished() {
        let mut transfer_macs = ChunkMacMap::new();
        let mut pending = ChunkMacMap::new();
        pending.insert(0, [1u8; 16]);
        pending.insert(SEGSIZE, [2u8; 16]);
        transfer_macs.finished_upload_chunks(&pending);
        assert!(transfer_macs.get(0).unwrap().finished);
        assert!(transfer_macs.get(SEGSIZE).unwrap().finished);
        assert_eq!(transfer_macs.len(), 2);
    }

    #[test]
    fn piece_folding_matches_whole_chunk_mac() {
        let c = cipher();
        let ctriv = 77;
        let size = SEGSIZE + 100;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let mut whole = ChunkMacMap::new();
        whole.insert(0, c.chunk_mac(&data[..SEGSIZE as usize], ctriv));
        whole.mark_finished(0);
        whole.insert(SEGSIZE, c.chunk_mac(&data[SEGSIZE as usize..], ctriv));
        whole.mark_finished(SEGSIZE);

        // Fold the same plaintext as raid-line sized pieces (80 bytes)
        let mut folded = ChunkMacMap::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let end = (pos + 4000).min(data.len());
            folded.update_with_piece(&c, ctriv, pos as u64, &data[pos..end], size);
            pos = end;
        }

        assert_eq!(folded.get(0).unwrap().mac, whole.get(0).unwrap().mac);
        assert_eq!(
            folded.get(SEGSIZE).unwrap().mac,
            whole.get(SEGSIZE).unwrap().mac
        );
        assert!(folded.get(0).unwrap().finished);
        assert!(folded.get(SEGSIZE).unwrap().finished);
        assert_eq!(folded.macsmac(&c), whole.macsmac(&c));
    }

    #[test]
    fn serialization_round_trip() {
        let mut map = map_with(5);
        map.update_with_piece(&cipher(), 3, 4_718_592, &[9u8; 80], 64 << 20);
        let mut out = Vec::new();
        map.serialize_into(&mut out);
        let (back, consumed) = ChunkMacMap::deserialize_from(&out).unwrap();
        assert_eq!(consumed, out.len());
        assert_eq!(back, map);
        // Short input is rejected
        assert!(ChunkMacMap::deserialize_from(&out[..out.len() - 1]).is_none());
    }
}
