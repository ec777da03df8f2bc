//! File fingerprinting: size + mtime + sparse CRC identity

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Number of CRC words in a fingerprint.
pub const CRC_WORDS: usize = 4;

/// Bytes hashed per sampled block.
const CRC_BLOCK: usize = 4096;

/// Identity of a local file: size, modification time, and four CRC32 words
/// over sampled content. Two files with equal fingerprints are treated as
/// the same content by the transfer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: i64,
    pub mtime: i64,
    pub crc: [u32; CRC_WORDS],
}

impl FileFingerprint {
    /// Computes the fingerprint of an on-disk file. Small files hash their
    /// quarters; larger files hash four 4 KiB blocks spread evenly across
    /// the content.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let size = meta.len();
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut crc = [0u32; CRC_WORDS];
        let mut file = fs::File::open(path)?;

        if size == 0 {
            // all-zero CRC
        } else if size <= (CRC_WORDS * CRC_BLOCK) as u64 {
            let mut content = Vec::with_capacity(size as usize);
            file.read_to_end(&mut content)?;
            let quarter = content.len().div_ceil(CRC_WORDS);
            for (i, word) in crc.iter_mut().enumerate() {
                let lo = (i * quarter).min(content.len());
                let hi = ((i + 1) * quarter).min(content.len());
                *word = crc32fast::hash(&content[lo..hi]);
            }
        } else {
            let mut block = vec![0u8; CRC_BLOCK];
            let span = size - CRC_BLOCK as u64;
            for (i, word) in crc.iter_mut().enumerate() {
                let offset = span * i as u64 / (CRC_WORDS - 1) as u64;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut block)?;
                *word = crc32fast::hash(&block);
            }
        }

        Ok(Self {
            size: size as i64,
            mtime,
            crc,
        })
    }

    /// The 16 CRC bytes as stored in the serialized file record
    /// (big-endian words).
    pub fn crc_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.crc.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn from_crc_bytes(size: i64, mtime: i64, bytes: &[u8; 16]) -> Self {
        let mut crc = [0u32; CRC_WORDS];
        for (i, word) in crc.iter_mut().enumerate() {
            *word = u32::from_be_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self { size, mtime, crc }
    }

    /// Stable cache key for the persistent transfer table.
    pub fn cache_key(&self) -> String {
        format!(
            "{:016x}{:016x}{:08x}{:08x}{:08x}{:08x}",
            self.size as u64, self.mtime as u64, self.crc[0], self.crc[1], self.crc[2], self.crc[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn identical_content_same_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let payload = vec![0x3Cu8; 100_000];
        fs::write(&a, &payload).unwrap();
        fs::write(&b, &payload).unwrap();

        let fa = FileFingerprint::from_file(&a).unwrap();
        let fb = FileFingerprint::from_file(&b).unwrap();
        assert_eq!(fa.size, 100_000);
        assert_eq!(fa.crc, fb.crc);
    }

    #[test]
    fn content_change_flips_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        let mut payload = vec![0u8; 50_000];
        fs::write(&path, &payload).unwrap();
        let before = FileFingerprint::from_file(&path).unwrap();

        payload[0] = 0xFF;
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(&payload).unwrap();
        drop(f);
        let after = FileFingerprint::from_file(&path).unwrap();
        assert_ne!(before.crc, after.crc);
    }

    #[test]
    fn crc_bytes_round_trip() {
        let fp = FileFingerprint {
            size: 1234,
            mtime: 99,
            crc: [1, 2, 0xDEADBEEF, 4],
        };
        let back = FileFingerprint::from_crc_bytes(1234, 99, &fp.crc_bytes());
        assert_eq!(back, fp);
    }

    #[test]
    fn empty_file_is_all_zero_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        let fp = FileFingerprint::from_file(&path).unwrap();
        assert_eq!(fp.size, 0);
        assert_eq!(fp.crc, [0; 4]);
    }
}
