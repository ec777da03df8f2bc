//! Per-file transfer descriptor and its persisted wire form

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::chunk::chunk_ceil;
use crate::crypto::{TransferCipher, build_file_key};
use crate::error::TransferError;
use crate::fingerprint::FileFingerprint;
use crate::mac::ChunkMacMap;
use crate::raid::RAIDPARTS;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Get,
    Put,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Get => "get",
            Direction::Put => "put",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "get" => Some(Direction::Get),
            "put" => Some(Direction::Put),
            _ => None,
        }
    }
}

/// New-format upload token length.
pub const UPLOAD_TOKEN_LEN: usize = 36;

/// Legacy upload token length after base64 decoding.
pub const UPLOAD_TOKEN_LEN_LEGACY: usize = 27;

/// A local file attached to a transfer: the sink a download lands in, or
/// the source a upload reads from. Serialized bit-exactly (see
/// [`FileSink::serialize`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSink {
    pub localname: String,
    pub node_handle: [u8; 6],
    pub parent_dbid: u32,
    pub fsid: u64,
    /// Present for files; folders carry no content identity
    pub fingerprint: Option<FileFingerprint>,
    pub syncable: bool,
    pub shortname: Option<String>,
}

impl FileSink {
    pub fn for_file(localname: impl Into<String>, fingerprint: FileFingerprint) -> Self {
        Self {
            localname: localname.into(),
            node_handle: [0; 6],
            parent_dbid: 0,
            fsid: 0,
            fingerprint: Some(fingerprint),
            syncable: true,
            shortname: None,
        }
    }

    /// Fixed wire layout: `size` (i64 LE, -1 for folders), `fsid` (u64 LE),
    /// parent dbid (u32 LE), node handle (6 bytes), localname (u16 LE
    /// length + bytes), then for files the 16 CRC bytes and mtime
    /// (varint64), `syncable` (u8), a one-byte expansion header whose value
    /// counts extension bytes to skip, and an optional shortname.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let size = self.fingerprint.map(|f| f.size).unwrap_or(-1);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.fsid.to_le_bytes());
        out.extend_from_slice(&self.parent_dbid.to_le_bytes());
        out.extend_from_slice(&self.node_handle);
        put_string(&mut out, &self.localname);
        if let Some(fp) = &self.fingerprint {
            out.extend_from_slice(&fp.crc_bytes());
            put_varint64(&mut out, fp.mtime as u64);
        }
        out.push(self.syncable as u8);
        out.push(0); // expansion bytes
        if let Some(shortname) = &self.shortname {
            put_string(&mut out, shortname);
        }
        out
    }

    /// Parses a standalone record. Short input fails; trailing bytes after
    /// the optional shortname fail.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        let mut r = Reader::new(buf);
        let size = r.i64_le()?;
        let fsid = r.u64_le()?;
        let parent_dbid = r.u32_le()?;
        let mut node_handle = [0u8; 6];
        node_handle.copy_from_slice(r.take(6)?);
        let localname = r.string()?;
        let fingerprint = if size >= 0 {
            let mut crc = [0u8; 16];
            crc.copy_from_slice(r.take(16)?);
            let mtime = r.varint64()? as i64;
            Some(FileFingerprint::from_crc_bytes(size, mtime, &crc))
        } else {
            None
        };
        let syncable = r.u8()? != 0;
        let expansion = r.u8()? as usize;
        r.take(expansion)?;
        let shortname = if r.remaining() > 0 {
            Some(r.string()?)
        } else {
            None
        };
        if r.remaining() > 0 {
            return None;
        }
        Some(Self {
            localname,
            node_handle,
            parent_dbid,
            fsid,
            fingerprint,
            syncable,
            shortname,
        })
    }
}

/// Per-file transfer descriptor.
///
/// Persisted to the transfer cache so an interrupted transfer resumes from
/// `progresscompleted`; destroyed after the success callback or a fatal
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: Direction,
    pub fingerprint: FileFingerprint,
    pub size: u64,
    pub transferkey: [u8; 16],
    pub ctriv: u64,
    /// Expected mac-of-macs for downloads; computed and stored for uploads
    pub metamac: u64,
    /// Next byte to schedule
    pub pos: u64,
    /// Bytes durably done from the start of the file
    pub progresscompleted: u64,
    /// Watermark for the contiguous-progress walk; not persisted
    progresscontiguous: u64,
    pub chunkmacs: ChunkMacMap,
    /// Opaque upload-completion token once a PUT finishes
    pub ultoken: Option<Vec<u8>>,
    pub files: Vec<FileSink>,
    /// Pre-fetched temporary URLs: six for RAID, one otherwise. Transient.
    pub urls: Vec<String>,
}

impl Transfer {
    pub fn new(
        direction: Direction,
        fingerprint: FileFingerprint,
        transferkey: [u8; 16],
        ctriv: u64,
        metamac: u64,
        sink: FileSink,
        urls: Vec<String>,
    ) -> Self {
        Self {
            direction,
            fingerprint,
            size: fingerprint.size.max(0) as u64,
            transferkey,
            ctriv,
            metamac,
            pos: 0,
            progresscompleted: 0,
            progresscontiguous: 0,
            chunkmacs: ChunkMacMap::new(),
            ultoken: None,
            files: vec![sink],
            urls,
        }
    }

    pub fn cipher(&self) -> TransferCipher {
        TransferCipher::new(self.transferkey)
    }

    /// Downloads spread over the six-part scheme carry one URL per part.
    pub fn is_raid(&self) -> bool {
        self.direction == Direction::Get && self.urls.len() == RAIDPARTS
    }

    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.files[0].localname)
    }

    /// Stable key for the persistent cache table.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.direction.as_str(), self.fingerprint.cache_key())
    }

    /// Advances `progresscompleted` across contiguous finished chunks.
    /// Chunk MACs are merged on the scheduler task at durable-write time,
    /// so the walk never observes an out-of-order merge.
    pub fn update_contiguous_progress(&mut self) {
        let mut p = self.progresscontiguous;
        while p < self.size {
            match self.chunkmacs.get(p) {
                Some(entry) if entry.finished => p = chunk_ceil(p, self.size),
                _ => break,
            }
        }
        self.progresscontiguous = p;
        debug_assert!(p >= self.progresscompleted);
        self.progresscompleted = p;
        if self.pos < p {
            self.pos = p;
        }
    }

    /// Verifies the mac-of-macs after a download. A mismatch first runs the
    /// legacy gap scan; when that matches, the recomputed MAC is adopted.
    /// Otherwise the chunk MACs are cleared so a restart re-downloads.
    pub fn verify_download_mac(&mut self) -> Result<(), TransferError> {
        let cipher = self.cipher();
        let computed = self.chunkmacs.macsmac(&cipher);
        if computed == self.metamac {
            return Ok(());
        }
        if self
            .chunkmacs
            .check_metamac_with_missing_late_entries(&cipher, self.metamac)
        {
            self.metamac = computed;
            return Ok(());
        }
        self.chunkmacs.clear();
        Err(TransferError::Key)
    }

    /// Final file key for a completed upload, sent with the upload token.
    pub fn finalize_upload_key(&mut self) -> [u8; 32] {
        self.metamac = self.chunkmacs.macsmac(&self.cipher());
        build_file_key(&self.transferkey, self.ctriv, self.metamac)
    }

    /// Serialized cache form: key, ctriv, metamac, positions, chunk MACs,
    /// upload token, and the attached file records (each length-prefixed;
    /// the records themselves use the fixed layout).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.transferkey);
        out.extend_from_slice(&self.ctriv.to_le_bytes());
        out.extend_from_slice(&self.metamac.to_le_bytes());
        put_varint64(&mut out, self.size);
        put_varint64(&mut out, self.pos);
        put_varint64(&mut out, self.progresscompleted);
        self.chunkmacs.serialize_into(&mut out);
        match &self.ultoken {
            Some(token) => {
                out.push(token.len() as u8);
                out.extend_from_slice(token);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.files.len() as u16).to_le_bytes());
        for sink in &self.files {
            let record = sink.serialize();
            out.extend_from_slice(&(record.len() as u32).to_le_bytes());
            out.extend_from_slice(&record);
        }
        out
    }

    /// Restores a transfer from its cache form. Rejects short input and
    /// trailing data.
    pub fn deserialize(direction: Direction, buf: &[u8]) -> Option<Self> {
        let mut r = Reader::new(buf);
        let mut transferkey = [0u8; 16];
        transferkey.copy_from_slice(r.take(16)?);
        let ctriv = r.u64_le()?;
        let metamac = r.u64_le()?;
        let size = r.varint64()?;
        let pos = r.varint64()?;
        let progresscompleted = r.varint64()?;
        let (chunkmacs, consumed) = ChunkMacMap::deserialize_from(r.rest())?;
        r.take(consumed)?;
        let token_len = r.u8()? as usize;
        let ultoken = if token_len > 0 {
            Some(r.take(token_len)?.to_vec())
        } else {
            None
        };
        let file_count = r.u16_le()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let record_len = r.u32_le()? as usize;
            let record = r.take(record_len)?;
            files.push(FileSink::deserialize(record)?);
        }
        if r.remaining() > 0 || files.is_empty() {
            return None;
        }
        let fingerprint = files[0].fingerprint?;
        Some(Self {
            direction,
            fingerprint,
            size,
            transferkey,
            ctriv,
            metamac,
            pos,
            progresscompleted,
            progresscontiguous: progresscompleted,
            chunkmacs,
            ultoken,
            files,
            urls: Vec::new(),
        })
    }
}

/// Validates a PUT response body: a 36-byte token, a 36-character base64
/// form decoding to 27 bytes (legacy), or a numeric server error.
pub fn parse_upload_token(body: &[u8]) -> Result<Vec<u8>, TransferError> {
    let text = std::str::from_utf8(body).ok();
    if let Some(code) = text.and_then(|t| t.trim().parse::<i64>().ok()) {
        return Err(match code {
            -3 => TransferError::again(),
            _ => TransferError::Internal(format!("upload rejected (server code {code})")),
        });
    }
    if let Some(decoded) = text.and_then(|t| BASE64.decode(t.trim()).ok())
        && decoded.len() == UPLOAD_TOKEN_LEN_LEGACY
    {
        return Ok(decoded);
    }
    if body.len() == UPLOAD_TOKEN_LEN {
        return Ok(body.to_vec());
    }
    Err(TransferError::Internal(format!(
        "missing or malformed upload token ({} bytes)",
        body.len()
    )))
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Varint64: one count byte followed by that many little-endian payload
/// bytes. Counts above 8 are invalid.
fn put_varint64(out: &mut Vec<u8>, value: u64) {
    let bytes = value.to_le_bytes();
    let count = (8 - value.leading_zeros() as usize / 8).min(8);
    out.push(count as u8);
    out.extend_from_slice(&bytes[..count]);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32_le(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64_le(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64_le(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn varint64(&mut self) -> Option<u64> {
        let count = self.u8()? as usize;
        if count > 8 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes[..count].copy_from_slice(self.take(count)?);
        Some(u64::from_le_bytes(bytes))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u16_le()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SEGSIZE;

    fn fingerprint() -> FileFingerprint {
        FileFingerprint {
            size: 1_000_000,
            mtime: 1_700_000_000,
            crc: [0x11111111, 0x22222222, 0x33333333, 0x44444444],
        }
    }

    fn sample_transfer() -> Transfer {
        let sink = FileSink {
            localname: "photos/holiday.jpg".into(),
            node_handle: [1, 2, 3, 4, 5, 6],
            parent_dbid: 42,
            fsid: 0xABCDEF,
            fingerprint: Some(fingerprint()),
            syncable: true,
            shortname: Some("HOLIDA~1.JPG".into()),
        };
        let mut t = Transfer::new(
            Direction::Get,
            fingerprint(),
            [7u8; 16],
            0xDEAD,
            0xBEEF,
            sink,
            vec!["https://storage.example.com/dl/x".into()],
        );
        t.pos = 393_216;
        t.chunkmacs.insert(0, [3u8; 16]);
        t.chunkmacs.mark_finished(0);
        t.chunkmacs.insert(SEGSIZE, [4u8; 16]);
        t.chunkmacs.mark_finished(SEGSIZE);
        t.update_contiguous_progress();
        t
    }

    #[test]
    fn sink_record_round_trip() {
        let sink = FileSink {
            localname: "docs/report.pdf".into(),
            node_handle: [9, 8, 7, 6, 5, 4],
            parent_dbid: 7,
            fsid: 123_456_789,
            fingerprint: Some(fingerprint()),
            syncable: false,
            shortname: None,
        };
        let bytes = sink.serialize();
        assert_eq!(FileSink::deserialize(&bytes).unwrap(), sink);
    }

    #[test]
    fn sink_record_rejects_short_and_trailing_input() {
        let sink = FileSink::for_file("a.bin", fingerprint());
        let bytes = sink.serialize();
        for cut in 0..bytes.len() {
            assert!(FileSink::deserialize(&bytes[..cut]).is_none(), "cut {cut}");
        }
        let mut extended = bytes.clone();
        extended.push(0xFF);
        assert!(FileSink::deserialize(&extended).is_none());
    }

    #[test]
    fn folder_record_omits_fingerprint() {
        let sink = FileSink {
            localname: "archive".into(),
            node_handle: [0; 6],
            parent_dbid: 0,
            fsid: 0,
            fingerprint: None,
            syncable: true,
            shortname: None,
        };
        let bytes = sink.serialize();
        let back = FileSink::deserialize(&bytes).unwrap();
        assert_eq!(back.fingerprint, None);
        assert_eq!(back, sink);
    }

    #[test]
    fn transfer_round_trip() {
        let mut t = sample_transfer();
        t.ultoken = Some(vec![0x55; UPLOAD_TOKEN_LEN]);
        let blob = t.serialize();
        let back = Transfer::deserialize(Direction::Get, &blob).unwrap();
        assert_eq!(back, {
            let mut expected = t.clone();
            expected.urls.clear();
            expected
        });
    }

    #[test]
    fn transfer_rejects_trailing_data() {
        let t = sample_transfer();
        let mut blob = t.serialize();
        blob.push(0);
        assert!(Transfer::deserialize(Direction::Get, &blob).is_none());
        assert!(Transfer::deserialize(Direction::Get, &blob[..blob.len() - 5]).is_none());
    }

    #[test]
    fn contiguous_progress_stops_at_first_gap() {
        let mut t = sample_transfer();
        assert_eq!(t.progresscompleted, 393_216);
        // a finished chunk beyond a gap does not advance the watermark
        t.chunkmacs.insert(786_432, [5u8; 16]);
        t.chunkmacs.mark_finished(786_432);
        t.update_contiguous_progress();
        assert_eq!(t.progresscompleted, 393_216);
        // filling the gap advances across both
        t.chunkmacs.insert(393_216, [6u8; 16]);
        t.chunkmacs.mark_finished(393_216);
        t.update_contiguous_progress();
        assert_eq!(t.progresscompleted, 1_000_000);
    }

    #[test]
    fn download_mac_verification_and_recovery() {
        let mut t = sample_transfer();
        let cipher = t.cipher();
        t.metamac = t.chunkmacs.macsmac(&cipher);
        assert!(t.verify_download_mac().is_ok());

        // server MAC recorded without the final chunk: gap recovery adopts
        // the recomputed value
        let n = t.chunkmacs.len();
        t.metamac = t.chunkmacs.macsmac_gaps(&cipher, n - 1, n, n, n);
        let full = t.chunkmacs.macsmac(&cipher);
        assert!(t.verify_download_mac().is_ok());
        assert_eq!(t.metamac, full);

        // unrelated MAC: fatal, chunk MACs cleared
        t.metamac = 0x1234_5678_9ABC_DEF0;
        assert_eq!(t.verify_download_mac(), Err(TransferError::Key));
        assert!(t.chunkmacs.is_empty());
    }

    #[test]
    fn upload_key_embeds_metamac() {
        let mut t = sample_transfer();
        let key = t.finalize_upload_key();
        let (k, iv, mac) = crate::crypto::unscramble_file_key(&key);
        assert_eq!(k, t.transferkey);
        assert_eq!(iv, t.ctriv);
        assert_eq!(mac, t.metamac);
    }

    #[test]
    fn upload_token_forms() {
        let token = vec![0xAB; UPLOAD_TOKEN_LEN];
        assert_eq!(parse_upload_token(&token).unwrap(), token);

        let legacy = [0x5A; UPLOAD_TOKEN_LEN_LEGACY];
        let encoded = BASE64.encode(legacy);
        assert_eq!(encoded.len(), 36);
        assert_eq!(parse_upload_token(encoded.as_bytes()).unwrap(), legacy);

        assert_eq!(parse_upload_token(b"-3"), Err(TransferError::again()));
        assert!(matches!(
            parse_upload_token(b"-11"),
            Err(TransferError::Internal(_))
        ));
        assert!(parse_upload_token(b"bogus").is_err());
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 255, 256, 0xFFFF_FFFF, u64::MAX] {
            let mut out = Vec::new();
            put_varint64(&mut out, value);
            let mut r = Reader::new(&out);
            assert_eq!(r.varint64(), Some(value));
            assert_eq!(r.remaining(), 0);
        }
        // count above 8 is invalid
        assert_eq!(Reader::new(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0]).varint64(), None);
    }
}
