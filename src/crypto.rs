//! AES-128 transfer cipher: CTR body transform, per-chunk CBC-MAC, and the
//! 32-byte file-key layout sent to the metadata service.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Transfer key length in bytes.
pub const KEY_SIZE: usize = 16;

/// AES block length in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Full file-key blob length: transfer key, counter IV, condensed MAC.
pub const FILE_KEY_SIZE: usize = 32;

/// Per-transfer AES-128 cipher.
///
/// The same key drives the CTR body transform, the per-chunk CBC-MAC, and
/// the mac-of-macs fold. The counter block is `ctriv` (big-endian) followed
/// by the block index within the file.
#[derive(Clone)]
pub struct TransferCipher {
    key: [u8; KEY_SIZE],
    block: Aes128,
}

impl TransferCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        let block = Aes128::new(GenericArray::from_slice(&key));
        Self { key, block }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// CTR transform of `data` in place. `pos` is the absolute file offset of
    /// `data[0]` and must be block aligned; pieces are cut on block
    /// boundaries everywhere except at end of file, where alignment of the
    /// start offset still holds.
    pub fn apply_ctr(&self, data: &mut [u8], ctriv: u64, pos: u64) {
        debug_assert_eq!(pos % BLOCK_SIZE as u64, 0, "CTR start must be block aligned");
        let mut iv = [0u8; BLOCK_SIZE];
        iv[..8].copy_from_slice(&ctriv.to_be_bytes());
        iv[8..].copy_from_slice(&(pos / BLOCK_SIZE as u64).to_be_bytes());
        let mut cipher = Aes128Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(data);
    }

    /// CBC-MAC over one chunk of plaintext. The IV is `ctriv ‖ ctriv`; the
    /// final partial block is zero padded, so a 1-byte chunk MACs as a
    /// single block.
    pub fn chunk_mac(&self, plaintext: &[u8], ctriv: u64) -> [u8; BLOCK_SIZE] {
        let mut mac = [0u8; BLOCK_SIZE];
        mac[..8].copy_from_slice(&ctriv.to_be_bytes());
        mac[8..].copy_from_slice(&ctriv.to_be_bytes());
        self.chunk_mac_update(&mut mac, plaintext);
        mac
    }

    /// Continues a CBC-MAC from previously folded state. `plaintext` must be
    /// a whole number of blocks unless it ends the chunk.
    pub fn chunk_mac_update(&self, mac: &mut [u8; BLOCK_SIZE], plaintext: &[u8]) {
        for block in plaintext.chunks(BLOCK_SIZE) {
            for (m, b) in mac.iter_mut().zip(block.iter()) {
                *m ^= *b;
            }
            self.encrypt_block(mac);
        }
    }

    /// Single-block AES encryption, used by the mac-of-macs fold.
    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.block
            .encrypt_block(GenericArray::from_mut_slice(&mut block[..]));
    }
}

/// Condenses a 16-byte MAC to the 64-bit form stored next to the file key:
/// big-endian words folded as `w0^w1 ‖ w2^w3`.
pub fn condense_mac(mac: &[u8; BLOCK_SIZE]) -> u64 {
    let w = |i: usize| u32::from_be_bytes([mac[i], mac[i + 1], mac[i + 2], mac[i + 3]]);
    let hi = w(0) ^ w(4);
    let lo = w(8) ^ w(12);
    ((hi as u64) << 32) | lo as u64
}

/// Builds the obfuscated 32-byte file key: `transferkey ⊕ (ctriv ‖ metamac)`
/// in the first half, `ctriv ‖ metamac` in the second.
pub fn build_file_key(transferkey: &[u8; KEY_SIZE], ctriv: u64, metamac: u64) -> [u8; FILE_KEY_SIZE] {
    let mut key = [0u8; FILE_KEY_SIZE];
    key[..16].copy_from_slice(transferkey);
    key[16..24].copy_from_slice(&ctriv.to_be_bytes());
    key[24..32].copy_from_slice(&metamac.to_be_bytes());
    for i in 0..KEY_SIZE {
        key[i] ^= key[KEY_SIZE + i];
    }
    key
}

/// Reverses [`build_file_key`].
pub fn unscramble_file_key(key: &[u8; FILE_KEY_SIZE]) -> ([u8; KEY_SIZE], u64, u64) {
    let mut transferkey = [0u8; KEY_SIZE];
    for i in 0..KEY_SIZE {
        transferkey[i] = key[i] ^ key[KEY_SIZE + i];
    }
    let ctriv = u64::from_be_bytes(key[16..24].try_into().unwrap());
    let metamac = u64::from_be_bytes(key[24..32].try_into().unwrap());
    (transferkey, ctriv, metamac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn ctr_round_trip() {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut key);
        let cipher = TransferCipher::new(key);
        let ctriv: u64 = rng.r#gen();

        let mut data = vec![0u8; 65_536 + 7];
        rng.fill_bytes(&mut data);
        let original = data.clone();

        cipher.apply_ctr(&mut data, ctriv, 0);
        assert_ne!(data, original);
        cipher.apply_ctr(&mut data, ctriv, 0);
        assert_eq!(data, original);
    }

    #[test]
    fn ctr_is_seekable_by_block() {
        let cipher = TransferCipher::new([7u8; KEY_SIZE]);
        let mut whole = vec![0xABu8; 4096];
        cipher.apply_ctr(&mut whole, 42, 0);

        let mut tail = vec![0xABu8; 2048];
        cipher.apply_ctr(&mut tail, 42, 2048);
        assert_eq!(&whole[2048..], &tail[..]);
    }

    #[test]
    fn one_byte_chunk_macs_as_single_padded_block() {
        let cipher = TransferCipher::new([1u8; KEY_SIZE]);
        let short = cipher.chunk_mac(&[0x5A], 9);
        let mut padded = [0u8; BLOCK_SIZE];
        padded[0] = 0x5A;
        assert_eq!(short, cipher.chunk_mac(&padded, 9));
    }

    #[test]
    fn chunk_mac_update_continues_the_chain() {
        let cipher = TransferCipher::new([3u8; KEY_SIZE]);
        let data = [0x11u8; 96];
        let whole = cipher.chunk_mac(&data, 5);

        let mut mac = [0u8; BLOCK_SIZE];
        mac[..8].copy_from_slice(&5u64.to_be_bytes());
        mac[8..].copy_from_slice(&5u64.to_be_bytes());
        cipher.chunk_mac_update(&mut mac, &data[..32]);
        cipher.chunk_mac_update(&mut mac, &data[32..]);
        assert_eq!(mac, whole);
    }

    #[test]
    fn file_key_round_trip() {
        let transferkey = [0x42u8; KEY_SIZE];
        let key = build_file_key(&transferkey, 0x0102030405060708, 0x1122334455667788);
        assert_eq!(&key[16..24], &0x0102030405060708u64.to_be_bytes());
        let (k, iv, mac) = unscramble_file_key(&key);
        assert_eq!(k, transferkey);
        assert_eq!(iv, 0x0102030405060708);
        assert_eq!(mac, 0x1122334455667788);
    }

    #[test]
    fn condense_folds_words() {
        let mut mac = [0u8; BLOCK_SIZE];
        mac[3] = 1; // w0 = 1
        mac[7] = 3; // w1 = 3
        mac[11] = 4; // w2 = 4
        mac[15] = 4; // w3 = 4
        assert_eq!(condense_mac(&mac), 0x0000_0002_0000_0000);
    }
}
