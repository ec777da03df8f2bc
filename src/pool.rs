//! Bounded worker pool for off-thread encryption and decryption
//!
//! Pieces covering at least a full chunk are handed to the pool together
//! with an owned copy of the key material; the worker applies the CTR
//! transform, flips the request status atomically, and returns the piece
//! over the slot's reply channel. The scheduler polls the status on its
//! next tick, so no slot state is ever touched off the scheduler task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, trace};

use crate::buffer::FilePiece;
use crate::chunk::chunk_ceil;
use crate::crypto::TransferCipher;
use crate::http::{HttpTransport, ReqStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoDirection {
    Encrypt,
    Decrypt,
}

/// One unit of crypto work.
pub struct CryptoJob {
    pub conn: usize,
    pub piece: FilePiece,
    pub key: [u8; 16],
    pub ctriv: u64,
    pub direction: CryptoDirection,
    /// Compute per-chunk MACs (set for chunk-aligned pieces; RAID pieces
    /// fold their MACs in order at write-completion instead)
    pub compute_macs: bool,
    pub file_size: u64,
    /// Result is dropped when set; used during cancellation
    pub discard: Arc<AtomicBool>,
    /// Status word to flip when the work is done
    pub transport: Arc<HttpTransport>,
    pub done_status: ReqStatus,
    pub reply: mpsc::UnboundedSender<CryptoDone>,
    pub wake: Arc<Notify>,
}

/// Completed crypto work, sent back to the owning slot.
pub struct CryptoDone {
    pub conn: usize,
    pub piece: FilePiece,
    pub macs: Vec<(u64, [u8; 16])>,
}

/// Applies the transform (and MAC computation) to one piece. Also called
/// inline by the slot for pieces below a full chunk.
pub fn run_crypto(
    cipher: &TransferCipher,
    mut piece: FilePiece,
    ctriv: u64,
    direction: CryptoDirection,
    compute_macs: bool,
    file_size: u64,
) -> (FilePiece, Vec<(u64, [u8; 16])>) {
    let mut macs = Vec::new();

    // MACs are emitted only for chunks the piece covers completely; a
    // truncated tail (shutdown salvage) leaves its chunk unfinished so the
    // bytes are re-requested after resume.
    let mac_over = |buf: &[u8], macs: &mut Vec<(u64, [u8; 16])>| {
        if !compute_macs {
            return;
        }
        let mut cstart = piece.pos;
        let end = piece.pos + buf.len() as u64;
        while cstart < end {
            let cend = chunk_ceil(cstart, file_size);
            if cend > end {
                break;
            }
            let lo = (cstart - piece.pos) as usize;
            let hi = (cend - piece.pos) as usize;
            macs.push((cstart, cipher.chunk_mac(&buf[lo..hi], ctriv)));
            cstart = cend;
        }
    };

    match direction {
        CryptoDirection::Decrypt => {
            cipher.apply_ctr(&mut piece.buf, ctriv, piece.pos);
            mac_over(&piece.buf, &mut macs);
        }
        CryptoDirection::Encrypt => {
            mac_over(&piece.buf, &mut macs);
            cipher.apply_ctr(&mut piece.buf, ctriv, piece.pos);
        }
    }

    piece.finalized = true;
    (piece, macs)
}

/// Handle to the shared crypto worker pool.
#[derive(Clone)]
pub struct CryptoPool {
    tx: mpsc::UnboundedSender<CryptoJob>,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<CryptoJob>();
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                debug!(target: "crypto", worker, "Crypto worker started");
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { break };
                    Self::run_job(job);
                }
                debug!(target: "crypto", worker, "Crypto worker stopped");
            });
        }
        Self { tx }
    }

    /// Queues a job; returns `false` when the pool has shut down.
    pub fn submit(&self, job: CryptoJob) -> bool {
        self.tx.send(job).is_ok()
    }

    fn run_job(job: CryptoJob) {
        let cipher = TransferCipher::new(job.key);
        let conn = job.conn;
        let (piece, macs) = run_crypto(
            &cipher,
            job.piece,
            job.ctriv,
            job.direction,
            job.compute_macs,
            job.file_size,
        );
        trace!(
            target: "crypto",
            conn,
            pos = piece.pos,
            len = piece.len(),
            "Crypto job finished"
        );
        if job.discard.load(Ordering::Acquire) {
            return;
        }
        job.transport.set_status(job.done_status);
        let _ = job.reply.send(CryptoDone { conn, piece, macs });
        job.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn piece_of(pos: u64, data: &[u8]) -> FilePiece {
        FilePiece::new(pos, BytesMut::from(data))
    }

    #[test]
    fn encrypt_then_decrypt_round_trip_with_macs() {
        let cipher = TransferCipher::new([9u8; 16]);
        let plaintext = vec![0x61u8; 200_000];
        let size = plaintext.len() as u64;

        let (encrypted, enc_macs) = run_crypto(
            &cipher,
            piece_of(0, &plaintext),
            11,
            CryptoDirection::Encrypt,
            true,
            size,
        );
        assert!(encrypted.finalized);
        assert_ne!(&encrypted.buf[..], &plaintext[..]);
        // 200_000 bytes spans chunks [0, 128K) and [128K, 200_000)
        assert_eq!(enc_macs.len(), 2);
        assert_eq!(enc_macs[0].0, 0);
        assert_eq!(enc_macs[1].0, 131_072);

        let (decrypted, dec_macs) = run_crypto(
            &cipher,
            FilePiece::new(0, encrypted.buf),
            11,
            CryptoDirection::Decrypt,
            true,
            size,
        );
        assert_eq!(&decrypted.buf[..], &plaintext[..]);
        assert_eq!(enc_macs, dec_macs);
    }

    #[tokio::test]
    async fn pool_returns_pieces_over_the_reply_channel() {
        let pool = CryptoPool::new(2);
        let (reply, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new();
        transport.set_status(ReqStatus::Decrypting);

        let cipher = TransferCipher::new([1u8; 16]);
        let mut data = BytesMut::from(&b"0123456789abcdef"[..]);
        cipher.apply_ctr(&mut data, 5, 0);

        let submitted = pool.submit(CryptoJob {
            conn: 3,
            piece: FilePiece::new(0, data),
            key: [1u8; 16],
            ctriv: 5,
            direction: CryptoDirection::Decrypt,
            compute_macs: true,
            file_size: 16,
            discard: Arc::new(AtomicBool::new(false)),
            transport: Arc::clone(&transport),
            done_status: ReqStatus::Decrypted,
            reply,
            wake: Arc::new(Notify::new()),
        });
        assert!(submitted);

        let done = rx.recv().await.unwrap();
        assert_eq!(done.conn, 3);
        assert_eq!(&done.piece.buf[..], b"0123456789abcdef");
        assert_eq!(done.macs.len(), 1);
        assert_eq!(transport.status(), ReqStatus::Decrypted);
    }

    #[tokio::test]
    async fn discarded_jobs_produce_no_reply() {
        let pool = CryptoPool::new(1);
        let (reply, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new();
        transport.set_status(ReqStatus::Decrypting);

        pool.submit(CryptoJob {
            conn: 0,
            piece: piece_of(0, b"0123456789abcdef"),
            key: [0u8; 16],
            ctriv: 0,
            direction: CryptoDirection::Decrypt,
            compute_macs: false,
            file_size: 16,
            discard: Arc::new(AtomicBool::new(true)),
            transport: Arc::clone(&transport),
            done_status: ReqStatus::Decrypted,
            reply,
            wake: Arc::new(Notify::new()),
        });

        assert!(rx.recv().await.is_none(), "sender dropped without a reply");
        assert_eq!(transport.status(), ReqStatus::Decrypting);
    }
}
