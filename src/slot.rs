//! The per-transfer state machine
//!
//! A slot owns the parallel connections, buffer manager, file handle, retry
//! state and speed tracker of one active transfer. The engine ticks it with
//! `doio` whenever a transport, timer or worker completion becomes ready;
//! all slot and transfer state is mutated only from those ticks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buffer::{DirectBufferManager, FilePiece, TransferBuffer};
use crate::config::{
    MAX_ERROR_COUNT, RATE_LIMIT_BACKOFF, SERVICE_UNAVAILABLE_BACKOFF, XFER_TIMEOUT,
};
use crate::crypto::BLOCK_SIZE;
use crate::engine::SchedulerContext;
use crate::error::TransferError;
use crate::fs::{AsyncIoResult, FileAccess, is_retryable_io};
use crate::http::{HttpMethod, HttpRequestSpec, HttpTransport, ReqStatus};
use crate::pool::{CryptoDirection, CryptoDone, CryptoJob, run_crypto};
use crate::progress::{SpeedTracker, TransferProgress};
use crate::raid::{RAIDSECTOR, RAIDLINE, RaidBufferManager};
use crate::transfer::{Direction, Transfer, parse_upload_token};

/// Pieces below one full chunk are transformed inline on the scheduler.
const INLINE_CRYPTO_MAX: u64 = 65_536;

/// Assembled RAID bytes are emitted as pieces of at least this size.
const RAID_EMIT_MIN: u64 = 65_536;

/// Bound on waiting for one in-flight crypto piece during the shutdown
/// flush; on expiry the piece is discarded and re-downloaded after resume.
const FLUSH_CRYPTO_WAIT: Duration = Duration::from_secs(2);

/// Owner tag for slot-level (RAID) crypto jobs and writes.
const RAID_CONN: usize = usize::MAX;

/// Result of one scheduler tick.
#[derive(Debug)]
pub enum TickOutcome {
    Continue,
    /// Arm the retry timer; tick again after the duration
    Backoff(Duration),
    Completed,
    Failed(TransferError),
}

/// One connection's current request.
struct ConnReq {
    /// File offset (direct) or part offset (RAID)
    pos: u64,
    size: u64,
    transport: Arc<HttpTransport>,
    /// Prepared ciphertext body (PUT)
    out: Option<Bytes>,
    /// Chunk MACs computed while encrypting, merged on request success
    macs: Vec<(u64, [u8; 16])>,
    /// PUT: plaintext still has to be read from disk
    needs_read: bool,
    /// Connection permanently finished (abandoned RAID part, token received)
    done: bool,
}

impl ConnReq {
    fn new(pos: u64, size: u64) -> Self {
        Self {
            pos,
            size,
            transport: HttpTransport::new(),
            out: None,
            macs: Vec::new(),
            needs_read: false,
            done: false,
        }
    }
}

pub struct TransferSlot {
    pub transfer_id: u64,
    conns: Vec<Option<ConnReq>>,
    buffer: Option<TransferBuffer>,
    file: Option<Box<dyn FileAccess>>,
    file_opened: bool,

    crypto_tx: mpsc::UnboundedSender<CryptoDone>,
    crypto_rx: mpsc::UnboundedReceiver<CryptoDone>,
    crypto_inflight: usize,
    io_tx: mpsc::UnboundedSender<AsyncIoResult>,
    io_rx: mpsc::UnboundedReceiver<AsyncIoResult>,
    discard: Arc<AtomicBool>,

    /// Chunk MACs per decrypted piece, merged once the piece is durable
    pending_macs: HashMap<u64, Vec<(u64, [u8; 16])>>,
    /// Connection owning each queued output piece
    piece_owner: HashMap<u64, usize>,
    /// Decrypted RAID pieces waiting for in-order writing
    raid_ready: BTreeMap<u64, FilePiece>,
    /// Next RAID piece offset the writer expects
    raid_next_write: u64,
    /// Resume prefix already durable; re-assembled bytes below it are dropped
    discard_below: u64,
    write_inflight: Option<(usize, u64, u64)>,
    read_inflight: bool,
    /// Zero-byte upload fired its single empty request
    zero_put_sent: bool,

    errorcount: u32,
    last_error: Option<TransferError>,
    fatal: Option<TransferError>,
    backoff: Option<Duration>,
    lastdata: Instant,
    last_progress_bytes: u64,
    last_progress_at: Instant,
    speed: SpeedTracker,
    max_request_size: u64,
    alt_port: bool,
}

impl TransferSlot {
    pub fn new(transfer_id: u64) -> Self {
        let (crypto_tx, crypto_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            transfer_id,
            conns: Vec::new(),
            buffer: None,
            file: None,
            file_opened: false,
            crypto_tx,
            crypto_rx,
            crypto_inflight: 0,
            io_tx,
            io_rx,
            discard: Arc::new(AtomicBool::new(false)),
            pending_macs: HashMap::new(),
            piece_owner: HashMap::new(),
            raid_ready: BTreeMap::new(),
            raid_next_write: 0,
            discard_below: 0,
            write_inflight: None,
            read_inflight: false,
            zero_put_sent: false,
            errorcount: 0,
            last_error: None,
            fatal: None,
            backoff: None,
            lastdata: Instant::now(),
            last_progress_bytes: 0,
            last_progress_at: Instant::now(),
            speed: SpeedTracker::new(),
            max_request_size: 0,
            alt_port: false,
        }
    }

    /// One scheduler tick.
    pub async fn doio(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) -> TickOutcome {
        self.backoff = None;
        self.create_connections_once(transfer, ctx);
        self.drain_io_results(transfer, ctx);
        self.drain_crypto_results(transfer);

        if let Some(err) = self.fatal.take() {
            return TickOutcome::Failed(err);
        }

        // 1. completion check
        if self.completion_ready(transfer) {
            return self.try_complete(transfer, ctx).await;
        }

        // 2. too many transient errors
        if self.errorcount >= MAX_ERROR_COUNT {
            let err = self.last_error.take().unwrap_or(TransferError::again());
            return TickOutcome::Failed(err);
        }

        // 3. service each connection
        for i in 0..self.conns.len() {
            if let Some(outcome) = self.service_connection(i, transfer, ctx).await {
                return outcome;
            }
        }
        if let Some(err) = self.fatal.take() {
            return TickOutcome::Failed(err);
        }

        // RAID reassembly and the write pipeline
        self.pump_raid_output(transfer, ctx);
        if let Some(outcome) = self.pump_writer(transfer, ctx).await {
            return outcome;
        }

        // 4. progress and speed
        self.report_progress(transfer, ctx);

        // 5. global no-data timeout
        if self.lastdata.elapsed() >= XFER_TIMEOUT {
            let mut any_inflight = false;
            for conn in self.conns.iter().flatten() {
                if matches!(
                    conn.transport.status(),
                    ReqStatus::Inflight | ReqStatus::Prepared
                ) {
                    any_inflight = true;
                    conn.transport.cancel.cancel();
                }
            }
            if !any_inflight {
                return TickOutcome::Failed(TransferError::again());
            }
            info!(
                target: "slot",
                transfer = self.transfer_id,
                "No data for 60s, toggling alternate port and reconnecting"
            );
            self.alt_port = !self.alt_port;
            for url in &mut transfer.urls {
                *url = crate::http::set_alt_port(url, self.alt_port);
            }
            for i in 0..self.conns.len() {
                if let Some(conn) = &mut self.conns[i]
                    && !conn.done
                    && matches!(
                        conn.transport.status(),
                        ReqStatus::Inflight | ReqStatus::Prepared
                    )
                {
                    let fresh = ConnReq {
                        pos: conn.pos,
                        size: conn.size,
                        transport: HttpTransport::new(),
                        out: conn.out.clone(),
                        macs: std::mem::take(&mut conn.macs),
                        needs_read: conn.needs_read,
                        done: false,
                    };
                    fresh.transport.set_status(ReqStatus::Prepared);
                    self.conns[i] = Some(fresh);
                }
            }
            self.lastdata = Instant::now();
        }

        // 6. arm the retry timer when a backoff was requested this tick
        match self.backoff.take() {
            Some(delay) => TickOutcome::Backoff(delay),
            None => TickOutcome::Continue,
        }
    }

    /// Connection count and buffers are decided on the first tick, once the
    /// temporary URLs are known.
    fn create_connections_once(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) {
        if !self.conns.is_empty() || self.buffer.is_some() {
            return;
        }
        let is_raid = transfer.is_raid();
        let count = ctx.config.connections_for(transfer.size, is_raid);
        self.max_request_size = ctx.config.max_request_size();
        self.conns = (0..count).map(|_| None).collect();

        let alt = match transfer.direction {
            Direction::Get => ctx.config.use_alt_down_port,
            Direction::Put => ctx.config.use_alt_up_port,
        };
        if alt {
            self.alt_port = true;
            for url in &mut transfer.urls {
                *url = crate::http::set_alt_port(url, true);
            }
        }

        let resume = transfer.progresscompleted;
        self.buffer = Some(if is_raid {
            self.discard_below = resume;
            self.raid_next_write = resume / RAIDLINE * RAIDLINE;
            TransferBuffer::Raid(RaidBufferManager::new(transfer.size, resume))
        } else {
            TransferBuffer::Direct(DirectBufferManager::new(
                transfer.size,
                resume,
                count,
                ctx.config.ordered_downloads,
            ))
        });

        debug!(
            target: "slot",
            transfer = self.transfer_id,
            connections = count,
            raid = is_raid,
            max_request_size = self.max_request_size,
            resume,
            "Slot connections created"
        );
    }

    fn drain_crypto_results(&mut self, transfer: &mut Transfer) {
        while let Ok(done) = self.crypto_rx.try_recv() {
            self.crypto_inflight = self.crypto_inflight.saturating_sub(1);
            self.apply_crypto_done(done, transfer);
        }
    }

    fn apply_crypto_done(&mut self, done: CryptoDone, transfer: &mut Transfer) {
        match transfer.direction {
            Direction::Get => {
                if done.conn == RAID_CONN {
                    self.raid_ready.insert(done.piece.pos, done.piece);
                } else {
                    self.pending_macs.insert(done.piece.pos, done.macs);
                    self.piece_owner.insert(done.piece.pos, done.conn);
                    if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                        m.submit_piece(done.conn, done.piece);
                    }
                }
            }
            Direction::Put => {
                if let Some(conn) = self.conns.get_mut(done.conn).and_then(Option::as_mut) {
                    conn.out = Some(done.piece.buf.freeze());
                    conn.macs = done.macs;
                }
            }
        }
    }

    fn drain_io_results(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) {
        while let Ok(result) = self.io_rx.try_recv() {
            let write = result.write;
            self.file = Some(result.file);
            if write {
                self.write_inflight = None;
                self.handle_write_result(
                    result.conn,
                    result.pos,
                    result.len,
                    result.failed,
                    result.retry,
                    result.buf,
                    transfer,
                    ctx,
                );
            } else {
                self.read_inflight = false;
                self.handle_read_result(
                    result.conn,
                    result.pos,
                    result.len,
                    result.failed,
                    result.retry,
                    result.buf,
                    transfer,
                    ctx,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_write_result(
        &mut self,
        conn: usize,
        pos: u64,
        len: u64,
        failed: bool,
        retry: bool,
        buf: Option<BytesMut>,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) {
        if failed {
            if retry {
                warn!(
                    target: "slot",
                    transfer = self.transfer_id,
                    pos = pos,
                    "Write failed with transient error, restarting"
                );
                if let Some(buf) = buf {
                    let mut piece = FilePiece::new(pos, buf);
                    piece.finalized = true;
                    self.start_write(piece, conn, ctx);
                }
            } else {
                self.fatal = Some(TransferError::Write(format!(
                    "write of {} bytes at {} failed",
                    len, pos
                )));
            }
            return;
        }

        self.commit_written_piece(conn, pos, len, buf, transfer, ctx);
    }

    /// Bytes are durable: merge chunk MACs, advance contiguous progress,
    /// persist the transfer record, release the owning connection.
    fn commit_written_piece(
        &mut self,
        owner: usize,
        pos: u64,
        len: u64,
        buf: Option<BytesMut>,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) {
        if owner == RAID_CONN {
            if let Some(buf) = buf {
                let cipher = transfer.cipher();
                transfer
                    .chunkmacs
                    .update_with_piece(&cipher, transfer.ctriv, pos, &buf, transfer.size);
            }
        } else {
            for (cstart, mac) in self.pending_macs.remove(&pos).unwrap_or_default() {
                transfer.chunkmacs.insert(cstart, mac);
                transfer.chunkmacs.mark_finished(cstart);
            }
            if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                m.write_completed(pos, len, true);
            }
            if let Some(conn) = self.piece_owner.remove(&pos) {
                if self.conns.get(conn).map(|c| c.is_some()).unwrap_or(false) {
                    self.conns[conn] = None; // back to READY
                }
            }
        }
        transfer.update_contiguous_progress();
        self.errorcount = 0;
        self.persist(transfer, ctx);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_read_result(
        &mut self,
        conn_idx: usize,
        pos: u64,
        len: u64,
        failed: bool,
        retry: bool,
        buf: Option<BytesMut>,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) {
        let Some(conn) = self.conns.get_mut(conn_idx).and_then(Option::as_mut) else {
            return;
        };
        if failed {
            if retry {
                conn.needs_read = true;
            } else {
                self.fatal = Some(TransferError::Read(format!(
                    "read of {} bytes at {} failed",
                    len, pos
                )));
            }
            return;
        }
        let Some(buf) = buf else { return };
        let transport = Arc::clone(&conn.transport);
        transport.set_status(ReqStatus::Encrypting);
        self.submit_crypto(
            conn_idx,
            FilePiece::new(pos, buf),
            CryptoDirection::Encrypt,
            true,
            transport,
            ReqStatus::Prepared,
            transfer,
            ctx,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_crypto(
        &mut self,
        conn: usize,
        piece: FilePiece,
        direction: CryptoDirection,
        compute_macs: bool,
        transport: Arc<HttpTransport>,
        done_status: ReqStatus,
        transfer: &Transfer,
        ctx: &SchedulerContext,
    ) {
        self.crypto_inflight += 1;
        let submitted = ctx.crypto.submit(CryptoJob {
            conn,
            piece,
            key: transfer.transferkey,
            ctriv: transfer.ctriv,
            direction,
            compute_macs,
            file_size: transfer.size,
            discard: Arc::clone(&self.discard),
            transport,
            done_status,
            reply: self.crypto_tx.clone(),
            wake: Arc::clone(&ctx.wake),
        });
        if !submitted {
            self.crypto_inflight -= 1;
            self.fatal = Some(TransferError::Internal("crypto pool unavailable".into()));
        }
    }

    async fn service_connection(
        &mut self,
        i: usize,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) -> Option<TickOutcome> {
        let status = match &self.conns[i] {
            Some(conn) if conn.done => return None,
            Some(conn) => conn.transport.status(),
            None => {
                self.prepare_next_request(i, transfer);
                match &self.conns[i] {
                    Some(conn) => conn.transport.status(),
                    None => return None,
                }
            }
        };

        match status {
            ReqStatus::Ready | ReqStatus::Decrypting | ReqStatus::Decrypted
            | ReqStatus::Encrypting | ReqStatus::Done => None,
            ReqStatus::AsyncIo => {
                self.maybe_start_read(i, transfer, ctx).await;
                None
            }
            ReqStatus::Prepared => {
                self.fire_request(i, transfer, ctx);
                None
            }
            ReqStatus::Inflight => {
                self.check_raid_stall(i, transfer);
                None
            }
            ReqStatus::Success => self.handle_success(i, transfer, ctx),
            ReqStatus::Failure => self.handle_failure(i, transfer),
        }
    }

    /// READY: pick the next range from the buffer manager and build the
    /// request for it.
    fn prepare_next_request(&mut self, i: usize, transfer: &mut Transfer) {
        let max_req = self.max_request_size;
        let buffer = match &mut self.buffer {
            Some(b) => b,
            None => return,
        };
        match buffer {
            TransferBuffer::Raid(m) => {
                if let Some((start, end)) = m.next_range_for_part(i, max_req) {
                    let req = ConnReq::new(start, end - start);
                    req.transport.set_status(ReqStatus::Prepared);
                    self.conns[i] = Some(req);
                }
            }
            TransferBuffer::Direct(m) => match transfer.direction {
                Direction::Get => {
                    if let Some((start, end)) = m.next_range_for_connection(i, max_req) {
                        let req = ConnReq::new(start, end - start);
                        req.transport.set_status(ReqStatus::Prepared);
                        self.conns[i] = Some(req);
                        if transfer.pos < end {
                            transfer.pos = end;
                        }
                    }
                }
                Direction::Put => {
                    if transfer.size == 0 {
                        if !self.zero_put_sent {
                            self.zero_put_sent = true;
                            let mut req = ConnReq::new(0, 0);
                            req.out = Some(Bytes::new());
                            req.transport.set_status(ReqStatus::Prepared);
                            self.conns[i] = Some(req);
                        }
                        return;
                    }
                    if let Some((start, end)) = m.next_range_for_connection(i, max_req) {
                        let mut req = ConnReq::new(start, end - start);
                        req.needs_read = true;
                        req.transport.set_status(ReqStatus::AsyncIo);
                        self.conns[i] = Some(req);
                        if transfer.pos < end {
                            transfer.pos = end;
                        }
                    }
                }
            },
        }
    }

    /// Starts the pending plaintext read for a PUT request once the file
    /// handle is free.
    async fn maybe_start_read(&mut self, i: usize, transfer: &mut Transfer, ctx: &SchedulerContext) {
        let needs = self
            .conns[i]
            .as_ref()
            .map(|c| c.needs_read)
            .unwrap_or(false);
        if !needs || self.read_inflight {
            return;
        }
        if !self.ensure_file(transfer, ctx).await {
            return;
        }
        let Some(mut file) = self.file.take() else {
            return;
        };
        let conn = self.conns[i].as_mut().unwrap();
        conn.needs_read = false;
        let (pos, len) = (conn.pos, conn.size);
        self.read_inflight = true;
        let tx = self.io_tx.clone();
        let wake = Arc::clone(&ctx.wake);
        tokio::spawn(async move {
            let result = file.fread(len as usize, 0, pos).await;
            let (failed, retry, buf) = match result {
                Ok(buf) => (false, false, Some(buf)),
                Err(err) => (true, is_retryable_io(&err), None),
            };
            let _ = tx.send(AsyncIoResult {
                conn: i,
                write: false,
                pos,
                len,
                failed,
                retry,
                buf,
                file,
            });
            wake.notify_one();
        });
    }

    /// PREPARED: fire the HTTP request.
    fn fire_request(&mut self, i: usize, transfer: &mut Transfer, ctx: &SchedulerContext) {
        let is_raid = self.buffer.as_ref().map(|b| b.is_raid()).unwrap_or(false);
        let conn = match self.conns[i].as_mut() {
            Some(conn) => conn,
            None => return,
        };
        let spec = match transfer.direction {
            Direction::Get => {
                let url_index = if is_raid { i } else { 0 };
                HttpRequestSpec {
                    method: HttpMethod::Get,
                    url: transfer.urls[url_index].clone(),
                    range: Some((conn.pos, conn.pos + conn.size)),
                    body: None,
                }
            }
            Direction::Put => {
                let Some(body) = conn.out.clone() else {
                    return; // ciphertext not ready yet
                };
                HttpRequestSpec {
                    method: HttpMethod::Post,
                    url: format!("{}/{}", transfer.urls[0], conn.pos),
                    range: None,
                    body: Some(body),
                }
            }
        };
        conn.transport.reset_for_retry();
        conn.transport.set_status(ReqStatus::Inflight);
        ctx.http
            .start(spec, Arc::clone(&conn.transport), Arc::clone(&ctx.wake));
    }

    /// INFLIGHT (RAID): when this connection has stalled for half the
    /// transfer timeout and the five peers are already past it, abandon or
    /// reset it rather than waiting for the full timeout.
    fn check_raid_stall(&mut self, i: usize, _transfer: &mut Transfer) {
        let Some(TransferBuffer::Raid(m)) = &mut self.buffer else {
            return;
        };
        let Some(conn) = self.conns[i].as_mut() else {
            return;
        };
        if conn.transport.last_data_age() < XFER_TIMEOUT / 2 {
            return;
        }
        if m.detect_slowest_part() != Some(i) {
            return;
        }
        // salvage whole sectors received so far
        let body = conn.transport.take_body();
        let keep = body.len() / RAIDSECTOR as usize * RAIDSECTOR as usize;
        if keep > 0 {
            m.submit_part_data(i, conn.pos, &body[..keep]);
        }
        conn.transport.cancel.cancel();
        if m.try_raid_error_recovery(i) {
            info!(
                target: "slot",
                transfer = self.transfer_id,
                part = i,
                "Slow raid part abandoned, continuing with five sources"
            );
            let conn = self.conns[i].as_mut().unwrap();
            conn.done = true;
        } else {
            debug!(
                target: "slot",
                transfer = self.transfer_id,
                part = i,
                "Slow raid part reset for retry"
            );
            m.reset_part(i);
            self.conns[i] = None;
        }
    }

    fn handle_success(
        &mut self,
        i: usize,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) -> Option<TickOutcome> {
        match transfer.direction {
            Direction::Get => {
                self.handle_get_success(i, transfer, ctx);
                None
            }
            Direction::Put => self.handle_put_success(i, transfer, ctx),
        }
    }

    fn handle_get_success(&mut self, i: usize, transfer: &mut Transfer, ctx: &SchedulerContext) {
        let is_raid = self.buffer.as_ref().map(|b| b.is_raid()).unwrap_or(false);
        let (body, pos, expected, transport) = {
            let conn = self.conns[i].as_mut().unwrap();
            (
                conn.transport.take_body(),
                conn.pos,
                conn.size,
                Arc::clone(&conn.transport),
            )
        };
        self.lastdata = Instant::now();

        if is_raid {
            let Some(TransferBuffer::Raid(m)) = &mut self.buffer else {
                return;
            };
            m.submit_part_data(i, pos, &body);
            if (body.len() as u64) < expected {
                // re-request the missing tail of the part range
                m.reset_part(i);
            }
            m.assemble();
            self.conns[i] = None; // next part range
            return;
        }

        if (body.len() as u64) != expected {
            // truncated body: re-request the whole range so pieces stay
            // chunk aligned (partial salvage happens only at shutdown)
            debug!(
                target: "slot",
                transfer = self.transfer_id,
                pos,
                received = body.len(),
                "Short response body, re-requesting range"
            );
            if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                m.connection_failed(i);
            }
            self.conns[i] = None;
            return;
        }

        let piece = FilePiece::new(pos, body);
        if piece.len() >= INLINE_CRYPTO_MAX {
            transport.set_status(ReqStatus::Decrypting);
            self.submit_crypto(
                i,
                piece,
                CryptoDirection::Decrypt,
                true,
                transport,
                ReqStatus::Decrypted,
                transfer,
                ctx,
            );
        } else {
            let cipher = transfer.cipher();
            let (piece, macs) = run_crypto(
                &cipher,
                piece,
                transfer.ctriv,
                CryptoDirection::Decrypt,
                true,
                transfer.size,
            );
            transport.set_status(ReqStatus::Decrypted);
            self.apply_crypto_done(
                CryptoDone {
                    conn: i,
                    piece,
                    macs,
                },
                transfer,
            );
        }
    }

    fn handle_put_success(
        &mut self,
        i: usize,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) -> Option<TickOutcome> {
        let conn = self.conns[i].as_mut().unwrap();
        let body = conn.transport.take_body();
        let macs = std::mem::take(&mut conn.macs);
        self.lastdata = Instant::now();

        // chunk MACs become part of the transfer once the server holds them
        let mut pending = crate::mac::ChunkMacMap::new();
        for (cstart, mac) in macs {
            pending.insert(cstart, mac);
        }
        transfer.chunkmacs.finished_upload_chunks(&pending);
        transfer.update_contiguous_progress();
        self.errorcount = 0;
        self.persist(transfer, ctx);

        if body.is_empty() {
            if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                m.connection_completed(i);
            }
            self.conns[i] = None;
            return None;
        }

        match parse_upload_token(&body) {
            Ok(token) => {
                info!(
                    target: "slot",
                    transfer = self.transfer_id,
                    token_len = token.len(),
                    "Upload token received"
                );
                transfer.ultoken = Some(token);
                if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                    m.connection_completed(i);
                }
                let conn = self.conns[i].as_mut().unwrap();
                conn.done = true;
                self.persist(transfer, ctx);
                None
            }
            Err(err) => Some(TickOutcome::Failed(err)),
        }
    }

    /// FAILURE: status-specific retry, recovery, or abort.
    fn handle_failure(&mut self, i: usize, transfer: &mut Transfer) -> Option<TickOutcome> {
        let is_raid = self.buffer.as_ref().map(|b| b.is_raid()).unwrap_or(false);
        let conn = self.conns[i].as_mut().unwrap();
        let status = conn.transport.http_status.load(Ordering::Acquire);
        let timeleft = conn.transport.timeleft();
        let content_type = conn.transport.content_type();

        match status {
            509 => Some(TickOutcome::Failed(TransferError::OverQuota { timeleft })),
            429 => {
                conn.transport.set_status(ReqStatus::Prepared);
                self.backoff = Some(RATE_LIMIT_BACKOFF);
                None
            }
            403 | 404 | 503 if is_raid => {
                conn.transport.cancel.cancel();
                let Some(TransferBuffer::Raid(m)) = &mut self.buffer else {
                    return None;
                };
                if m.try_raid_error_recovery(i) {
                    let conn = self.conns[i].as_mut().unwrap();
                    conn.done = true;
                    None
                } else {
                    Some(TickOutcome::Failed(TransferError::stale_url()))
                }
            }
            404 => Some(TickOutcome::Failed(TransferError::stale_url())),
            503 => {
                conn.transport.set_status(ReqStatus::Prepared);
                self.backoff = Some(SERVICE_UNAVAILABLE_BACKOFF);
                None
            }
            _ => {
                self.errorcount += 1;
                self.last_error = Some(TransferError::Failed { status });

                // A transparent proxy answering with an HTML page on a plain
                // http URL: upgrade to https and retry immediately.
                let url_index = if is_raid { i } else { 0 };
                let url = &transfer.urls[url_index];
                if content_type
                    .map(|t| t.contains("text/html"))
                    .unwrap_or(false)
                    && url.starts_with("http://")
                {
                    transfer.urls[url_index] = crate::http::upgrade_to_https(url);
                    let conn = self.conns[i].as_mut().unwrap();
                    conn.transport.set_status(ReqStatus::Prepared);
                    return None;
                }

                // anything else: toggle the alternate port and hand the
                // transfer back for rescheduling
                self.alt_port = !self.alt_port;
                for url in &mut transfer.urls {
                    *url = crate::http::set_alt_port(url, self.alt_port);
                }
                Some(TickOutcome::Failed(TransferError::again()))
            }
        }
    }

    /// Emits assembled RAID bytes as decrypt jobs.
    fn pump_raid_output(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) {
        loop {
            let piece = match self.buffer.as_mut().and_then(|b| b.as_raid_mut()) {
                Some(m) => m.take_piece(RAID_EMIT_MIN),
                None => return,
            };
            let Some(piece) = piece else { return };
            if piece.len() >= INLINE_CRYPTO_MAX {
                self.submit_crypto(
                    RAID_CONN,
                    piece,
                    CryptoDirection::Decrypt,
                    false,
                    HttpTransport::new(),
                    ReqStatus::Decrypted,
                    transfer,
                    ctx,
                );
            } else {
                let cipher = transfer.cipher();
                let (piece, _) = run_crypto(
                    &cipher,
                    piece,
                    transfer.ctriv,
                    CryptoDirection::Decrypt,
                    false,
                    transfer.size,
                );
                self.raid_ready.insert(piece.pos, piece);
            }
        }
    }

    /// Starts the next durable write when the file handle is free.
    async fn pump_writer(
        &mut self,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) -> Option<TickOutcome> {
        if transfer.direction != Direction::Get || self.write_inflight.is_some() {
            return None;
        }
        let next = self.next_write_piece();
        let Some((owner, piece)) = next else {
            return None;
        };
        if piece.is_empty() {
            // resume prefix fully trimmed away; account and move on
            self.commit_written_piece(owner, piece.pos, 0, None, transfer, ctx);
            return None;
        }
        if !self.ensure_file(transfer, ctx).await {
            self.put_back_write_piece(piece);
            return self.fatal.take().map(TickOutcome::Failed);
        }
        self.start_write(piece, owner, ctx);
        None
    }

    fn put_back_write_piece(&mut self, piece: FilePiece) {
        match &mut self.buffer {
            Some(TransferBuffer::Direct(m)) => m.store_piece(piece),
            _ => {
                self.raid_next_write = piece.pos;
                self.raid_ready.insert(piece.pos, piece);
            }
        }
    }

    /// Pops the next in-order finalized piece, trimming the RAID resume
    /// prefix below the durable watermark.
    fn next_write_piece(&mut self) -> Option<(usize, FilePiece)> {
        if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
            let piece = m.next_ready_piece()?;
            let owner = self.piece_owner.get(&piece.pos).copied().unwrap_or(RAID_CONN);
            return Some((owner, piece));
        }
        let (&pos, _) = self.raid_ready.iter().next()?;
        if pos != self.raid_next_write {
            return None;
        }
        let mut piece = self.raid_ready.remove(&pos)?;
        self.raid_next_write = pos + piece.len();
        if piece.pos < self.discard_below {
            let skip = (self.discard_below - piece.pos).min(piece.len()) as usize;
            let _ = piece.buf.split_to(skip);
            piece.pos += skip as u64;
        }
        Some((RAID_CONN, piece))
    }

    fn start_write(&mut self, piece: FilePiece, owner: usize, ctx: &SchedulerContext) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        self.write_inflight = Some((owner, piece.pos, piece.len()));
        let tx = self.io_tx.clone();
        let wake = Arc::clone(&ctx.wake);
        tokio::spawn(async move {
            let result = file.fwrite(&piece.buf, piece.pos).await;
            let (failed, retry) = match &result {
                Ok(()) => (false, false),
                Err(err) => (true, is_retryable_io(err)),
            };
            let _ = tx.send(AsyncIoResult {
                conn: owner,
                write: true,
                pos: piece.pos,
                len: piece.len(),
                failed,
                retry,
                buf: Some(piece.buf),
                file,
            });
            wake.notify_one();
        });
    }

    async fn ensure_file(&mut self, transfer: &Transfer, ctx: &SchedulerContext) -> bool {
        if self.file.is_some() {
            return true;
        }
        if self.file_opened {
            // handle is temporarily loaned to a spawned read/write
            return false;
        }
        let path = transfer.local_path();
        let opened = match transfer.direction {
            Direction::Get => ctx.fs.open(&path, true, false).await,
            Direction::Put => ctx.fs.open(&path, false, true).await,
        };
        match opened {
            Ok(file) => {
                self.file = Some(file);
                self.file_opened = true;
                true
            }
            Err(err) => {
                warn!(
                    target: "slot",
                    transfer = self.transfer_id,
                    path = %path.display(),
                    error = %err,
                    "Failed to open local file"
                );
                self.fatal = Some(match transfer.direction {
                    Direction::Get => TransferError::Write(err.to_string()),
                    Direction::Put => TransferError::Read(err.to_string()),
                });
                false
            }
        }
    }

    fn completion_ready(&self, transfer: &Transfer) -> bool {
        let pipeline_idle = self.crypto_inflight == 0
            && self.write_inflight.is_none()
            && !self.read_inflight
            && self.raid_ready.is_empty();
        match transfer.direction {
            Direction::Get => transfer.progresscompleted >= transfer.size && pipeline_idle,
            Direction::Put => transfer.ultoken.is_some() && pipeline_idle && self.puts_drained(),
        }
    }

    fn puts_drained(&self) -> bool {
        self.conns.iter().all(|conn| match conn {
            None => true,
            Some(c) => {
                c.done
                    || !matches!(
                        c.transport.status(),
                        ReqStatus::Inflight | ReqStatus::Success | ReqStatus::Encrypting
                    )
            }
        })
    }

    async fn try_complete(
        &mut self,
        transfer: &mut Transfer,
        ctx: &SchedulerContext,
    ) -> TickOutcome {
        match transfer.direction {
            Direction::Get => {
                // a zero-byte download still creates its sink
                if transfer.size == 0 && !self.ensure_file(transfer, ctx).await {
                    return TickOutcome::Failed(
                        self.fatal
                            .take()
                            .unwrap_or_else(|| TransferError::Write("create failed".into())),
                    );
                }
                match transfer.verify_download_mac() {
                    Ok(()) => {
                        info!(
                            target: "slot",
                            transfer = self.transfer_id,
                            size = transfer.size,
                            "Download complete, MAC verified"
                        );
                        TickOutcome::Completed
                    }
                    Err(err) => TickOutcome::Failed(err),
                }
            }
            Direction::Put => {
                // incorporate chunk MACs from connections whose write
                // bookkeeping had not landed when the token arrived
                for conn in self.conns.iter_mut().flatten() {
                    if !conn.macs.is_empty() {
                        let mut pending = crate::mac::ChunkMacMap::new();
                        for (cstart, mac) in std::mem::take(&mut conn.macs) {
                            pending.insert(cstart, mac);
                        }
                        transfer.chunkmacs.finished_upload_chunks(&pending);
                    }
                }
                transfer.update_contiguous_progress();
                info!(
                    target: "slot",
                    transfer = self.transfer_id,
                    size = transfer.size,
                    "Upload complete"
                );
                TickOutcome::Completed
            }
        }
    }

    /// Progress = durable bytes + in-flight body bytes + RAID reassembly.
    fn report_progress(&mut self, transfer: &Transfer, ctx: &SchedulerContext) {
        let mut total = transfer.progresscompleted;
        for conn in self.conns.iter().flatten() {
            if conn.transport.status() == ReqStatus::Inflight {
                total += conn.transport.received.load(Ordering::Acquire);
            }
        }
        if let Some(TransferBuffer::Raid(m)) = &self.buffer {
            total += m.bytes_in_reassembly();
        }
        let total = total.min(transfer.size);

        if total > self.last_progress_bytes {
            self.lastdata = Instant::now();
        }
        if total != self.last_progress_bytes
            || self.last_progress_at.elapsed() >= crate::config::PROGRESS_TIMEOUT
        {
            let speed = self.speed.record(total);
            self.last_progress_bytes = total;
            self.last_progress_at = Instant::now();
            ctx.callbacks.on_progress(TransferProgress::new(
                self.transfer_id,
                transfer.size,
                total,
                speed,
            ));
        }
    }

    fn persist(&self, transfer: &Transfer, ctx: &SchedulerContext) {
        if let Some(cache) = &ctx.cache
            && let Err(err) = cache.store(transfer)
        {
            warn!(
                target: "slot",
                transfer = self.transfer_id,
                error = %err,
                "Failed to persist transfer record"
            );
        }
    }

    /// Ages the slot past the no-data timeout.
    #[cfg(test)]
    pub(crate) fn test_force_timeout(&mut self) {
        self.lastdata = Instant::now()
            .checked_sub(XFER_TIMEOUT + Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
    }

    /// Best-effort flush before the slot is torn down: salvage in-flight
    /// bodies, wait (bounded) for crypto, drain the output queue to disk,
    /// and persist the record so resumption loses as little as possible.
    pub async fn shutdown(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) {
        if transfer.direction == Direction::Get {
            self.flush_downloads(transfer, ctx).await;
        }
        for conn in self.conns.iter().flatten() {
            conn.transport.cancel.cancel();
        }
        self.discard.store(true, Ordering::Release);
        self.persist(transfer, ctx);
        debug!(
            target: "slot",
            transfer = self.transfer_id,
            progress = transfer.progresscompleted,
            "Slot shut down"
        );
    }

    async fn flush_downloads(&mut self, transfer: &mut Transfer, ctx: &SchedulerContext) {
        let is_raid = self.buffer.as_ref().map(|b| b.is_raid()).unwrap_or(false);

        // 1. salvage in-flight bodies, truncated to a safe boundary
        for i in 0..self.conns.len() {
            let Some(conn) = self.conns[i].as_mut() else {
                continue;
            };
            if conn.transport.status() != ReqStatus::Inflight {
                continue;
            }
            conn.transport.cancel.cancel();
            let body = conn.transport.take_body();
            let pos = conn.pos;
            if is_raid {
                let keep = body.len() / RAIDSECTOR as usize * RAIDSECTOR as usize;
                if keep > 0
                    && let Some(TransferBuffer::Raid(m)) = &mut self.buffer
                {
                    m.submit_part_data(i, pos, &body[..keep]);
                }
            } else {
                let keep = body.len() / BLOCK_SIZE * BLOCK_SIZE;
                if keep >= BLOCK_SIZE {
                    let cipher = transfer.cipher();
                    let piece = FilePiece::new(pos, BytesMut::from(&body[..keep]));
                    let (piece, macs) = run_crypto(
                        &cipher,
                        piece,
                        transfer.ctriv,
                        CryptoDirection::Decrypt,
                        true,
                        transfer.size,
                    );
                    self.pending_macs.insert(piece.pos, macs);
                    self.piece_owner.insert(piece.pos, i);
                    if let Some(TransferBuffer::Direct(m)) = &mut self.buffer {
                        m.submit_piece(i, piece);
                    }
                }
            }
        }
        if let Some(TransferBuffer::Raid(m)) = &mut self.buffer {
            m.assemble();
        }

        // 2. bounded wait for in-flight crypto
        while self.crypto_inflight > 0 {
            match tokio::time::timeout(FLUSH_CRYPTO_WAIT, self.crypto_rx.recv()).await {
                Ok(Some(done)) => {
                    self.crypto_inflight -= 1;
                    self.apply_crypto_done(done, transfer);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        target: "slot",
                        transfer = self.transfer_id,
                        "Timed out waiting for in-flight decryption, discarding piece"
                    );
                    self.discard.store(true, Ordering::Release);
                    break;
                }
            }
        }

        // 3. wait for an outstanding write, then drain output synchronously
        if self.write_inflight.is_some()
            && let Ok(Some(result)) = tokio::time::timeout(FLUSH_CRYPTO_WAIT, self.io_rx.recv()).await
            && result.write
        {
            self.write_inflight = None;
            self.handle_write_result(
                result.conn,
                result.pos,
                result.len,
                result.failed,
                result.retry,
                result.buf,
                transfer,
                ctx,
            );
        }

        self.pump_raid_output(transfer, ctx);
        loop {
            let Some((owner, piece)) = self.next_write_piece() else {
                break;
            };
            if piece.is_empty() {
                continue;
            }
            if !self.ensure_file(transfer, ctx).await {
                break;
            }
            let Some(file) = self.file.as_mut() else { break };
            match file.fwrite(&piece.buf, piece.pos).await {
                Ok(()) => {
                    let (pos, len) = (piece.pos, piece.len());
                    let buf = Some(piece.buf);
                    self.commit_written_piece(owner, pos, len, buf, transfer, ctx);
                }
                Err(err) => {
                    warn!(
                        target: "slot",
                        transfer = self.transfer_id,
                        pos = piece.pos,
                        error = %err,
                        "Flush write failed, piece dropped"
                    );
                    break;
                }
            }
        }
    }
}
