//! Transfer engine: slot table, scheduler loop, and the public façade
//!
//! The engine task owns every `Transfer` and `TransferSlot`; commands and
//! collaborator wakeups are funneled into a single dispatch loop that ticks
//! the active slots. Slots and transfers reference each other only through
//! ids in the engine's tables, never through pointers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::TransferError;
use crate::fingerprint::FileFingerprint;
use crate::fs::{FileSystem, TokioFs};
use crate::http::{HttpBackend, ReqwestBackend};
use crate::inventory::TransferCache;
use crate::pool::CryptoPool;
use crate::progress::TransferProgress;
use crate::slot::{TickOutcome, TransferSlot};
use crate::transfer::{Direction, FileSink, Transfer};

/// Transfer-level retry cap (distinct from the per-slot error counter).
const MAX_TRANSFER_RETRIES: u32 = 8;

/// Everything a slot needs from its surroundings, passed into each tick.
pub struct SchedulerContext {
    pub config: EngineConfig,
    pub http: Arc<dyn HttpBackend>,
    pub fs: Arc<dyn FileSystem>,
    pub cache: Option<Arc<TransferCache>>,
    pub crypto: CryptoPool,
    pub wake: Arc<Notify>,
    pub callbacks: Arc<dyn EngineCallbacks>,
}

/// Result data delivered on successful completion.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub transfer_id: u64,
    pub direction: Direction,
    /// Obfuscated 32-byte file key (uploads)
    pub file_key: Option<[u8; 32]>,
    /// Upload-completion token (uploads)
    pub ultoken: Option<Vec<u8>>,
    pub metamac: u64,
}

/// Application-facing notifications.
pub trait EngineCallbacks: Send + Sync {
    fn on_progress(&self, _update: TransferProgress) {}
    fn on_completed(&self, _outcome: TransferOutcome) {}
    fn on_failed(&self, _transfer_id: u64, _error: TransferError, _will_retry: bool) {}
}

/// Callbacks that drop every notification.
pub struct NoopCallbacks;

impl EngineCallbacks for NoopCallbacks {}

/// Parameters for queueing a transfer.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub fingerprint: FileFingerprint,
    pub transferkey: [u8; 16],
    pub ctriv: u64,
    /// Expected mac-of-macs (downloads; ignored for uploads)
    pub metamac: u64,
    /// Pre-fetched temporary URLs: six for RAID downloads, one otherwise
    pub urls: Vec<String>,
}

enum EngineCommand {
    Queue { id: u64, request: QueueRequest },
    Cancel { id: u64, keep_for_resume: bool },
    Shutdown { ack: oneshot::Sender<()> },
}

/// Handle to the engine task.
pub struct TransferEngine {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
    next_id: AtomicU64,
    progress: Arc<DashMap<u64, TransferProgress>>,
    wake: Arc<Notify>,
}

impl TransferEngine {
    /// Engine with the production collaborators (reqwest + tokio::fs).
    pub fn new(
        config: EngineConfig,
        cache: Option<Arc<TransferCache>>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Arc<Self> {
        let http = Arc::new(ReqwestBackend::new(config.request_timeout));
        Self::with_collaborators(config, http, Arc::new(TokioFs), cache, callbacks)
    }

    /// Engine with explicit collaborators (used by tests and embedders).
    pub fn with_collaborators(
        config: EngineConfig,
        http: Arc<dyn HttpBackend>,
        fs: Arc<dyn FileSystem>,
        cache: Option<Arc<TransferCache>>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        let progress = Arc::new(DashMap::new());
        let fan = Arc::new(ProgressFan {
            inner: callbacks,
            progress: Arc::clone(&progress),
        });
        let crypto = CryptoPool::new(config.crypto_workers);
        let ctx = SchedulerContext {
            config,
            http,
            fs,
            cache,
            crypto,
            wake: Arc::clone(&wake),
            callbacks: fan,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            command_tx,
            next_id: AtomicU64::new(1),
            progress,
            wake: Arc::clone(&wake),
        });

        let state = EngineState {
            ctx,
            transfers: HashMap::new(),
            queue_order: VecDeque::new(),
        };
        tokio::spawn(state.run(command_rx));
        engine
    }

    /// Queues a transfer; the id identifies it in callbacks and commands.
    pub fn queue(&self, request: QueueRequest) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .command_tx
            .send(EngineCommand::Queue { id, request })
            .is_err()
        {
            warn!(target: "engine", "Engine task is gone, queue request dropped");
        }
        self.wake.notify_one();
        id
    }

    /// Cancels a transfer. With `keep_for_resume` the cache record survives
    /// so a later queue call resumes from the flushed watermark.
    pub fn cancel(&self, id: u64, keep_for_resume: bool) {
        let _ = self.command_tx.send(EngineCommand::Cancel {
            id,
            keep_for_resume,
        });
        self.wake.notify_one();
    }

    /// Flushes and stops every active slot, then stops the engine task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .command_tx
            .send(EngineCommand::Shutdown { ack })
            .is_ok()
        {
            self.wake.notify_one();
            let _ = done.await;
        }
    }

    pub fn progress_snapshot(&self) -> Vec<TransferProgress> {
        self.progress.iter().map(|e| e.value().clone()).collect()
    }
}

/// Records progress into the shared map before forwarding to the caller.
struct ProgressFan {
    inner: Arc<dyn EngineCallbacks>,
    progress: Arc<DashMap<u64, TransferProgress>>,
}

impl EngineCallbacks for ProgressFan {
    fn on_progress(&self, update: TransferProgress) {
        self.progress.insert(update.transfer_id, update.clone());
        self.inner.on_progress(update);
    }

    fn on_completed(&self, outcome: TransferOutcome) {
        self.progress.remove(&outcome.transfer_id);
        self.inner.on_completed(outcome);
    }

    fn on_failed(&self, transfer_id: u64, error: TransferError, will_retry: bool) {
        if !will_retry {
            self.progress.remove(&transfer_id);
        }
        self.inner.on_failed(transfer_id, error, will_retry);
    }
}

struct ActiveTransfer {
    transfer: Transfer,
    slot: Option<TransferSlot>,
    /// Earliest next tick (slot backoff, retry backoff, overquota window)
    not_before: Option<Instant>,
    retries: u32,
}

struct EngineState {
    ctx: SchedulerContext,
    transfers: HashMap<u64, ActiveTransfer>,
    queue_order: VecDeque<u64>,
}

impl EngineState {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<EngineCommand>) {
        info!(
            target: "engine",
            max_slots = self.ctx.config.max_active_slots,
            "Transfer engine started"
        );
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(EngineCommand::Queue { id, request }) => self.handle_queue(id, request),
                    Some(EngineCommand::Cancel { id, keep_for_resume }) => {
                        self.handle_cancel(id, keep_for_resume).await;
                    }
                    Some(EngineCommand::Shutdown { ack }) => {
                        self.shutdown_all().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown_all().await;
                        break;
                    }
                },
                _ = self.ctx.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            self.tick().await;
        }
        info!(target: "engine", "Transfer engine stopped");
    }

    fn handle_queue(&mut self, id: u64, request: QueueRequest) {
        let mut transfer = self
            .resume_from_cache(&request)
            .unwrap_or_else(|| {
                Transfer::new(
                    request.direction,
                    request.fingerprint,
                    request.transferkey,
                    request.ctriv,
                    request.metamac,
                    FileSink::for_file(
                        request.local_path.to_string_lossy().into_owned(),
                        request.fingerprint,
                    ),
                    Vec::new(),
                )
            });
        transfer.urls = request.urls;

        debug!(
            target: "engine",
            id,
            direction = transfer.direction.as_str(),
            size = transfer.size,
            resume = transfer.progresscompleted,
            "Transfer queued"
        );
        self.transfers.insert(
            id,
            ActiveTransfer {
                transfer,
                slot: None,
                not_before: None,
                retries: 0,
            },
        );
        self.queue_order.push_back(id);
    }

    /// A matching cache record resumes the transfer from its durable
    /// watermark instead of starting over.
    fn resume_from_cache(&self, request: &QueueRequest) -> Option<Transfer> {
        let cache = self.ctx.cache.as_ref()?;
        let key = format!(
            "{}:{}",
            request.direction.as_str(),
            request.fingerprint.cache_key()
        );
        match cache.load(&key) {
            Ok(Some(transfer)) => {
                info!(
                    target: "engine",
                    key = %key,
                    progress = transfer.progresscompleted,
                    "Resuming transfer from cache"
                );
                Some(transfer)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(target: "engine", error = %err, "Failed to read transfer cache");
                None
            }
        }
    }

    async fn handle_cancel(&mut self, id: u64, keep_for_resume: bool) {
        let Some(mut at) = self.transfers.remove(&id) else {
            return;
        };
        self.queue_order.retain(|&q| q != id);
        if let Some(mut slot) = at.slot.take() {
            slot.shutdown(&mut at.transfer, &self.ctx).await;
        }
        if !keep_for_resume
            && let Some(cache) = &self.ctx.cache
            && let Err(err) = cache.remove(&at.transfer.cache_key())
        {
            warn!(target: "engine", error = %err, "Failed to drop cancelled transfer record");
        }
        info!(target: "engine", id, keep_for_resume, "Transfer cancelled");
    }

    async fn tick(&mut self) {
        self.activate_pending();

        let now = Instant::now();
        let ids: Vec<u64> = self.queue_order.iter().copied().collect();
        for id in ids {
            let Some(at) = self.transfers.get_mut(&id) else {
                continue;
            };
            if at.slot.is_none() {
                continue;
            }
            if let Some(not_before) = at.not_before {
                if not_before > now {
                    continue;
                }
                at.not_before = None;
            }

            let slot = at.slot.as_mut().unwrap();
            match slot.doio(&mut at.transfer, &self.ctx).await {
                TickOutcome::Continue => {}
                TickOutcome::Backoff(delay) => {
                    at.not_before = Some(Instant::now() + delay);
                }
                TickOutcome::Completed => self.finish(id).await,
                TickOutcome::Failed(err) => self.fail(id, err).await,
            }
        }
    }

    /// Activates queued transfers while slots are available. Exactly one
    /// slot exists per active transfer.
    fn activate_pending(&mut self) {
        let mut active = self
            .transfers
            .values()
            .filter(|t| t.slot.is_some())
            .count();
        let now = Instant::now();
        let ids: Vec<u64> = self.queue_order.iter().copied().collect();
        for id in ids {
            if active >= self.ctx.config.max_active_slots {
                break;
            }
            let Some(at) = self.transfers.get_mut(&id) else {
                continue;
            };
            if at.slot.is_some() {
                continue;
            }
            if at.not_before.map(|t| t > now).unwrap_or(false) {
                continue;
            }
            if at.transfer.urls.is_empty() {
                continue; // no temporary URLs yet
            }
            at.slot = Some(TransferSlot::new(id));
            active += 1;
            debug!(target: "engine", id, "Slot activated");
        }
    }

    async fn finish(&mut self, id: u64) {
        let Some(mut at) = self.transfers.remove(&id) else {
            return;
        };
        self.queue_order.retain(|&q| q != id);

        let file_key = match at.transfer.direction {
            Direction::Put => Some(at.transfer.finalize_upload_key()),
            Direction::Get => None,
        };
        if let Some(cache) = &self.ctx.cache
            && let Err(err) = cache.remove(&at.transfer.cache_key())
        {
            warn!(target: "engine", error = %err, "Failed to drop completed transfer record");
        }
        info!(
            target: "engine",
            id,
            direction = at.transfer.direction.as_str(),
            size = at.transfer.size,
            "Transfer completed"
        );
        self.ctx.callbacks.on_completed(TransferOutcome {
            transfer_id: id,
            direction: at.transfer.direction,
            file_key,
            ultoken: at.transfer.ultoken.take(),
            metamac: at.transfer.metamac,
        });
    }

    async fn fail(&mut self, id: u64, err: TransferError) {
        let Some(at) = self.transfers.get_mut(&id) else {
            return;
        };

        // flush whatever is salvageable before deciding the disposition
        if let Some(mut slot) = at.slot.take() {
            slot.shutdown(&mut at.transfer, &self.ctx).await;
        }

        let refresh_needed = matches!(
            err,
            TransferError::Again {
                needs_url_refresh: true
            }
        );
        let retryable =
            err.is_transient() && !refresh_needed && at.retries < MAX_TRANSFER_RETRIES;

        if retryable {
            at.retries += 1;
            let delay = match &err {
                TransferError::OverQuota { timeleft } => {
                    (*timeleft).unwrap_or(self.ctx.config.overquota_default_backoff)
                }
                _ => {
                    let base = self.ctx.config.retry_backoff;
                    base * 2u32.pow(at.retries.min(6))
                }
            };
            at.not_before = Some(Instant::now() + delay);
            warn!(
                target: "engine",
                id,
                error = %err,
                retry_in_ms = delay.as_millis(),
                attempt = at.retries,
                "Transfer failed, will retry"
            );
            self.ctx.callbacks.on_failed(id, err, true);
            return;
        }

        // fatal (or the caller must supply fresh URLs): report and release
        // the slot; the cache record survives so a later queue call resumes
        error!(target: "engine", id, error = %err, "Transfer failed");
        self.queue_order.retain(|&q| q != id);
        self.transfers.remove(&id);
        self.ctx.callbacks.on_failed(id, err, false);
    }

    async fn shutdown_all(&mut self) {
        let ids: Vec<u64> = self.transfers.keys().copied().collect();
        for id in ids {
            if let Some(at) = self.transfers.get_mut(&id)
                && let Some(mut slot) = at.slot.take()
            {
                slot.shutdown(&mut at.transfer, &self.ctx).await;
            }
        }
        self.transfers.clear();
        self.queue_order.clear();
    }
}
