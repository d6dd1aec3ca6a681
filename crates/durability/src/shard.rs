//! A single WAL shard: bounded queue feeding one segment stream.
//!
//! The shard is the unit of single-writer discipline inside the WAL. One
//! worker thread owns the [`SegmentWriter`]; the queue is the only shared
//! structure, guarded by a mutex and two condition variables (one waking
//! the worker, one releasing blocked producers).
//!
//! # Backpressure
//!
//! When the queue is full, [`WalShard::log`] blocks the producer until the
//! worker pops. This is intentional: the caller's rate is the admission
//! controller. Dropping on full would acknowledge writes that were never
//! made durable.

use crate::config::WalConfig;
use crate::encoding::encode_series;
use crate::replay::{replay_dir, ReplaySummary};
use crate::segment::{list_segment_numbers, segment_path, SegmentWriter};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tephra_core::{Error, Result, TimeSeries};
use tracing::{debug, warn};

/// Maximum items the worker drains per wakeup. One fsync covers the whole
/// batch.
const MAX_BATCH: usize = 1000;

struct ShardState {
    queue: VecDeque<TimeSeries>,
    running: bool,
    /// Items drained from the queue but not yet covered by an fsync.
    in_flight: usize,
}

struct ShardInner {
    state: Mutex<ShardState>,
    /// Wakes the worker when the queue becomes non-empty (or on shutdown).
    work_available: Condvar,
    /// Releases producers blocked on a full queue.
    space_available: Condvar,
    /// Wakes flush waiters after the worker's per-batch fsync.
    drained: Condvar,
    max_queue: usize,
    segment_size: u64,
    io_errors: AtomicU64,
    /// Artificial per-batch delay, used by tests to provoke backpressure.
    worker_delay_ms: AtomicU64,
}

/// One WAL shard: a producer–consumer queue, a worker thread, and an
/// append-only segment stream on disk.
pub struct WalShard {
    inner: Arc<ShardInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dir: PathBuf,
}

impl WalShard {
    /// Open a shard over `dir`, spawning its worker thread.
    ///
    /// Existing segments are resumed (the writer appends to the highest
    /// numbered one); a fresh directory starts at segment 0.
    pub fn open(dir: &Path, config: &WalConfig) -> Result<Self> {
        let writer = SegmentWriter::open(dir)?;

        let inner = Arc::new(ShardInner {
            state: Mutex::new(ShardState {
                queue: VecDeque::new(),
                running: true,
                in_flight: 0,
            }),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            drained: Condvar::new(),
            max_queue: config.queue_depth_per_shard,
            segment_size: config.segment_size_bytes,
            io_errors: AtomicU64::new(0),
            worker_delay_ms: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let thread_name = format!(
            "tephra-wal-{}",
            dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
        );
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(worker_inner, writer))
            .map_err(Error::Io)?;

        Ok(WalShard {
            inner,
            worker: Mutex::new(Some(handle)),
            dir: dir.to_path_buf(),
        })
    }

    /// Enqueue a series for durable append.
    ///
    /// Blocks while the queue is at capacity. Returns after enqueue; the
    /// fsync happens on the worker, and [`WalShard::flush`] is the barrier
    /// that guarantees it has landed.
    pub fn log(&self, series: TimeSeries) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.running && state.queue.len() >= self.inner.max_queue {
            self.inner.space_available.wait(&mut state);
        }
        if !state.running {
            return Err(Error::Internal("WAL shard is shut down".to_string()));
        }
        state.queue.push_back(series);
        drop(state);

        self.inner.work_available.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and the worker's fsync has covered
    /// everything that was enqueued before this call.
    pub fn flush(&self) -> Result<()> {
        self.inner.work_available.notify_one();

        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.in_flight > 0 {
            self.inner.drained.wait(&mut state);
        }
        Ok(())
    }

    /// Replay every segment in this shard's directory.
    ///
    /// Called at startup, before any writes are enqueued. A missing
    /// directory replays as empty.
    pub fn replay(&self, callback: &mut dyn FnMut(TimeSeries)) -> Result<ReplaySummary> {
        Ok(replay_dir(&self.dir, callback)?)
    }

    /// Delete segments older than the newest `keep_n`.
    ///
    /// Returns the number of segments removed.
    pub fn checkpoint(&self, keep_n: usize) -> Result<usize> {
        let segments = list_segment_numbers(&self.dir)?;
        let delete_count = segments.len().saturating_sub(keep_n);

        for &number in &segments[..delete_count] {
            std::fs::remove_file(segment_path(&self.dir, number))?;
        }

        if delete_count > 0 {
            debug!(
                target: "tephra::wal",
                shard = %self.dir.display(),
                deleted = delete_count,
                "Checkpoint removed old WAL segments"
            );
        }
        Ok(delete_count)
    }

    /// Signal shutdown, drain the queue, and join the worker.
    ///
    /// Idempotent; later calls return immediately.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return Ok(());
            }
            state.running = false;
        }
        self.inner.work_available.notify_all();
        self.inner.space_available.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            handle
                .join()
                .map_err(|_| Error::Internal("WAL shard worker panicked".to_string()))?;
        }
        Ok(())
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Cumulative I/O failures observed by the worker.
    pub fn io_errors(&self) -> u64 {
        self.inner.io_errors.load(Ordering::Relaxed)
    }

    /// Shard directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Test hook: delay the worker before each batch so producers outrun it.
    pub fn set_worker_delay_for_testing(&self, delay: Duration) {
        self.inner
            .worker_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Drop for WalShard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn worker_loop(inner: Arc<ShardInner>, mut writer: SegmentWriter) {
    let mut batch: Vec<TimeSeries> = Vec::with_capacity(MAX_BATCH.min(inner.max_queue));

    loop {
        {
            let mut state = inner.state.lock();
            while state.queue.is_empty() && state.running {
                inner.work_available.wait(&mut state);
            }
            if state.queue.is_empty() && !state.running {
                break;
            }

            let take = state.queue.len().min(MAX_BATCH);
            batch.extend(state.queue.drain(..take));
            state.in_flight = batch.len();
            inner.space_available.notify_all();
        }

        let delay_ms = inner.worker_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }

        debug!(target: "tephra::wal", items = batch.len(), "Draining WAL batch");

        for series in batch.drain(..) {
            let payload = encode_series(&series);
            match writer.append(&payload, false) {
                Ok(_) => {
                    // Rotation runs after a successful append so a record is
                    // never split across segments.
                    if writer.size() > inner.segment_size {
                        if let Err(e) = writer.rotate() {
                            inner.io_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                target: "tephra::wal",
                                error = %e,
                                "WAL segment rotation failed; continuing on current segment"
                            );
                        }
                    }
                }
                Err(e) => {
                    inner.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "tephra::wal", error = %e, "WAL record append failed");
                }
            }
        }

        // One fsync per batch, then release flush waiters.
        if let Err(e) = writer.sync() {
            inner.io_errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "tephra::wal", error = %e, "WAL fsync failed");
        }

        let mut state = inner.state.lock();
        state.in_flight = 0;
        inner.drained.notify_all();
    }

    if let Err(e) = writer.close() {
        warn!(target: "tephra::wal", error = %e, "WAL segment close failed");
    }
}
