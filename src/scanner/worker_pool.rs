//! Scan Worker Pool
//! ================
//! Fixed pool of real threads pulling from a bounded, size-prioritised
//! queue. Workers do the blocking engine I/O; completion callbacks are
//! posted back to the owning event loop and never run on worker threads.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::security_tap::ScanPipeline;
use super::{DownloadMetadata, ScanError, ScanResult};
use crate::metrics::SCAN_QUEUE_DEPTH;
use crate::runtime::TaskRemote;

/// Worker count is clamped into this range.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 16;
/// Hard cap on queued requests; enqueue beyond it fails and the caller
/// fails open.
pub const QUEUE_CAPACITY: usize = 100;
/// Requests older than this at dispatch are failed without scanning.
pub const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

const MIB: usize = 1024 * 1024;

/// Completion continuation, invoked exactly once on the event-loop thread.
pub type ScanCallback = Box<dyn FnOnce(Result<ScanResult, ScanError>) + Send + 'static>;

pub struct ScanRequest {
    pub request_id: String,
    pub meta: DownloadMetadata,
    pub content: Vec<u8>,
    pub enqueued_at: Instant,
    /// Content size in MiB capped at 999; lower scans sooner.
    pub priority: u32,
    pub(crate) callback: ScanCallback,
}

impl ScanRequest {
    pub fn new(meta: DownloadMetadata, content: Vec<u8>, callback: ScanCallback) -> Self {
        let priority = (content.len() / MIB).min(999) as u32;
        Self {
            request_id: Uuid::new_v4().to_string(),
            meta,
            content,
            enqueued_at: Instant::now(),
            priority,
            callback,
        }
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRequest")
            .field("request_id", &self.request_id)
            .field("content_len", &self.content.len())
            .field("priority", &self.priority)
            .finish()
    }
}

struct QueueEntry {
    priority: u32,
    seq: u64,
    request: ScanRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Reversed so the max-heap pops the smallest priority first, FIFO
    /// within equal priorities.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    running: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                running: true,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, request: ScanRequest) -> Result<(), ScanError> {
        {
            let mut state = self.state.lock();
            if !state.running {
                return Err(ScanError::ShuttingDown);
            }
            if state.heap.len() >= self.capacity {
                return Err(ScanError::QueueFull);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let priority = request.priority;
            state.heap.push(QueueEntry {
                priority,
                seq,
                request,
            });
            SCAN_QUEUE_DEPTH.set(state.heap.len() as f64);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a request is available. Returns `None` only after
    /// shutdown once the queue has fully drained, so enqueued requests are
    /// never dropped.
    fn pull(&self) -> Option<ScanRequest> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.heap.pop() {
                SCAN_QUEUE_DEPTH.set(state.heap.len() as f64);
                return Some(entry.request);
            }
            if !state.running {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn len(&self) -> usize {
        self.state.lock().heap.len()
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` (clamped 1..=16) threads pulling from the
    /// queue.
    pub fn start(pipeline: Arc<ScanPipeline>, remote: TaskRemote, worker_count: usize) -> Self {
        let worker_count = worker_count.clamp(MIN_WORKERS, MAX_WORKERS);
        let shared = Arc::new(Shared::new(QUEUE_CAPACITY));
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = Arc::clone(&shared);
            let pipeline = Arc::clone(&pipeline);
            let remote = remote.clone();
            let handle = std::thread::Builder::new()
                .name(format!("scan-worker-{index}"))
                .spawn(move || worker_loop(shared, pipeline, remote))
                .expect("spawning a scan worker cannot fail");
            workers.push(handle);
        }
        debug!(worker_count, "scan worker pool started");
        Self { shared, workers }
    }

    pub fn enqueue(&self, request: ScanRequest) -> Result<(), ScanError> {
        self.shared.push(request)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.len()
    }

    /// Live worker threads. Equals the configured count while running and
    /// falls to zero once `stop` returns.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cooperative shutdown: flag, broadcast, join. Idempotent. Pending
    /// requests are drained before the workers exit.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running && self.workers.is_empty() {
                return;
            }
            state.running = false;
        }
        self.available_broadcast();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("a scan worker panicked during shutdown");
            }
        }
        debug!("scan worker pool stopped");
    }

    fn available_broadcast(&self) {
        self.shared.available.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, pipeline: Arc<ScanPipeline>, remote: TaskRemote) {
    while let Some(request) = shared.pull() {
        process_request(request, &pipeline, &remote);
    }
}

pub(crate) fn process_request(
    request: ScanRequest,
    pipeline: &ScanPipeline,
    remote: &TaskRemote,
) {
    let ScanRequest {
        request_id,
        meta,
        content,
        enqueued_at,
        callback,
        ..
    } = request;
    let queued_for = enqueued_at.elapsed();
    if queued_for > MAX_SCAN_TIMEOUT {
        pipeline.note_timeout();
        warn!(request_id, queued_ms = queued_for.as_millis() as u64, "scan request expired in queue");
        remote.post(Box::new(move || callback(Err(ScanError::Timeout { queued_for }))));
        return;
    }
    let result = pipeline.inspect(&meta, &content);
    remote.post(Box::new(move || callback(result)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;
    use crate::scanner::config::ScanSizeConfig;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn meta() -> DownloadMetadata {
        DownloadMetadata {
            url: "http://example.com/a.txt".to_string(),
            filename: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
            sha256: "0".repeat(64),
            size: 1024,
        }
    }

    fn request(content_len: usize) -> ScanRequest {
        ScanRequest::new(meta(), vec![0u8; content_len], Box::new(|_| {}))
    }

    fn dead_pipeline() -> Arc<ScanPipeline> {
        // Nonexistent socket: every scan fails open, which is all these
        // tests need.
        Arc::new(ScanPipeline::new(
            PathBuf::from("/nonexistent/engine.sock"),
            ScanSizeConfig::default(),
        ))
    }

    #[test]
    fn queue_orders_by_size_then_fifo() {
        let shared = Shared::new(QUEUE_CAPACITY);
        shared.push(request(5 * MIB)).unwrap();
        shared.push(request(1 * MIB)).unwrap();
        shared.push(request(0)).unwrap();
        shared.push(request(1 * MIB + 1)).unwrap();

        let sizes: Vec<usize> = (0..4).map(|_| shared.pull().unwrap().content.len()).collect();
        // Smallest first; the two 1-MiB-priority entries keep FIFO order.
        assert_eq!(sizes, vec![0, 1 * MIB, 1 * MIB + 1, 5 * MIB]);
    }

    #[test]
    fn priority_caps_at_999() {
        let oversized = request(1200 * MIB);
        assert_eq!(oversized.priority, 999);
    }

    #[test]
    fn queue_rejects_beyond_capacity() {
        let shared = Shared::new(QUEUE_CAPACITY);
        for _ in 0..QUEUE_CAPACITY - 1 {
            shared.push(request(0)).unwrap();
        }
        // 99 queued: one more is accepted.
        shared.push(request(0)).unwrap();
        // 100 queued: the next is rejected.
        assert!(matches!(shared.push(request(0)), Err(ScanError::QueueFull)));
    }

    #[test]
    fn callbacks_fire_exactly_once_on_the_event_loop() {
        let (mut event_loop, remote) = EventLoop::new();
        let pool = WorkerPool::start(dead_pipeline(), remote, 2);
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let fired = Arc::clone(&fired);
            let callback: ScanCallback = Box::new(move |result| {
                // Engine is unreachable, so every scan fails open.
                let scan = result.expect("fail-open result");
                assert!(!scan.is_threat);
                fired.fetch_add(1, AtomicOrdering::SeqCst);
            });
            pool.enqueue(ScanRequest::new(meta(), vec![0u8; 16], callback))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while fired.load(AtomicOrdering::SeqCst) < 8 {
            event_loop.run_until_idle();
            assert!(Instant::now() < deadline, "callbacks did not all arrive");
            std::thread::sleep(Duration::from_millis(5));
        }
        event_loop.run_until_idle();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 8);
    }

    #[test]
    fn expired_requests_fail_with_timeout_before_scanning() {
        let (mut event_loop, remote) = EventLoop::new();
        let pipeline = dead_pipeline();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let mut request = ScanRequest::new(
            meta(),
            vec![0u8; 16],
            Box::new(move |result| {
                assert!(matches!(result, Err(ScanError::Timeout { .. })));
                observed.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );
        request.enqueued_at = Instant::now() - MAX_SCAN_TIMEOUT - Duration::from_secs(1);
        process_request(request, &pipeline, &remote);
        event_loop.run_until_idle();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(pipeline.telemetry_snapshot().total_scans_timeout, 1);
    }

    #[test]
    fn stop_is_idempotent_and_joins_workers() {
        let (_event_loop, remote) = EventLoop::new();
        let mut pool = WorkerPool::start(dead_pipeline(), remote, 4);
        assert_eq!(pool.worker_count(), 4);
        pool.stop();
        assert_eq!(pool.worker_count(), 0);
        pool.stop();
        assert!(matches!(
            pool.enqueue(request(0)),
            Err(ScanError::ShuttingDown)
        ));
    }
}
