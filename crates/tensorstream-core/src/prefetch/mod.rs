//! Background prefetch pipeline
//!
//! Turns a stream of prefetch requests into a stream of ready-to-consume
//! tile payloads, overlapping storage I/O with the caller's work. Exactly
//! one worker thread drains the request queue in FIFO order, invokes the
//! injected fetch callback (the only blocking I/O in the core), stages the
//! result into the write half of a double buffer, and delivers it to the
//! ready queue.
//!
//! Delivery order equals enqueue order because there is a single worker.
//! The pipeline never drops requests; backpressure is visible as a growing
//! [`pending`](PrefetchPipeline::pending) count.

pub mod buffer;

pub use buffer::DoubleBuffer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::block::BlockDescriptor;
use crate::error::{CoreError, Result};
use crate::Scalar;

/// A queued fetch for one tile
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    /// Tile key the payload will be delivered under
    pub key: String,
    /// Geometry of the tile to fetch
    pub descriptor: BlockDescriptor,
}

/// A completed fetch, ready for consumption
#[derive(Debug, Clone)]
pub struct ReadyTile {
    /// Tile key from the originating request
    pub key: String,
    /// Fetched payload; empty means the fetch failed (zero tiles never
    /// enter the pipeline, so empty is unambiguous)
    pub payload: Vec<Scalar>,
}

impl ReadyTile {
    /// Whether this entry reports a fetch failure
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of a timed wait for a ready tile
#[derive(Debug)]
pub enum WaitOutcome {
    /// A tile completed
    Ready(ReadyTile),
    /// The timeout elapsed with nothing ready
    TimedOut,
    /// The pipeline was stopped
    Stopped,
}

/// Injected fetch callback.
///
/// Must return exactly `Π descriptor.tile_shape` elements; an empty vector
/// signals failure.
pub type FetchFn = Box<dyn Fn(&PrefetchRequest) -> Vec<Scalar> + Send + Sync>;

struct Queues {
    requests: VecDeque<PrefetchRequest>,
    ready: VecDeque<ReadyTile>,
}

struct Shared {
    /// One mutex guards both queues
    queues: Mutex<Queues>,
    /// Wakes the worker on request arrival or stop
    work_cv: Condvar,
    /// Wakes one consumer on ready arrival or stop
    ready_cv: Condvar,
    /// Observable without the mutex
    stop: AtomicBool,
    fetch: FetchFn,
    /// Staging region; the consumer swaps it when accepting a ready tile
    staging: Mutex<DoubleBuffer>,
}

/// Double-buffered single-worker prefetch pipeline
pub struct PrefetchPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchPipeline {
    /// Create a pipeline and spawn its worker.
    ///
    /// `staging_half_bytes` sizes each half of the double buffer; zero is
    /// legal. `fetch` performs the actual I/O on the worker thread.
    pub fn new(staging_half_bytes: usize, fetch: FetchFn) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                requests: VecDeque::new(),
                ready: VecDeque::new(),
            }),
            work_cv: Condvar::new(),
            ready_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            fetch,
            staging: Mutex::new(DoubleBuffer::new(staging_half_bytes)),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("ts-prefetch".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn prefetch worker");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue a fetch. Non-blocking; the queue is unbounded by contract.
    pub fn enqueue(&self, request: PrefetchRequest) -> Result<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(CoreError::Shutdown);
        }
        let mut queues = self.shared.queues.lock();
        queues.requests.push_back(request);
        self.shared.work_cv.notify_one();
        Ok(())
    }

    /// Non-blocking pop from the ready queue
    pub fn pop_ready(&self) -> Option<ReadyTile> {
        self.shared.queues.lock().ready.pop_front()
    }

    /// Block up to `timeout` for a ready tile.
    ///
    /// Returns promptly with [`WaitOutcome::Stopped`] once the pipeline has
    /// been asked to stop.
    pub fn wait_ready(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock();
        loop {
            if let Some(tile) = queues.ready.pop_front() {
                return WaitOutcome::Ready(tile);
            }
            if self.shared.stop.load(Ordering::Acquire) {
                return WaitOutcome::Stopped;
            }
            if self
                .shared
                .ready_cv
                .wait_until(&mut queues, deadline)
                .timed_out()
            {
                return match queues.ready.pop_front() {
                    Some(tile) => WaitOutcome::Ready(tile),
                    None => WaitOutcome::TimedOut,
                };
            }
        }
    }

    /// Depth of the request queue, excluding any in-flight fetch
    pub fn pending(&self) -> usize {
        self.shared.queues.lock().requests.len()
    }

    /// Whether the pipeline has been stopped
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Swap the staging buffer; called by the consumer when accepting a
    /// ready tile
    pub fn swap_staging(&self) {
        self.shared.staging.lock().swap();
    }

    /// Run `f` over the stable (readable) staging half
    pub fn with_staging<R>(&self, f: impl FnOnce(&[Scalar]) -> R) -> R {
        let staging = self.shared.staging.lock();
        f(staging.read_half())
    }

    /// Element capacity of one staging half
    pub fn staging_elements(&self) -> usize {
        self.shared.staging.lock().half_elements()
    }

    /// Stop the pipeline and join the worker.
    ///
    /// Idempotent: the stop flag flips exactly once and only that caller
    /// joins. Requests still queued are cancelled; an in-flight fetch runs
    /// to completion and its payload is discarded with the pipeline.
    pub fn stop(&self) {
        if self
            .shared
            .stop
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("stopping prefetch pipeline");
        self.shared.work_cv.notify_all();
        self.shared.ready_cv.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("prefetch worker panicked");
            }
        }
    }
}

impl Drop for PrefetchPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PrefetchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchPipeline")
            .field("pending", &self.pending())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("prefetch worker started");
    loop {
        let request = {
            let mut queues = shared.queues.lock();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    debug!(
                        cancelled = queues.requests.len(),
                        "prefetch worker exiting"
                    );
                    return;
                }
                if let Some(request) = queues.requests.pop_front() {
                    break request;
                }
                shared.work_cv.wait(&mut queues);
            }
        };

        let elements = request.descriptor.tile_elements();
        let mut payload = (shared.fetch)(&request);

        if payload.is_empty() {
            warn!(key = %request.key, "fetch failed, delivering error entry");
        } else if payload.len() != elements {
            warn!(
                key = %request.key,
                got = payload.len(),
                want = elements,
                "fetch returned wrong element count, demoting to failure"
            );
            payload = Vec::new();
        } else {
            // Stage into the write half; readers see the other half until
            // the consumer swaps.
            let mut staging = shared.staging.lock();
            let half = staging.write_half();
            let n = payload.len().min(half.len());
            half[..n].copy_from_slice(&payload[..n]);
        }

        let mut queues = shared.queues.lock();
        queues.ready.push_back(ReadyTile {
            key: request.key,
            payload,
        });
        shared.ready_cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn descriptor(shape: &[usize]) -> BlockDescriptor {
        BlockDescriptor::aligned(shape, &vec![1; shape.len()], std::mem::size_of::<Scalar>())
            .unwrap()
    }

    fn counting_fetch() -> FetchFn {
        Box::new(|req| {
            let n = req.descriptor.tile_elements();
            vec![n as Scalar; n]
        })
    }

    #[test]
    fn test_round_trip() {
        let pipeline = PrefetchPipeline::new(1024, counting_fetch());
        pipeline
            .enqueue(PrefetchRequest {
                key: "a".to_string(),
                descriptor: descriptor(&[4, 4]),
            })
            .unwrap();

        match pipeline.wait_ready(Duration::from_millis(500)) {
            WaitOutcome::Ready(tile) => {
                assert_eq!(tile.key, "a");
                assert_eq!(tile.payload.len(), 16);
                assert!(!tile.is_failure());
            }
            other => panic!("expected ready tile, got {:?}", other),
        }
        pipeline.stop();
    }

    #[test]
    fn test_fifo_delivery() {
        let pipeline = PrefetchPipeline::new(0, counting_fetch());
        for i in 0..8 {
            pipeline
                .enqueue(PrefetchRequest {
                    key: format!("k{}", i),
                    descriptor: descriptor(&[2]),
                })
                .unwrap();
        }

        for i in 0..8 {
            match pipeline.wait_ready(Duration::from_millis(500)) {
                WaitOutcome::Ready(tile) => assert_eq!(tile.key, format!("k{}", i)),
                other => panic!("expected ready tile, got {:?}", other),
            }
        }
        pipeline.stop();
    }

    #[test]
    fn test_wait_times_out() {
        let pipeline = PrefetchPipeline::new(0, counting_fetch());
        let start = Instant::now();
        assert!(matches!(
            pipeline.wait_ready(Duration::from_millis(50)),
            WaitOutcome::TimedOut
        ));
        assert!(start.elapsed() >= Duration::from_millis(50));
        pipeline.stop();
    }

    #[test]
    fn test_wait_observes_stop() {
        let pipeline = Arc::new(PrefetchPipeline::new(0, counting_fetch()));
        let waiter = Arc::clone(&pipeline);
        let handle = std::thread::spawn(move || waiter.wait_ready(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        pipeline.stop();
        assert!(matches!(handle.join().unwrap(), WaitOutcome::Stopped));
    }

    #[test]
    fn test_stop_idempotent() {
        let pipeline = PrefetchPipeline::new(0, counting_fetch());
        pipeline.stop();
        pipeline.stop();
        pipeline.stop();
        assert!(pipeline.is_stopped());
        assert!(matches!(
            pipeline.enqueue(PrefetchRequest {
                key: "late".to_string(),
                descriptor: descriptor(&[1]),
            }),
            Err(CoreError::Shutdown)
        ));
    }

    #[test]
    fn test_stop_idempotent_concurrent() {
        let pipeline = Arc::new(PrefetchPipeline::new(0, counting_fetch()));
        let mut handles = vec![];
        for _ in 0..4 {
            let p = Arc::clone(&pipeline);
            handles.push(std::thread::spawn(move || p.stop()));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pipeline.is_stopped());
    }

    #[test]
    fn test_failed_fetch_delivers_error_entry() {
        let fetch: FetchFn = Box::new(|_| Vec::new());
        let pipeline = PrefetchPipeline::new(0, fetch);
        pipeline
            .enqueue(PrefetchRequest {
                key: "broken".to_string(),
                descriptor: descriptor(&[4]),
            })
            .unwrap();

        match pipeline.wait_ready(Duration::from_millis(500)) {
            WaitOutcome::Ready(tile) => {
                assert_eq!(tile.key, "broken");
                assert!(tile.is_failure());
            }
            other => panic!("expected error entry, got {:?}", other),
        }
        pipeline.stop();
    }

    #[test]
    fn test_wrong_length_demoted_to_failure() {
        let fetch: FetchFn = Box::new(|_| vec![1.0; 3]);
        let pipeline = PrefetchPipeline::new(0, fetch);
        pipeline
            .enqueue(PrefetchRequest {
                key: "short".to_string(),
                descriptor: descriptor(&[4]),
            })
            .unwrap();

        match pipeline.wait_ready(Duration::from_millis(500)) {
            WaitOutcome::Ready(tile) => assert!(tile.is_failure()),
            other => panic!("expected error entry, got {:?}", other),
        }
        pipeline.stop();
    }

    #[test]
    fn test_pending_counts_queued_only() {
        // Fetch blocks until released so requests pile up behind it
        let gate = Arc::new(AtomicBool::new(false));
        let fetch_gate = Arc::clone(&gate);
        let fetch: FetchFn = Box::new(move |req| {
            while !fetch_gate.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            vec![0.0; req.descriptor.tile_elements()]
        });

        let pipeline = PrefetchPipeline::new(0, fetch);
        for i in 0..3 {
            pipeline
                .enqueue(PrefetchRequest {
                    key: format!("k{}", i),
                    descriptor: descriptor(&[1]),
                })
                .unwrap();
        }

        // Give the worker time to pull the first request in-flight
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pipeline.pending(), 2);

        gate.store(true, Ordering::Release);
        for _ in 0..3 {
            assert!(matches!(
                pipeline.wait_ready(Duration::from_millis(500)),
                WaitOutcome::Ready(_)
            ));
        }
        assert_eq!(pipeline.pending(), 0);
        pipeline.stop();
    }

    #[test]
    fn test_staging_swap_exposes_fetched_data() {
        let fetch: FetchFn = Box::new(|req| {
            let n = req.descriptor.tile_elements();
            (0..n).map(|i| i as Scalar).collect()
        });
        let pipeline = PrefetchPipeline::new(4 * std::mem::size_of::<Scalar>(), fetch);
        pipeline
            .enqueue(PrefetchRequest {
                key: "a".to_string(),
                descriptor: descriptor(&[4]),
            })
            .unwrap();

        match pipeline.wait_ready(Duration::from_millis(500)) {
            WaitOutcome::Ready(_) => {
                pipeline.swap_staging();
                pipeline.with_staging(|half| {
                    assert_eq!(half, &[0.0, 1.0, 2.0, 3.0]);
                });
            }
            other => panic!("expected ready tile, got {:?}", other),
        }
        pipeline.stop();
    }

    #[test]
    fn test_worker_counts_fetches() {
        let count = Arc::new(AtomicUsize::new(0));
        let fetch_count = Arc::clone(&count);
        let fetch: FetchFn = Box::new(move |req| {
            fetch_count.fetch_add(1, Ordering::Relaxed);
            vec![0.0; req.descriptor.tile_elements()]
        });

        let pipeline = PrefetchPipeline::new(0, fetch);
        for _ in 0..5 {
            pipeline
                .enqueue(PrefetchRequest {
                    key: "x".to_string(),
                    descriptor: descriptor(&[2]),
                })
                .unwrap();
        }
        for _ in 0..5 {
            assert!(matches!(
                pipeline.wait_ready(Duration::from_millis(500)),
                WaitOutcome::Ready(_)
            ));
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
        pipeline.stop();
    }
}
