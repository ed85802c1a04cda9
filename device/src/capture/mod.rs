pub mod mjpeg;
pub mod synthetic;

use edge_viewer_common::frame::{FrameError, RawFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::processor::ProcessorHandle;
use crate::state::SharedFrameState;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to spawn processing worker: {0}")]
    Spawn(std::io::Error),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode JPEG part: {0}")]
    Decode(String),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
}

/// What happened to a frame handed to [`CaptureBridge::on_raw_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Dispatched,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub delivered: u64,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
}

enum Job {
    Frame(RawFrame),
    Stop,
}

#[derive(Default)]
struct Counters {
    busy: AtomicBool,
    stopped: AtomicBool,
    delivered: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Non-blocking adapter between a capture source and the frame processor.
///
/// Frames are handed to one dedicated worker thread. While that worker is
/// busy, newly delivered frames are dropped rather than queued, so latency
/// stays bounded no matter how far the camera outpaces processing.
pub struct CaptureBridge {
    counters: Arc<Counters>,
    // Room for one in-flight frame plus the stop message.
    tx: mpsc::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureBridge {
    /// Spawn the processing worker.
    pub fn start(
        processor: ProcessorHandle,
        state: Arc<SharedFrameState>,
    ) -> Result<Self, CaptureError> {
        let (tx, rx) = mpsc::channel(2);
        let counters = Arc::new(Counters::default());
        let worker = std::thread::Builder::new()
            .name("frame-processor".into())
            .spawn({
                let counters = Arc::clone(&counters);
                move || run_worker(rx, processor, state, counters)
            })
            .map_err(CaptureError::Spawn)?;

        Ok(Self {
            counters,
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hand one raw frame over. Returns immediately.
    pub fn on_raw_frame(&self, frame: RawFrame) -> Dispatch {
        let c = &self.counters;
        c.delivered.fetch_add(1, Ordering::Relaxed);

        if c.stopped.load(Ordering::Acquire)
            || c
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            c.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("processor busy, dropping frame");
            return Dispatch::Dropped;
        }

        match self.tx.try_send(Job::Frame(frame)) {
            Ok(()) => Dispatch::Dispatched,
            Err(_) => {
                c.busy.store(false, Ordering::Release);
                c.dropped.fetch_add(1, Ordering::Relaxed);
                Dispatch::Dropped
            }
        }
    }

    /// True while the worker is processing a frame.
    pub fn is_busy(&self) -> bool {
        self.counters.busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.counters;
        CaptureStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting frames and wait for the worker to finish the frame in
    /// flight. Blocks; call from a blocking context.
    pub fn shutdown(&self) {
        if self.counters.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.tx.try_send(Job::Stop).is_err() {
            warn!("could not signal processing worker to stop");
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("processing worker panicked");
            }
        }
        info!(stats = ?self.stats(), "capture bridge stopped");
    }
}

fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    processor: ProcessorHandle,
    state: Arc<SharedFrameState>,
    counters: Arc<Counters>,
) {
    debug!("processing worker started");
    while let Some(job) = rx.blocking_recv() {
        let frame = match job {
            Job::Frame(frame) => frame,
            Job::Stop => break,
        };

        let params = state.parameters();
        let result = processor.with(|p| {
            p.set_parameters(params);
            p.process(&frame)?;
            Ok::<_, crate::processor::ProcessorError>(p.encoded_image())
        });
        drop(frame);

        match result {
            Ok(encoded) => {
                if let Some(jpeg) = encoded {
                    state.publish_frame(jpeg);
                }
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "frame processing failed");
            }
        }
        counters.busy.store(false, Ordering::Release);
    }
    debug!("processing worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{FrameProcessor, ProcessorError};
    use bytes::Bytes;
    use edge_viewer_common::frame::ProcessingParameters;
    use std::time::{Duration, Instant};

    /// Sleeps in `process` and encodes the parameters it saw.
    struct SlowProcessor {
        delay: Duration,
        last: Option<Bytes>,
        params: ProcessingParameters,
    }

    impl FrameProcessor for SlowProcessor {
        fn initialize(&mut self) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn resize(&mut self, _width: u32, _height: u32) {}
        fn set_parameters(&mut self, params: ProcessingParameters) {
            self.params = params;
        }
        fn process(&mut self, frame: &RawFrame) -> Result<(), ProcessorError> {
            std::thread::sleep(self.delay);
            if frame.width == 13 {
                return Err(ProcessorError::Encode("unlucky width".into()));
            }
            self.last = Some(Bytes::from(format!(
                "{}x{} {}/{}",
                frame.width, frame.height, self.params.low, self.params.high
            )));
            Ok(())
        }
        fn render(&mut self) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn encoded_image(&self) -> Option<Bytes> {
            self.last.clone()
        }
    }

    fn bridge(delay: Duration) -> (CaptureBridge, Arc<SharedFrameState>) {
        let state = Arc::new(SharedFrameState::new(ProcessingParameters::new(5, 9)));
        let processor = ProcessorHandle::new(SlowProcessor {
            delay,
            last: None,
            params: ProcessingParameters::default(),
        });
        let bridge = CaptureBridge::start(processor, Arc::clone(&state)).unwrap();
        (bridge, state)
    }

    fn frame(width: u32) -> RawFrame {
        RawFrame::new(width, 2, vec![0u8; width as usize * 2]).unwrap()
    }

    fn wait_idle(bridge: &CaptureBridge) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while bridge.is_busy() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn processed_frame_is_published_with_current_parameters() {
        let (bridge, state) = bridge(Duration::ZERO);
        assert_eq!(bridge.on_raw_frame(frame(4)), Dispatch::Dispatched);
        wait_idle(&bridge);
        assert_eq!(&state.frame().unwrap()[..], b"4x2 5/9");

        state.set_parameters(ProcessingParameters::new(50, 150));
        assert_eq!(bridge.on_raw_frame(frame(6)), Dispatch::Dispatched);
        wait_idle(&bridge);
        assert_eq!(&state.frame().unwrap()[..], b"6x2 50/150");
        bridge.shutdown();
    }

    #[test]
    fn drops_frames_while_busy_without_blocking() {
        let (bridge, state) = bridge(Duration::from_millis(20));
        let mut slowest = Duration::ZERO;
        for _ in 0..50 {
            let started = Instant::now();
            bridge.on_raw_frame(frame(4));
            slowest = slowest.max(started.elapsed());
            std::thread::sleep(Duration::from_millis(1));
        }
        wait_idle(&bridge);

        let stats = bridge.stats();
        assert_eq!(stats.delivered, 50);
        assert!(stats.processed < stats.delivered, "{stats:?}");
        assert!(stats.dropped > 0);
        assert_eq!(stats.processed + stats.dropped, stats.delivered);
        assert!(slowest < Duration::from_millis(10), "dispatch took {slowest:?}");
        assert!(state.frame().is_some());
        bridge.shutdown();
    }

    #[test]
    fn failed_frame_does_not_wedge_the_worker() {
        let (bridge, state) = bridge(Duration::ZERO);
        bridge.on_raw_frame(frame(13));
        wait_idle(&bridge);
        assert!(state.frame().is_none());
        assert_eq!(bridge.stats().failed, 1);

        assert_eq!(bridge.on_raw_frame(frame(4)), Dispatch::Dispatched);
        wait_idle(&bridge);
        assert!(state.frame().is_some());
        bridge.shutdown();
    }

    #[test]
    fn frames_after_shutdown_are_dropped() {
        let (bridge, _state) = bridge(Duration::ZERO);
        bridge.shutdown();
        assert_eq!(bridge.on_raw_frame(frame(4)), Dispatch::Dropped);
        // A second shutdown is a no-op.
        bridge.shutdown();
    }
}
