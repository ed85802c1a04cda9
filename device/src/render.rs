use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::notify::UiNotifier;
use crate::processor::ProcessorHandle;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Counts render calls over a rolling one-second window.
pub struct FpsCounter {
    window_start: Instant,
    count: u32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Record one render call. Returns the rate once the window has elapsed,
    /// then starts a new window.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.count += 1;
        if now.duration_since(self.window_start) < FPS_WINDOW {
            return None;
        }
        let fps = self.count;
        self.count = 0;
        self.window_start = now;
        Some(fps)
    }
}

/// Continuous render driver on its own thread, independent of capture and
/// streaming.
pub struct RenderLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderLoop {
    /// Initialize the processor's surface and start rendering. `interval`
    /// is the pause between ticks; zero renders as fast as possible.
    pub fn spawn(
        processor: ProcessorHandle,
        notifier: Arc<dyn UiNotifier>,
        interval: Duration,
        surface: (u32, u32),
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = std::thread::Builder::new().name("render".into()).spawn({
            let running = Arc::clone(&running);
            move || run(processor, notifier, interval, surface, running)
        })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop after the current tick and wait for the thread. Blocks.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("render thread panicked");
            }
        }
    }
}

fn run(
    processor: ProcessorHandle,
    notifier: Arc<dyn UiNotifier>,
    interval: Duration,
    (width, height): (u32, u32),
    running: Arc<AtomicBool>,
) {
    let name = processor.with(|p| {
        if let Err(e) = p.initialize() {
            warn!(error = %e, "render surface initialization failed");
        }
        p.resize(width, height);
        p.name().to_string()
    });
    info!(processor = name, width, height, "render loop started");

    let mut fps = FpsCounter::new(Instant::now());
    let mut failures: u64 = 0;

    while running.load(Ordering::Acquire) {
        if let Err(e) = processor.with(|p| p.render()) {
            failures += 1;
            if failures == 1 || failures % 1000 == 0 {
                warn!(error = %e, failures, "render call failed");
            }
        }

        if let Some(value) = fps.tick(Instant::now()) {
            debug!(fps = value, "render window closed");
            notifier.on_fps(value);
        }

        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
    info!(failures, "render loop stopped");
}
