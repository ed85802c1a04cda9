use edge_viewer_common::config::CaptureConfig;
use edge_viewer_common::frame::RawFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::{CaptureBridge, Dispatch};

/// Test-pattern capture source: a bright square sweeping over a gradient.
pub async fn run_synthetic_source(
    config: CaptureConfig,
    bridge: Arc<CaptureBridge>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(period) = tick_period(config.fps) else {
        error!(fps = config.fps, "synthetic source needs 0 < fps <= 1000, not starting");
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    info!(
        width = config.width,
        height = config.height,
        fps = config.fps,
        "synthetic capture source started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let pixels = pattern(config.width, config.height, tick);
        match RawFrame::new(config.width, config.height, pixels) {
            Ok(frame) => {
                if bridge.on_raw_frame(frame) == Dispatch::Dropped && tick % 300 == 0 {
                    info!(stats = ?bridge.stats(), "processor falling behind capture");
                }
            }
            Err(e) => {
                warn!(error = %e, "synthetic source misconfigured, stopping");
                break;
            }
        }
        tick += 1;
    }
    info!("synthetic capture source stopped");
}

fn tick_period(fps: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|p| *p >= Duration::from_millis(1))
}

/// One frame of the test pattern.
pub fn pattern(width: u32, height: u32, tick: u64) -> Vec<u8> {
    let side = (width.min(height) / 4).max(1);
    let span = width.saturating_sub(side).max(1) as u64;
    let left = (tick * 4 % span) as u32;
    let top = (height - side.min(height)) / 2;

    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            let inside = x >= left && x < left + side && y >= top && y < top + side;
            let value = if inside {
                255
            } else {
                ((x * 160) / width.max(1)) as u8
            };
            pixels.push(value);
        }
    }
    pixels
}
