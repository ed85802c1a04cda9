use std::sync::Arc;
use tracing::info;

/// UI collaborator: receives FPS updates and availability notices.
///
/// The runtime keeps going whether or not anything is listening.
pub trait UiNotifier: Send + Sync {
    fn on_fps(&self, fps: u32);
    fn on_notice(&self, notice: &str);
}

/// Logs everything through `tracing`.
pub struct TracingNotifier;

impl UiNotifier for TracingNotifier {
    fn on_fps(&self, fps: u32) {
        info!(fps, "render rate");
    }

    fn on_notice(&self, notice: &str) {
        info!("{notice}");
    }
}

/// Forwards to several notifiers in order.
pub struct Fanout(pub Vec<Arc<dyn UiNotifier>>);

impl UiNotifier for Fanout {
    fn on_fps(&self, fps: u32) {
        for n in &self.0 {
            n.on_fps(fps);
        }
    }

    fn on_notice(&self, notice: &str) {
        for n in &self.0 {
            n.on_notice(notice);
        }
    }
}
