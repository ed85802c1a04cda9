use bytes::Bytes;
use edge_viewer_common::frame::ProcessingParameters;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// The only state shared between the capture worker, the viewer tasks, the
/// control channel and the snapshot path.
///
/// Both fields are synchronised independently:
/// - the threshold pair lives in one packed atomic word, so a reader can
///   never see the low half of one update and the high half of another;
/// - the encoded frame is an immutable `Bytes` handle swapped under a short
///   write lock. Readers clone the handle and keep reading their copy even
///   after a newer frame replaces it.
pub struct SharedFrameState {
    params: AtomicU64,
    frame: RwLock<Option<Bytes>>,
    published: AtomicU64,
}

impl SharedFrameState {
    pub fn new(initial: ProcessingParameters) -> Self {
        Self {
            params: AtomicU64::new(initial.pack()),
            frame: RwLock::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// Replace both thresholds at once. No range checking happens here.
    pub fn set_parameters(&self, params: ProcessingParameters) {
        self.params.store(params.pack(), Ordering::Release);
    }

    pub fn parameters(&self) -> ProcessingParameters {
        ProcessingParameters::unpack(self.params.load(Ordering::Acquire))
    }

    /// Make `jpeg` the newest frame.
    pub fn publish_frame(&self, jpeg: Bytes) {
        let mut slot = self.frame.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(jpeg);
        drop(slot);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// The newest frame, or `None` before the first publish.
    pub fn frame(&self) -> Option<Bytes> {
        self.frame
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for SharedFrameState {
    fn default() -> Self {
        Self::new(ProcessingParameters::default())
    }
}
