pub mod edge;

use bytes::Bytes;
use edge_viewer_common::frame::{ProcessingParameters, RawFrame};
use std::sync::{Arc, Mutex};

/// The edge-detection / encode / render pipeline, seen from the runtime.
///
/// One implementation instance owns all image and surface state. It is
/// shared by the capture worker and the render thread through a
/// [`ProcessorHandle`], which guarantees that only one of them touches it at
/// a time.
pub trait FrameProcessor: Send {
    /// Prepare render resources. Called once from the render thread.
    fn initialize(&mut self) -> Result<(), ProcessorError>;

    /// Resize the render surface.
    fn resize(&mut self, width: u32, height: u32);

    fn set_parameters(&mut self, params: ProcessingParameters);

    /// Transform one raw frame and refresh the encoded image.
    fn process(&mut self, frame: &RawFrame) -> Result<(), ProcessorError>;

    /// Draw the current state to the render surface.
    fn render(&mut self) -> Result<(), ProcessorError>;

    /// The encoded image of the last processed frame.
    fn encoded_image(&self) -> Option<Bytes>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor used before initialize()")]
    NotInitialized,
    #[error("unsupported frame dimensions {width}x{height}")]
    Dimensions { width: u32, height: u32 },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Single owner of the frame processor, cloned into the capture worker and
/// the render loop.
#[derive(Clone)]
pub struct ProcessorHandle {
    inner: Arc<Mutex<Box<dyn FrameProcessor>>>,
}

impl ProcessorHandle {
    pub fn new(processor: impl FrameProcessor + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(processor))),
        }
    }

    /// Run `f` with exclusive access to the processor.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn FrameProcessor) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.as_mut())
    }
}
