use bytes::Bytes;
use edge_viewer_common::frame::{ProcessingParameters, RawFrame};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::GrayImage;
use tracing::debug;

use super::{FrameProcessor, ProcessorError};

/// Software edge processor.
///
/// Pipeline per frame:
/// 1. 3x3 Sobel gradient, L1 magnitude `|gx| + |gy|`
/// 2. Hysteresis: a pixel is an edge if its magnitude is `>= high`, or
///    `>= low` and one of its 8 neighbours is `>= high`
/// 3. Optional 90 degree clockwise rotation for the stream
/// 4. JPEG encode, once per processed frame
///
/// `render` scales the latest edge map onto a CPU surface, only when a new
/// frame arrived since the previous draw.
pub struct EdgeProcessor {
    params: ProcessingParameters,
    quality: u8,
    rotate: bool,
    initialized: bool,
    edges: Option<GrayImage>,
    encoded: Option<Bytes>,
    frame_ready: bool,
    surface_size: (u32, u32),
    surface: Option<GrayImage>,
}

impl EdgeProcessor {
    pub fn new(quality: u8, rotate: bool) -> Self {
        Self {
            params: ProcessingParameters::default(),
            quality: quality.clamp(1, 100),
            rotate,
            initialized: false,
            edges: None,
            encoded: None,
            frame_ready: false,
            surface_size: (0, 0),
            surface: None,
        }
    }

    /// The last drawn surface.
    pub fn surface(&self) -> Option<&GrayImage> {
        self.surface.as_ref()
    }

    /// The last edge map, unrotated.
    pub fn edges(&self) -> Option<&GrayImage> {
        self.edges.as_ref()
    }

    fn encode(&self, img: &GrayImage) -> Result<Bytes, ProcessorError> {
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
        encoder
            .encode_image(img)
            .map_err(|e| ProcessorError::Encode(e.to_string()))?;
        Ok(Bytes::from(jpeg))
    }
}

impl FrameProcessor for EdgeProcessor {
    fn initialize(&mut self) -> Result<(), ProcessorError> {
        self.initialized = true;
        self.frame_ready = self.edges.is_some();
        debug!("edge processor initialized");
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.surface_size = (width, height);
        self.surface = None;
        self.frame_ready = self.edges.is_some();
    }

    fn set_parameters(&mut self, params: ProcessingParameters) {
        self.params = params;
    }

    fn process(&mut self, frame: &RawFrame) -> Result<(), ProcessorError> {
        let (w, h) = (frame.width, frame.height);
        let magnitude = gradient_magnitude(frame);
        let pixels = hysteresis(&magnitude, w as usize, h as usize, self.params);
        let edges = GrayImage::from_raw(w, h, pixels)
            .ok_or(ProcessorError::Dimensions { width: w, height: h })?;

        let encoded = if self.rotate {
            self.encode(&imageops::rotate90(&edges))?
        } else {
            self.encode(&edges)?
        };

        self.encoded = Some(encoded);
        self.edges = Some(edges);
        self.frame_ready = true;
        Ok(())
    }

    fn render(&mut self) -> Result<(), ProcessorError> {
        if !self.initialized {
            return Err(ProcessorError::NotInitialized);
        }
        let (sw, sh) = self.surface_size;
        if !self.frame_ready || sw == 0 || sh == 0 {
            return Ok(());
        }
        if let Some(edges) = &self.edges {
            self.surface = Some(imageops::resize(edges, sw, sh, FilterType::Nearest));
        }
        self.frame_ready = false;
        Ok(())
    }

    fn encoded_image(&self) -> Option<Bytes> {
        self.encoded.clone()
    }

    fn name(&self) -> &str {
        "sobel-hysteresis"
    }
}

fn gradient_magnitude(frame: &RawFrame) -> Vec<i32> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut magnitude = vec![0i32; w * h];
    if w < 3 || h < 3 {
        return magnitude;
    }
    let px = |x: usize, y: usize| frame.pixels[y * w + x] as i32;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
            magnitude[y * w + x] = gx.abs() + gy.abs();
        }
    }
    magnitude
}

/// Strong pixels (>= high) seed the map; weak pixels (>= low) are kept when
/// an 8-connected chain of weak pixels links them to a strong one.
fn hysteresis(magnitude: &[i32], w: usize, h: usize, params: ProcessingParameters) -> Vec<u8> {
    let mut out = vec![0u8; w * h];
    let mut stack: Vec<usize> = Vec::new();

    for (i, &m) in magnitude.iter().enumerate() {
        if m >= params.high {
            out[i] = 255;
            stack.push(i);
        }
    }

    while let Some(i) = stack.pop() {
        let (x, y) = (i % w, i / w);
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                let j = ny * w + nx;
                if out[j] == 0 && magnitude[j] >= params.low {
                    out[j] = 255;
                    stack.push(j);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Left half black, right half white.
    fn step_frame(width: u32, height: u32) -> RawFrame {
        let pixels: Vec<u8> = (0..height)
            .flat_map(|_| (0..width).map(move |x| if x < width / 2 { 0 } else { 255 }))
            .collect();
        RawFrame::new(width, height, pixels).unwrap()
    }

    #[test]
    fn flat_frame_has_no_edges() {
        let mut p = EdgeProcessor::new(80, false);
        p.process(&RawFrame::new(8, 8, vec![128u8; 64]).unwrap()).unwrap();
        assert!(p.edges().unwrap().pixels().all(|px| px.0[0] == 0));
    }

    #[test]
    fn step_edge_is_detected() {
        let mut p = EdgeProcessor::new(80, false);
        p.set_parameters(ProcessingParameters::new(50, 150));
        p.process(&step_frame(16, 8)).unwrap();

        let edges = p.edges().unwrap();
        // The step sits between columns 7 and 8.
        assert_eq!(edges.get_pixel(7, 4).0[0], 255);
        assert_eq!(edges.get_pixel(8, 4).0[0], 255);
        assert_eq!(edges.get_pixel(2, 4).0[0], 0);
        assert_eq!(edges.get_pixel(13, 4).0[0], 0);
    }

    #[test]
    fn high_threshold_suppresses_weak_step() {
        // A 20-level step gives an L1 magnitude of 80.
        let pixels: Vec<u8> = (0..8)
            .flat_map(|_| (0..16).map(|x| if x < 8 { 100 } else { 120 }))
            .collect();
        let frame = RawFrame::new(16, 8, pixels).unwrap();

        let mut p = EdgeProcessor::new(80, false);
        p.set_parameters(ProcessingParameters::new(50, 150));
        p.process(&frame).unwrap();
        assert!(p.edges().unwrap().pixels().all(|px| px.0[0] == 0));

        p.set_parameters(ProcessingParameters::new(10, 60));
        p.process(&frame).unwrap();
        assert_eq!(p.edges().unwrap().get_pixel(8, 4).0[0], 255);
    }

    #[test]
    fn weak_pixel_needs_strong_neighbour() {
        let mut magnitude = vec![0i32; 9];
        magnitude[4] = 60;
        let params = ProcessingParameters::new(50, 150);
        assert_eq!(hysteresis(&magnitude, 3, 3, params)[4], 0);

        magnitude[0] = 200;
        let out = hysteresis(&magnitude, 3, 3, params);
        assert_eq!(out[0], 255);
        assert_eq!(out[4], 255);
    }

    #[test]
    fn weak_chain_follows_strong_seed() {
        // One row: strong at 0, weak run 1..=4, gap at 5, weak at 6.
        let magnitude = [200, 60, 60, 60, 60, 10, 60];
        let out = hysteresis(&magnitude, 7, 1, ProcessingParameters::new(50, 150));
        assert_eq!(out, vec![255, 255, 255, 255, 255, 0, 0]);
    }

    #[test]
    fn encoded_image_is_jpeg_and_rotated() {
        let mut p = EdgeProcessor::new(80, true);
        assert!(p.encoded_image().is_none());
        p.process(&step_frame(32, 16)).unwrap();

        let jpeg = p.encoded_image().unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 32));
    }

    #[test]
    fn render_requires_initialize() {
        let mut p = EdgeProcessor::new(80, false);
        assert!(matches!(p.render(), Err(ProcessorError::NotInitialized)));
        p.initialize().unwrap();
        assert!(p.render().is_ok());
        assert!(p.surface().is_none());
    }

    #[test]
    fn render_scales_to_surface() {
        let mut p = EdgeProcessor::new(80, false);
        p.initialize().unwrap();
        p.resize(64, 32);
        p.process(&step_frame(16, 8)).unwrap();
        p.render().unwrap();

        let surface = p.surface().unwrap();
        assert_eq!(surface.dimensions(), (64, 32));
    }
}
