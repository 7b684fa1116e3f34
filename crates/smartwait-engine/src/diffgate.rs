use smartwait_core::EngineConfig;

/// A captured frame, as an opaque RGB8 pixel buffer. The engine neither
/// encodes nor decodes frames; it only downsamples and diffs them.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes, row-major, 3 bytes (R, G, B) per pixel.
    pub rgb: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking the buffer length matches `width * height * 3`.
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Option<Self> {
        if rgb.len() as u64 != (width as u64) * (height as u64) * 3 {
            return None;
        }
        Some(Self { width, height, rgb })
    }
}

#[derive(Debug, Clone)]
struct DownsampledFrame {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

/// Per-job filter that suppresses vision calls when the display hasn't
/// visibly changed since the last evaluation (§4.2).
///
/// Deterministic, O(pixels of the downsampled frame), and allocates only
/// the downsampled copy it retains between calls.
#[derive(Debug, Clone)]
pub struct DiffGate {
    downsample_width: u32,
    pixel_threshold: u8,
    change_ratio: f64,
    previous: Option<DownsampledFrame>,
}

impl DiffGate {
    /// Build a gate from the engine's configured thresholds.
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            downsample_width: cfg.diff_downsample_width.max(1),
            pixel_threshold: cfg.diff_pixel_threshold,
            change_ratio: cfg.diff_change_ratio,
            previous: None,
        }
    }

    /// Decide whether `frame` differs enough from the last frame seen by
    /// this gate to be worth a vision call, and remember it as the new
    /// baseline either way.
    pub fn should_evaluate(&mut self, frame: &Frame) -> bool {
        let down = self.downsample(frame);
        let changed = match &self.previous {
            None => true,
            Some(prev) if prev.width != down.width || prev.height != down.height => true,
            Some(prev) => self.fraction_changed(prev, &down) > self.change_ratio,
        };
        self.previous = Some(down);
        changed
    }

    fn downsample(&self, frame: &Frame) -> DownsampledFrame {
        let stride = (frame.width / self.downsample_width).max(1);
        let out_w = frame.width.div_ceil(stride).max(1);
        let out_h = frame.height.div_ceil(stride).max(1);

        let mut rgb = Vec::with_capacity((out_w * out_h * 3) as usize);
        let mut y = 0u32;
        while y < frame.height {
            let mut x = 0u32;
            while x < frame.width {
                let idx = ((y * frame.width + x) * 3) as usize;
                rgb.extend_from_slice(&frame.rgb[idx..idx + 3]);
                x += stride;
            }
            y += stride;
        }

        DownsampledFrame {
            width: out_w,
            height: out_h,
            rgb,
        }
    }

    fn fraction_changed(&self, prev: &DownsampledFrame, next: &DownsampledFrame) -> f64 {
        let total = prev.rgb.len() / 3;
        if total == 0 {
            return 0.0;
        }
        let threshold = self.pixel_threshold as i16;
        let differing = prev
            .rgb
            .chunks_exact(3)
            .zip(next.rgb.chunks_exact(3))
            .filter(|(a, b)| {
                a.iter()
                    .zip(b.iter())
                    .any(|(x, y)| (*x as i16 - *y as i16).abs() > threshold)
            })
            .count();
        differing as f64 / total as f64
    }
}
