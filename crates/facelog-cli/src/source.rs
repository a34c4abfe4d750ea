use facelog_core::FrameSource;
use facelog_hw::{Camera, CameraError};
use image::RgbImage;

/// Feeds camera frames into the capture loop.
pub struct CameraSource {
    camera: Camera,
    last_sequence: Option<u32>,
}

impl CameraSource {
    pub fn new(camera: Camera) -> Self {
        Self {
            camera,
            last_sequence: None,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.camera.width, self.camera.height)
    }
}

impl FrameSource for CameraSource {
    type Error = CameraError;

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        let frame = self.camera.capture_frame()?;
        let skipped = frames_skipped(self.last_sequence, frame.sequence);
        if skipped > 0 {
            tracing::debug!(sequence = frame.sequence, skipped, "driver dropped frames");
        }
        self.last_sequence = Some(frame.sequence);

        let (width, height) = (frame.width, frame.height);
        RgbImage::from_raw(width, height, frame.data).ok_or_else(|| {
            CameraError::CaptureFailed(format!("frame buffer does not match {width}x{height}"))
        })
    }
}

/// Frames missing between two driver sequence numbers.
fn frames_skipped(last: Option<u32>, sequence: u32) -> u32 {
    match last {
        Some(last) if sequence > last => sequence - last - 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_skipped() {
        assert_eq!(frames_skipped(None, 7), 0);
        assert_eq!(frames_skipped(Some(7), 8), 0);
        assert_eq!(frames_skipped(Some(7), 10), 2);
        // Sequence reset after a stream restart.
        assert_eq!(frames_skipped(Some(7), 0), 0);
    }
}
