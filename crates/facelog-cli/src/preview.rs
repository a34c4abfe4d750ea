//! Capture monitors: a live preview window and a console fallback.

use facelog_core::{CaptureMonitor, FaceRect, MonitorSignal};
use image::RgbImage;
use minifb::{Key, Window, WindowOptions};

const BOX_COLOR: u32 = 0x00_00_00_ff; // blue, 0RGB
const BOX_THICKNESS: u32 = 2;

/// Live camera preview with detection boxes.
///
/// Q or Escape (or closing the window) cancels the capture.
pub struct PreviewWindow {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
    max_samples: usize,
}

impl PreviewWindow {
    pub fn open(width: u32, height: u32, max_samples: usize) -> Result<Self, minifb::Error> {
        let (width, height) = (width as usize, height as usize);
        let window = Window::new(
            &title(0, max_samples),
            width,
            height,
            WindowOptions::default(),
        )?;
        tracing::info!(width, height, "preview window opened");
        Ok(Self {
            window,
            buffer: vec![0; width * height],
            width,
            height,
            max_samples,
        })
    }
}

impl CaptureMonitor for PreviewWindow {
    fn on_frame(&mut self, frame: &RgbImage, faces: &[FaceRect], captured: usize) -> MonitorSignal {
        if !self.window.is_open()
            || self.window.is_key_down(Key::Q)
            || self.window.is_key_down(Key::Escape)
        {
            return MonitorSignal::Cancel;
        }

        if frame.width() as usize != self.width || frame.height() as usize != self.height {
            tracing::warn!(
                frame = ?frame.dimensions(),
                window = ?(self.width, self.height),
                "frame size changed, skipping preview"
            );
            return MonitorSignal::Continue;
        }

        fill_buffer(frame, &mut self.buffer);
        for face in faces {
            draw_box(&mut self.buffer, self.width, self.height, face, BOX_COLOR);
        }
        self.window.set_title(&title(captured, self.max_samples));
        if let Err(e) = self
            .window
            .update_with_buffer(&self.buffer, self.width, self.height)
        {
            tracing::warn!(error = %e, "preview update failed, stopping capture");
            return MonitorSignal::Cancel;
        }
        MonitorSignal::Continue
    }
}

impl Drop for PreviewWindow {
    fn drop(&mut self) {
        tracing::info!("preview window closed");
    }
}

/// Headless progress: prints each time the sample count changes.
pub struct ConsoleMonitor {
    max_samples: usize,
    last: usize,
}

impl ConsoleMonitor {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            last: 0,
        }
    }
}

impl CaptureMonitor for ConsoleMonitor {
    fn on_frame(
        &mut self,
        _frame: &RgbImage,
        _faces: &[FaceRect],
        captured: usize,
    ) -> MonitorSignal {
        if captured != self.last {
            self.last = captured;
            eprintln!("captured {captured}/{}", self.max_samples);
        }
        MonitorSignal::Continue
    }
}

fn title(captured: usize, max_samples: usize) -> String {
    format!("facelog - {captured}/{max_samples} samples (Q to stop)")
}

/// Pack RGB pixels into minifb's 0RGB `u32` layout.
fn fill_buffer(frame: &RgbImage, buffer: &mut [u32]) {
    for (dst, px) in buffer.iter_mut().zip(frame.pixels()) {
        let [r, g, b] = px.0;
        *dst = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
    }
}

/// Outline `rect` in place, clipped to the buffer.
fn draw_box(buffer: &mut [u32], width: usize, height: usize, rect: &FaceRect, color: u32) {
    let Some(r) = rect.clamp_to(width as u32, height as u32) else {
        return;
    };
    let (x0, y0) = (r.x as usize, r.y as usize);
    let (x1, y1) = (x0 + r.width as usize - 1, y0 + r.height as usize - 1);
    let t = BOX_THICKNESS as usize;

    for y in y0..=y1 {
        for x in x0..=x1 {
            let edge = x < x0 + t || x + t > x1 || y < y0 + t || y + t > y1;
            if edge {
                buffer[y * width + x] = color;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_fill_buffer_packs_0rgb() {
        let frame = RgbImage::from_pixel(2, 1, Rgb([0x12, 0x34, 0x56]));
        let mut buffer = vec![0u32; 2];
        fill_buffer(&frame, &mut buffer);
        assert_eq!(buffer, vec![0x0012_3456, 0x0012_3456]);
    }

    #[test]
    fn test_draw_box_outline_only() {
        let (w, h) = (10, 10);
        let mut buffer = vec![0u32; w * h];
        draw_box(&mut buffer, w, h, &FaceRect::new(1, 1, 8, 8), 7);

        assert_eq!(buffer[w + 1], 7); // corner
        assert_eq!(buffer[2 * w + 2], 7); // second ring
        assert_eq!(buffer[5 * w + 5], 0); // interior
        assert_eq!(buffer[0], 0); // outside
    }

    #[test]
    fn test_draw_box_clipped_at_edge() {
        let (w, h) = (6, 6);
        let mut buffer = vec![0u32; w * h];
        draw_box(&mut buffer, w, h, &FaceRect::new(4, 4, 10, 10), 1);
        assert_eq!(buffer[5 * w + 5], 1);
        draw_box(&mut buffer, w, h, &FaceRect::new(20, 20, 3, 3), 2);
        assert!(!buffer.contains(&2));
    }

    #[test]
    fn test_console_monitor_never_cancels() {
        let mut monitor = ConsoleMonitor::new(100);
        let frame = RgbImage::new(4, 4);
        assert_eq!(monitor.on_frame(&frame, &[], 0), MonitorSignal::Continue);
        assert_eq!(monitor.on_frame(&frame, &[], 1), MonitorSignal::Continue);
        assert_eq!(monitor.last, 1);
    }

    #[test]
    fn test_title_shows_progress() {
        assert!(title(42, 100).contains("42/100"));
    }
}
