//! Throttled face capture loop.
//!
//! Pulls frames from a [`FrameSource`], runs a [`FaceDetector`] on each one
//! and keeps the faces found on every `sample_interval`-th frame until
//! `max_samples` crops have been collected or the [`CaptureMonitor`] asks to
//! stop.

use crate::detector::FaceDetector;
use crate::types::FaceRect;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};

pub const DEFAULT_SAMPLE_INTERVAL: u64 = 10;
pub const DEFAULT_MAX_SAMPLES: usize = 100;
pub const DEFAULT_CROP_SIZE: u32 = 50;

/// A live source of color frames, e.g. a camera.
pub trait FrameSource {
    type Error: std::fmt::Display;

    fn next_frame(&mut self) -> Result<RgbImage, Self::Error>;
}

/// Receives each accepted sample as soon as it is cropped.
///
/// `index` is 1-based and matches the sample's position in the final report.
pub trait SampleSink {
    type Error;

    fn accept(&mut self, index: usize, sample: &RgbImage) -> Result<(), Self::Error>;
}

/// What the monitor wants after seeing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    Continue,
    Cancel,
}

/// Observes the loop (preview window, progress output) and relays cancellation.
pub trait CaptureMonitor {
    fn on_frame(&mut self, frame: &RgbImage, faces: &[FaceRect], captured: usize) -> MonitorSignal;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Only frames whose index is a multiple of this are sampled.
    pub sample_interval: u64,
    pub max_samples: usize,
    /// Side length of the square crops.
    pub crop_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            max_samples: DEFAULT_MAX_SAMPLES,
            crop_size: DEFAULT_CROP_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `max_samples` reached.
    Completed,
    /// The monitor asked to stop (cancel key, window closed).
    Cancelled,
    /// The frame source failed to deliver a frame.
    SourceExhausted,
}

#[derive(Debug)]
pub struct CaptureReport {
    pub samples: Vec<RgbImage>,
    pub frames_processed: u64,
    pub faces_detected: usize,
    pub stop: StopReason,
}

/// Run the capture loop to completion.
///
/// A failing frame source ends the run with [`StopReason::SourceExhausted`]
/// and whatever was collected so far. Only sink errors are returned.
pub fn run_capture<F, D, S, M>(
    source: &mut F,
    detector: &mut D,
    sink: &mut S,
    monitor: &mut M,
    config: &CaptureConfig,
) -> Result<CaptureReport, S::Error>
where
    F: FrameSource + ?Sized,
    D: FaceDetector + ?Sized,
    S: SampleSink + ?Sized,
    M: CaptureMonitor + ?Sized,
{
    let interval = config.sample_interval.max(1);
    let mut samples: Vec<RgbImage> = Vec::with_capacity(config.max_samples);
    let mut frames_processed = 0u64;
    let mut faces_detected = 0usize;

    let stop = loop {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, frames = frames_processed, "failed to grab frame");
                break StopReason::SourceExhausted;
            }
        };

        let gray = to_grayscale(&frame);
        let faces = detector.detect(&gray);
        faces_detected += faces.len();

        if frames_processed % interval == 0 {
            for face in &faces {
                if samples.len() >= config.max_samples {
                    break;
                }
                let Some(sample) = crop_face(&frame, face, config.crop_size) else {
                    tracing::debug!(?face, "skipping face outside frame");
                    continue;
                };
                sink.accept(samples.len() + 1, &sample)?;
                samples.push(sample);
                tracing::debug!(
                    frame = frames_processed,
                    captured = samples.len(),
                    "sample captured"
                );
            }
        }
        frames_processed += 1;

        let signal = monitor.on_frame(&frame, &faces, samples.len());
        if samples.len() >= config.max_samples {
            break StopReason::Completed;
        }
        if signal == MonitorSignal::Cancel {
            break StopReason::Cancelled;
        }
    };

    tracing::info!(
        captured = samples.len(),
        frames = frames_processed,
        faces = faces_detected,
        ?stop,
        "capture finished"
    );

    Ok(CaptureReport {
        samples,
        frames_processed,
        faces_detected,
        stop,
    })
}

/// ITU-R BT.601 luma in fixed point, the weighting OpenCV's cascades were trained on.
pub fn to_grayscale(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        let luma = (77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8;
        Luma([luma as u8])
    })
}

/// Crop `face` out of `frame` and resize it to `size` × `size`.
///
/// Returns `None` when the rectangle has no overlap with the frame.
pub fn crop_face(frame: &RgbImage, face: &FaceRect, size: u32) -> Option<RgbImage> {
    let r = face.clamp_to(frame.width(), frame.height())?;
    let crop = imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image();
    Some(imageops::resize(&crop, size, size, FilterType::Triangle))
}
