use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four validated form fields that identify a person.
///
/// Construct through [`EnrollmentForm::validate`](crate::form::EnrollmentForm::validate),
/// which guarantees every field is trimmed, non-empty and safe to use as a
/// path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub class: String,
    pub roll_no: String,
    pub section: String,
}

impl Identity {
    /// Folder stem used under the data directory: `<name>_<class>_<roll>_<section>`.
    pub fn folder_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.name, self.class, self.roll_no, self.section
        )
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Class: {}, Roll No: {}, Section: {})",
            self.name, self.class, self.roll_no, self.section
        )
    }
}

/// Uniqueness key of the attendance ledger: one row per identity per day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub identity: Identity,
    pub date: NaiveDate,
}

/// Axis-aligned face detection in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect with a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when nothing of the rectangle lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<FaceRect> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(FaceRect::new(self.x, self.y, width, height))
    }
}
