//! facelog-core — face enrollment and attendance logging.
//!
//! Haar cascade face detection in pure Rust, a throttled capture loop,
//! per-identity sample folders and a deduplicated attendance CSV.

pub mod capture;
pub mod detector;
pub mod form;
pub mod ledger;
pub mod store;
pub mod types;

pub use capture::{
    run_capture, CaptureConfig, CaptureMonitor, CaptureReport, FrameSource, MonitorSignal,
    SampleSink, StopReason,
};
pub use detector::{CascadeError, DetectParams, FaceDetector, HaarCascade};
pub use form::{EnrollmentForm, FormError};
pub use ledger::{AttendanceEntry, AttendanceLedger, LedgerError, LogOutcome};
pub use store::{EnrollmentStore, SampleFolder, StoreError};
pub use types::{DedupKey, FaceRect, Identity};
