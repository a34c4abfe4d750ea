//! Enrollment and attendance flows tying the camera, detector, store and
//! ledger together.

use crate::config::Config;
use crate::preview::{ConsoleMonitor, PreviewWindow};
use crate::source::CameraSource;
use facelog_core::{
    run_capture, AttendanceLedger, CaptureMonitor, CaptureReport, CascadeError, EnrollmentForm,
    EnrollmentStore, FaceDetector, FormError, FrameSource, HaarCascade, Identity, LedgerError,
    LogOutcome, StoreError,
};
use facelog_hw::{Camera, CameraError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Form(#[from] FormError),
    #[error("detector error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("preview window error: {0}")]
    Preview(#[from] minifb::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("attendance error: {0}")]
    Ledger(#[from] LedgerError),
}

/// What an enrollment run produced.
pub struct EnrollmentSummary {
    pub identity: Identity,
    pub folder: PathBuf,
    pub collection: PathBuf,
    pub report: CaptureReport,
    pub attendance: LogOutcome,
}

/// Validate the form, capture face samples, save them and mark attendance.
///
/// Nothing touches the filesystem until the form is valid, the cascade has
/// loaded and the camera is open.
pub fn run_enrollment(
    form: &EnrollmentForm,
    config: &Config,
    preview: bool,
) -> Result<EnrollmentSummary, SessionError> {
    let identity = form.validate()?;
    tracing::info!(identity = %identity, "enrollment requested");

    let mut cascade =
        HaarCascade::load(&config.cascade_path)?.with_params(config.detect_params())?;

    let camera = Camera::open(&config.camera_device)?;
    let source = CameraSource::new(camera);
    let max_samples = config.max_samples;
    let monitor: Box<dyn CaptureMonitor> = if preview {
        let (width, height) = source.dimensions();
        Box::new(PreviewWindow::open(width, height, max_samples)?)
    } else {
        Box::new(ConsoleMonitor::new(max_samples))
    };

    enroll(identity, source, &mut cascade, monitor, config)
}

/// Capture from `source` into a fresh sample folder, write the collection
/// and mark `identity` present.
///
/// The source and monitor are dropped as soon as capture ends, before the
/// collection is written. A source that fails mid-run only ends the capture
/// early; whatever was sampled is still saved and attendance still marked.
pub fn enroll<S, D>(
    identity: Identity,
    mut source: S,
    detector: &mut D,
    mut monitor: Box<dyn CaptureMonitor + '_>,
    config: &Config,
) -> Result<EnrollmentSummary, SessionError>
where
    S: FrameSource,
    D: FaceDetector + ?Sized,
{
    let capture = config.capture();
    let store = EnrollmentStore::open(&config.data_dir)?;
    let mut folder = store.create_folder(&identity)?;

    let report = run_capture(
        &mut source,
        detector,
        &mut folder,
        monitor.as_mut(),
        &capture,
    )?;
    drop(monitor);
    drop(source);

    let collection = folder.save_collection(&report.samples, capture.crop_size)?;

    let mut ledger = AttendanceLedger::open(&config.ledger_path);
    let attendance = ledger.log(&identity)?;

    Ok(EnrollmentSummary {
        identity,
        folder: folder.path().to_path_buf(),
        collection,
        report,
        attendance,
    })
}

/// Mark attendance without capturing.
pub fn mark_attendance(
    form: &EnrollmentForm,
    config: &Config,
) -> Result<(Identity, LogOutcome), SessionError> {
    let identity = form.validate()?;
    let mut ledger = AttendanceLedger::open(&config.ledger_path);
    let outcome = ledger.log(&identity)?;
    Ok((identity, outcome))
}
