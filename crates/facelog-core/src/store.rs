//! On-disk enrollment records.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/<name>_<class>_<roll>_<section>[_N]/<name>_<n>.jpg
//! <base>/<name>_<class>_<roll>_<section>[_N]/<name>_face_data.npy
//! ```

use crate::capture::SampleSink;
use crate::types::Identity;
use image::RgbImage;
use ndarray::Array4;
use ndarray_npy::{write_npy, WriteNpyError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write sample {path}: {source}")]
    WriteSample {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write collection {path}: {source}")]
    WriteCollection {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("sample {index} is {actual:?}, expected {expected:?}")]
    SampleShape {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Root of all enrollment folders.
#[derive(Debug, Clone)]
pub struct EnrollmentStore {
    base: PathBuf,
}

impl EnrollmentStore {
    /// Make sure `base` exists and return a handle to it.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        if base.is_dir() {
            tracing::debug!(path = %base.display(), "data directory present");
        } else {
            fs::create_dir_all(&base).map_err(|source| StoreError::CreateDir {
                path: base.clone(),
                source,
            })?;
            tracing::info!(path = %base.display(), "created data directory");
        }
        Ok(Self { base })
    }

    /// Create a fresh folder for `identity`.
    ///
    /// An existing folder is never reused: the first free of `<stem>`,
    /// `<stem>_2`, `<stem>_3`, … is taken.
    pub fn create_folder(&self, identity: &Identity) -> Result<SampleFolder, StoreError> {
        let stem = identity.folder_stem();
        let mut suffix = 1u32;
        loop {
            let dir_name = if suffix == 1 {
                stem.clone()
            } else {
                format!("{stem}_{suffix}")
            };
            let path = self.base.join(dir_name);
            match fs::create_dir(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "created enrollment folder");
                    return Ok(SampleFolder {
                        path,
                        name: identity.name.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %path.display(), "folder exists, trying next suffix");
                    suffix += 1;
                }
                Err(source) => return Err(StoreError::CreateDir { path, source }),
            }
        }
    }
}

/// One enrollment folder. Receives samples as JPEGs while the capture runs.
#[derive(Debug)]
pub struct SampleFolder {
    path: PathBuf,
    name: String,
}

impl SampleFolder {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_path(&self, index: usize) -> PathBuf {
        self.path.join(format!("{}_{index}.jpg", self.name))
    }

    pub fn collection_path(&self) -> PathBuf {
        self.path.join(format!("{}_face_data.npy", self.name))
    }

    /// Write all samples as one `(N, size, size, 3)` `u8` array.
    ///
    /// An empty `samples` slice still produces a file with `N = 0`.
    pub fn save_collection(&self, samples: &[RgbImage], size: u32) -> Result<PathBuf, StoreError> {
        let side = size as usize;
        let mut data = Array4::<u8>::zeros((samples.len(), side, side, 3));
        for (i, sample) in samples.iter().enumerate() {
            if sample.dimensions() != (size, size) {
                return Err(StoreError::SampleShape {
                    index: i + 1,
                    expected: (size, size),
                    actual: sample.dimensions(),
                });
            }
            for (x, y, px) in sample.enumerate_pixels() {
                for c in 0..3 {
                    data[[i, y as usize, x as usize, c]] = px.0[c];
                }
            }
        }

        let path = self.collection_path();
        write_npy(&path, &data).map_err(|source| StoreError::WriteCollection {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), count = samples.len(), "saved face collection");
        Ok(path)
    }
}

impl SampleSink for SampleFolder {
    type Error = StoreError;

    fn accept(&mut self, index: usize, sample: &RgbImage) -> Result<(), StoreError> {
        let path = self.sample_path(index);
        sample
            .save(&path)
            .map_err(|source| StoreError::WriteSample { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray_npy::read_npy;

    fn bob() -> Identity {
        Identity {
            name: "Bob".into(),
            class: "6B".into(),
            roll_no: "7".into(),
            section: "C".into(),
        }
    }

    fn sample(shade: u8) -> RgbImage {
        RgbImage::from_fn(50, 50, |x, _| Rgb([shade, x as u8, 200]))
    }

    #[test]
    fn test_open_creates_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("data");
        assert!(!base.exists());
        EnrollmentStore::open(&base).unwrap();
        assert!(base.is_dir());
        // Idempotent.
        EnrollmentStore::open(&base).unwrap();
    }

    #[test]
    fn test_folder_collision_gets_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(tmp.path()).unwrap();
        let first = store.create_folder(&bob()).unwrap();
        let second = store.create_folder(&bob()).unwrap();
        let third = store.create_folder(&bob()).unwrap();
        assert!(first.path().ends_with("Bob_6B_7_C"));
        assert!(second.path().ends_with("Bob_6B_7_C_2"));
        assert!(third.path().ends_with("Bob_6B_7_C_3"));
    }

    #[test]
    fn test_sink_writes_numbered_jpegs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(tmp.path()).unwrap();
        let mut folder = store.create_folder(&bob()).unwrap();
        folder.accept(1, &sample(10)).unwrap();
        folder.accept(2, &sample(20)).unwrap();

        let one = folder.path().join("Bob_1.jpg");
        assert!(one.is_file());
        assert!(folder.path().join("Bob_2.jpg").is_file());
        let decoded = image::open(one).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 50));
    }

    #[test]
    fn test_collection_shape_and_pixels() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(tmp.path()).unwrap();
        let folder = store.create_folder(&bob()).unwrap();
        let path = folder
            .save_collection(&[sample(1), sample(2), sample(3)], 50)
            .unwrap();
        assert!(path.ends_with("Bob_face_data.npy"));

        let arr: Array4<u8> = read_npy(&path).unwrap();
        assert_eq!(arr.shape(), &[3, 50, 50, 3]);
        assert_eq!(arr[[1, 0, 0, 0]], 2);
        assert_eq!(arr[[2, 7, 9, 1]], 9);
        assert_eq!(arr[[0, 49, 49, 2]], 200);
    }

    #[test]
    fn test_empty_collection_is_still_written() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(tmp.path()).unwrap();
        let folder = store.create_folder(&bob()).unwrap();
        let path = folder.save_collection(&[], 50).unwrap();

        let arr: Array4<u8> = read_npy(&path).unwrap();
        assert_eq!(arr.shape(), &[0, 50, 50, 3]);
    }

    #[test]
    fn test_wrong_sample_size_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = EnrollmentStore::open(tmp.path()).unwrap();
        let folder = store.create_folder(&bob()).unwrap();
        let err = folder
            .save_collection(&[sample(1), RgbImage::new(40, 50)], 50)
            .unwrap_err();
        assert!(matches!(err, StoreError::SampleShape { index: 2, .. }));
        assert!(!folder.collection_path().exists());
    }
}
