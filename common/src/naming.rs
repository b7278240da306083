//! Image filename generation.
//!
//! Names follow one of two patterns:
//!   `3f1c0e9a5b7d42c18e6f0a2b4c6d8e01.jpg`
//!   `MAD-01_000042_3f1c0e9a5b7d42c18e6f0a2b4c6d8e01.jpg`

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FilenameScheme;

/// Extension given to every captured image.
pub const IMAGE_EXTENSION: &str = "jpg";

/// Produces a fresh, collision-resistant filename per capture.
#[derive(Debug)]
pub struct FileNamer {
    scheme: FilenameScheme,
    zone: String,
    seq: AtomicU64,
}

impl FileNamer {
    pub fn new(scheme: FilenameScheme, zone: impl Into<String>) -> Self {
        FileNamer {
            scheme,
            zone: zone.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_name(&self) -> String {
        let random = random_hex();
        match self.scheme {
            FilenameScheme::Random => format!("{random}.{IMAGE_EXTENSION}"),
            FilenameScheme::Zoned => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{}_{seq:06}_{random}.{IMAGE_EXTENSION}", self.zone)
            }
        }
    }
}

fn random_hex() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}
