//! Progress marker file read by the on-screen activity indicator.

use std::fs;
use std::path::PathBuf;

use droidboot_core::progress::{ProgressMarker, ProgressReporter};
use log::{error, info};

/// Rewrites a one-byte marker file on every transition.
#[derive(Debug, Clone)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProgressReporter for ProgressFile {
    fn marker(&mut self, marker: ProgressMarker) {
        if let Err(err) = fs::write(&self.path, [marker.as_byte()]) {
            error!("can't write {}: {err}", self.path.display());
        }
    }

    fn message(&mut self, text: &str) {
        for line in text.lines() {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_replaces_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("progress.txt");
        let mut progress = ProgressFile::new(path.clone());

        progress.marker(ProgressMarker::Start);
        assert_eq!(fs::read(&path).expect("read"), b"S");
        progress.marker(ProgressMarker::Finish);
        assert_eq!(
            ProgressMarker::from_byte(fs::read(&path).expect("read")[0]),
            Some(ProgressMarker::Finish)
        );
    }
}
