//! Progress markers shared with the on-screen activity indicator.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::info;

use crate::fastboot::{CommandObserver, SessionState};

/// Single-byte marker written to the progress file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgressMarker {
    /// Long-running work started; the indicator animates.
    Start,
    /// Work finished; the indicator rests.
    Finish,
}

impl ProgressMarker {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            ProgressMarker::Start => b'S',
            ProgressMarker::Finish => b'F',
        }
    }

    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'S' => Some(ProgressMarker::Start),
            b'F' => Some(ProgressMarker::Finish),
            _ => None,
        }
    }
}

/// Receives progress markers and user-facing status text.
pub trait ProgressReporter {
    fn marker(&mut self, marker: ProgressMarker);

    /// Status text meant for the person watching the device.
    fn message(&mut self, text: &str) {
        info!("{text}");
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for &mut R {
    fn marker(&mut self, marker: ProgressMarker) {
        (**self).marker(marker);
    }

    fn message(&mut self, text: &str) {
        (**self).message(text);
    }
}

/// Reporter that only logs.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn marker(&mut self, marker: ProgressMarker) {
        info!("progress {marker:?}");
    }
}

/// Entry captured by [`RecordedProgress`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgressEntry {
    Marker(ProgressMarker),
    Message(String),
}

/// Reporter that keeps everything it receives, in order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordedProgress {
    pub entries: Vec<ProgressEntry>,
}

impl RecordedProgress {
    /// Markers only, in the order they were reported.
    #[must_use]
    pub fn markers(&self) -> Vec<ProgressMarker> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ProgressEntry::Marker(marker) => Some(*marker),
                ProgressEntry::Message(_) => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordedProgress {
    fn marker(&mut self, marker: ProgressMarker) {
        self.entries.push(ProgressEntry::Marker(marker));
    }

    fn message(&mut self, text: &str) {
        self.entries.push(ProgressEntry::Message(text.to_string()));
    }
}

/// Adapts a reporter into a fastboot command observer: every command starts
/// the indicator and every answered command stops it.
pub struct ProgressObserver<R>(pub R);

impl<R: ProgressReporter> CommandObserver for ProgressObserver<R> {
    fn command_started(&mut self, _command: &str) {
        self.0.marker(ProgressMarker::Start);
    }

    fn command_finished(&mut self, _command: &str, state: SessionState) {
        if state == SessionState::Complete {
            self.0.marker(ProgressMarker::Finish);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_skips_finish_after_transport_error() {
        let mut observer = ProgressObserver(RecordedProgress::default());
        observer.command_started("getvar:version");
        observer.command_finished("getvar:version", SessionState::Complete);
        observer.command_started("download:10");
        observer.command_finished("download:10", SessionState::Error);

        assert_eq!(
            observer.0.markers(),
            [
                ProgressMarker::Start,
                ProgressMarker::Finish,
                ProgressMarker::Start
            ]
        );
    }

    #[test]
    fn marker_bytes_round_trip() {
        for marker in [ProgressMarker::Start, ProgressMarker::Finish] {
            assert_eq!(ProgressMarker::from_byte(marker.as_byte()), Some(marker));
        }
        assert_eq!(ProgressMarker::from_byte(b'x'), None);
    }
}
