//! Live capture sources.
//!
//! A capture source wraps a camera plus an external face model and yields
//! one detection set per call. Both phases block: `load` while the model
//! initialises, `detect` for one frame of inference.

use faceverify_core::wire::{self, WireError};
use faceverify_core::DetectionSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture source not loaded")]
    NotLoaded,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: WireError,
    },
    #[error("replay contains no detection sets")]
    Empty,
    #[error("replay exhausted")]
    Exhausted,
}

/// What a loaded source reports about its model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    /// Descriptor length, when known.
    pub descriptor_len: Option<usize>,
}

/// Producer of detection sets for the polling loop.
pub trait CaptureSource: Send {
    /// Load the model. Called once, before any `detect`.
    fn load(&mut self) -> Result<ModelInfo, CaptureError>;

    /// Capture one frame and return every face found in it.
    fn detect(&mut self) -> Result<DetectionSet, CaptureError>;
}

enum Origin {
    File(PathBuf),
    Text(String),
}

/// Replays detection sets recorded from an external model.
///
/// Input is JSON Lines: one detection set (a JSON array) per line, blank
/// lines ignored. Sets are returned in file order; with `looping` the
/// replay wraps around, otherwise it ends with [`CaptureError::Exhausted`].
pub struct ReplaySource {
    origin: Origin,
    looping: bool,
    frames: Vec<DetectionSet>,
    cursor: usize,
    loaded: bool,
}

impl ReplaySource {
    /// Replay from a file. The file is read by [`CaptureSource::load`].
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Self {
        Self::with_origin(Origin::File(path.as_ref().to_path_buf()), looping)
    }

    /// Replay from an in-memory reader, read immediately.
    pub fn from_reader(mut reader: impl Read, looping: bool) -> Result<Self, CaptureError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Ok(Self::with_origin(Origin::Text(text), looping))
    }

    fn with_origin(origin: Origin, looping: bool) -> Self {
        Self {
            origin,
            looping,
            frames: Vec::new(),
            cursor: 0,
            loaded: false,
        }
    }

    fn name(&self) -> String {
        match &self.origin {
            Origin::File(path) => format!("replay:{}", path.display()),
            Origin::Text(_) => "replay:memory".to_string(),
        }
    }
}

fn parse_lines(text: &str) -> Result<Vec<DetectionSet>, CaptureError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            wire::parse_detection_set_str(line)
                .map_err(|source| CaptureError::Malformed { line: i + 1, source })
        })
        .collect()
}

impl CaptureSource for ReplaySource {
    fn load(&mut self) -> Result<ModelInfo, CaptureError> {
        let frames = match &self.origin {
            Origin::File(path) => parse_lines(&std::fs::read_to_string(path)?)?,
            Origin::Text(text) => parse_lines(text)?,
        };
        if frames.is_empty() {
            return Err(CaptureError::Empty);
        }

        let descriptor_len = frames
            .iter()
            .flatten()
            .find_map(|d| d.descriptor.as_ref().map(|desc| desc.len()));

        let info = ModelInfo {
            name: self.name(),
            descriptor_len,
        };
        tracing::info!(
            source = %info.name,
            frames = frames.len(),
            descriptor_len = ?info.descriptor_len,
            looping = self.looping,
            "replay loaded"
        );

        self.frames = frames;
        self.cursor = 0;
        self.loaded = true;
        Ok(info)
    }

    fn detect(&mut self) -> Result<DetectionSet, CaptureError> {
        if !self.loaded {
            return Err(CaptureError::NotLoaded);
        }
        if self.cursor == self.frames.len() {
            if !self.looping {
                return Err(CaptureError::Exhausted);
            }
            self.cursor = 0;
        }
        let set = self.frames[self.cursor].clone();
        self.cursor += 1;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"[{"descriptor": [0.0, 0.0]}]

[]
[{"descriptor": {"0": 1.0, "1": 2.0}}, {"descriptor": null}]
"#;

    #[test]
    fn test_detect_before_load() {
        let mut source = ReplaySource::from_reader(RECORDING.as_bytes(), true).unwrap();
        assert!(matches!(source.detect(), Err(CaptureError::NotLoaded)));
    }

    #[test]
    fn test_replay_in_order_and_wraps() {
        let mut source = ReplaySource::from_reader(RECORDING.as_bytes(), true).unwrap();
        let info = source.load().unwrap();
        assert_eq!(info.name, "replay:memory");
        assert_eq!(info.descriptor_len, Some(2));

        assert_eq!(source.detect().unwrap().len(), 1);
        assert!(source.detect().unwrap().is_empty());
        let third = source.detect().unwrap();
        assert_eq!(third.len(), 2);
        assert!(third[1].descriptor.is_none());
        // wraps to the first set
        assert_eq!(
            source.detect().unwrap()[0].descriptor.as_ref().unwrap().values(),
            &[0.0, 0.0]
        );
    }

    #[test]
    fn test_replay_without_loop_exhausts() {
        let mut source = ReplaySource::from_reader("[]\n".as_bytes(), false).unwrap();
        source.load().unwrap();
        assert!(source.detect().unwrap().is_empty());
        assert!(matches!(source.detect(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_load_reports_malformed_line() {
        let mut source = ReplaySource::from_reader("[]\n\n{\"x\": 1}\n".as_bytes(), true).unwrap();
        match source.load() {
            Err(CaptureError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed line error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_empty_recording() {
        let mut source = ReplaySource::from_reader("\n  \n".as_bytes(), true).unwrap();
        assert!(matches!(source.load(), Err(CaptureError::Empty)));
    }

    #[test]
    fn test_load_missing_file() {
        let mut source = ReplaySource::open("/nonexistent/faceverify/detections.jsonl", true);
        assert!(matches!(source.load(), Err(CaptureError::Io(_))));
    }
}
