//! Test utilities for fixture lookup and synthetic frame sequences
//!
//! Shared by unit tests and the criterion benches (`benchmark` feature).

#![cfg(any(test, feature = "benchmark"))]

use std::path::{Path, PathBuf};

use crate::codec::{Bitmap, Rgb565};
use crate::session::SessionConfig;
use crate::types::Rect;

/// Error returned when a required fixture cannot be located.
#[derive(Debug, Clone)]
pub struct FixtureError {
    message: String,
}

impl FixtureError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FixtureError {}

/// The crate's `test-data/` directory.
pub fn test_data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("test-data")
}

/// All `.jsonl` transcripts under `test-data/transcripts`, sorted by name.
pub fn transcript_fixtures() -> Vec<PathBuf> {
    let dir = test_data_dir().join("transcripts");
    let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("jsonl"))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Require a named transcript in `test-data/transcripts`.
pub fn require_transcript_fixture(file_name: &str) -> Result<PathBuf, FixtureError> {
    let path = test_data_dir().join("transcripts").join(file_name);
    if path.exists() {
        Ok(path)
    } else {
        Err(FixtureError::new(format!("Missing transcript fixture: {}", path.display())))
    }
}

/// Session settings matching the bundled 8x4 transcripts.
pub fn small_panel_config() -> SessionConfig {
    SessionConfig { panel_width: 8, panel_height: 4, chunk_size: 16, ..SessionConfig::default() }
}

/// Deterministic non-uniform bitmap.
pub fn gradient_bitmap(width: u16, height: u16) -> Bitmap {
    let mut bitmap = Bitmap::filled(width, height, Rgb565::BLACK);
    for y in 0..height {
        for x in 0..width {
            bitmap.set_pixel(x, y, Rgb565(x.wrapping_mul(0x0841).wrapping_add(y.wrapping_mul(0x1000))));
        }
    }
    bitmap
}

/// `count` bitmaps where each differs from the previous only inside `rect`.
pub fn dirty_rect_sequence(width: u16, height: u16, rect: Rect, count: usize) -> Vec<Bitmap> {
    let mut current = Bitmap::filled(width, height, Rgb565::BLACK);
    (0..count)
        .map(|i| {
            let shade = Rgb565::from_rgb888((i * 37) as u8, (i * 91) as u8, (i * 13) as u8 | 1);
            current.fill_rect(rect, shade);
            current.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_transcripts_are_found() {
        let fixtures = transcript_fixtures();
        assert!(!fixtures.is_empty(), "expected transcripts under {}", test_data_dir().display());
        assert!(require_transcript_fixture("rev_a_handshake_frame.jsonl").is_ok());
        assert!(require_transcript_fixture("missing.jsonl").is_err());
    }

    #[test]
    fn dirty_sequence_changes_only_the_rect() {
        let rect = Rect::new(2, 1, 3, 2);
        let frames = dirty_rect_sequence(8, 4, rect, 3);
        assert_eq!(frames.len(), 3);
        assert_eq!(crate::codec::dirty_bounds(&frames[0], &frames[1]).unwrap(), Some(rect));
    }
}
