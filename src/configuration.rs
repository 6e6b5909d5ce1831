//! Extraction and pipeline configuration.
//!
//! [`ExtractionConfig`] describes *what* to extract: the sampling interval,
//! the time window, and how kept frames are encoded. [`PipelineLimits`]
//! describes *how* the pipeline is bounded: chunk size, sample watermarks,
//! decoder queue depth, and the number of frames processed concurrently.
//!
//! # Example
//!
//! ```
//! use stillcut::{ExtractionConfig, OutputFormat, PipelineLimits};
//!
//! let config = ExtractionConfig::new(2.0)
//!     .with_format(OutputFormat::Png)
//!     .with_window(10.0, 60.0);
//! assert!(config.validate().is_ok());
//!
//! let limits = PipelineLimits::default().with_chunk_size(1024 * 1024);
//! assert_eq!(limits.chunk_size, 1024 * 1024);
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::error::ExtractError;

/// Encoding used for kept frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    /// JPEG at [`ExtractionConfig::quality`]. This is the default.
    #[default]
    Jpeg,
    /// Lossless PNG. Quality is ignored.
    Png,
    /// Lossless WebP. Quality is ignored.
    WebP,
}

impl OutputFormat {
    /// MIME type reported alongside each extracted frame.
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }

    /// File extension used by the directory store and exports.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    /// Whether [`ExtractionConfig::quality`] has any effect.
    pub fn is_lossless(self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }

    /// Parse a format from an extension or MIME type (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "image/jpeg" => Some(OutputFormat::Jpeg),
            "png" | "image/png" => Some(OutputFormat::Png),
            "webp" | "image/webp" => Some(OutputFormat::WebP),
            _ => None,
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.extension())
    }
}

/// What to extract from a video.
///
/// Times are in seconds. An `end_time` of zero or less means "until the end
/// of the video".
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct ExtractionConfig {
    /// Minimum spacing between kept frames, in seconds. Must be positive.
    pub interval: f64,
    /// Encoding for kept frames.
    pub format: OutputFormat,
    /// Encoder quality, 0–100. Ignored for lossless formats.
    pub quality: u8,
    /// Frames before this timestamp are skipped.
    pub start_time: f64,
    /// Frames after this timestamp end the run. `<= 0` disables the bound.
    pub end_time: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl ExtractionConfig {
    /// Create a config keeping one frame every `interval` seconds over the
    /// whole video, encoded as JPEG at quality 100.
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            format: OutputFormat::Jpeg,
            quality: 100,
            start_time: 0.0,
            end_time: 0.0,
        }
    }

    /// Set the output encoding.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the encoder quality. Clamped to 100.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    /// Restrict extraction to `[start_time, end_time]`.
    ///
    /// Pass an `end_time` of `0.0` to extract until the end of the video.
    pub fn with_window(mut self, start_time: f64, end_time: f64) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Whether the window has an upper bound.
    pub fn has_end(&self) -> bool {
        self.end_time > 0.0
    }

    /// Check the config before a run starts.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidConfig`] for a non-positive or
    /// non-finite interval, a negative start time, or an end time before
    /// the start time.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(ExtractError::InvalidConfig(format!(
                "interval must be a positive number of seconds, got {}",
                self.interval
            )));
        }
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(ExtractError::InvalidConfig(format!(
                "start time must be non-negative, got {}",
                self.start_time
            )));
        }
        if !self.end_time.is_finite() {
            return Err(ExtractError::InvalidConfig("end time must be finite".to_string()));
        }
        if self.has_end() && self.end_time < self.start_time {
            return Err(ExtractError::InvalidConfig(format!(
                "end time {} is before start time {}",
                self.end_time, self.start_time
            )));
        }
        Ok(())
    }
}

/// Default size of one source read.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Bounds that keep a run's memory flat regardless of input size.
///
/// The defaults suit multi-gigabyte inputs on desktop hardware. Every
/// setter clamps to at least 1, and the low watermark never exceeds the
/// high one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PipelineLimits {
    /// Bytes requested per source read.
    pub chunk_size: usize,
    /// Sample records per demuxer batch.
    pub samples_per_batch: usize,
    /// Reading pauses when more undecoded samples than this are buffered.
    pub high_watermark: usize,
    /// Reading resumes once buffered samples drop below this.
    pub low_watermark: usize,
    /// Maximum samples queued inside the decoder.
    pub max_decode_queue: usize,
    /// Maximum decoded frames being sampled, encoded, or persisted at once.
    pub max_frames_in_flight: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            samples_per_batch: 100,
            high_watermark: 200,
            low_watermark: 50,
            max_decode_queue: 20,
            max_frames_in_flight: 5,
        }
    }
}

impl PipelineLimits {
    /// Set the number of bytes requested per read.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Set how many samples the demuxer groups into one batch.
    pub fn with_samples_per_batch(mut self, samples: usize) -> Self {
        self.samples_per_batch = samples.max(1);
        self
    }

    /// Set the pause/resume watermarks for buffered samples.
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.high_watermark = high.max(1);
        self.low_watermark = low.max(1).min(self.high_watermark);
        self
    }

    /// Set the maximum decoder queue depth.
    pub fn with_max_decode_queue(mut self, depth: usize) -> Self {
        self.max_decode_queue = depth.max(1);
        self
    }

    /// Set the post-decode concurrency cap.
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames.max(1);
        self
    }
}
