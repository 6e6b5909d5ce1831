//! Error types for the `stillcut` crate.
//!
//! This module defines [`ExtractError`], the unified error type returned by
//! every fallible operation in the crate. Variants follow the stages of the
//! extraction pipeline so callers can tell a broken container from a broken
//! decoder or a full disk.

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `stillcut` operations.
///
/// Every public method that can fail returns `Result<T, ExtractError>`.
/// Whether an error ends a run is decided by [`ExtractError::is_fatal`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtractError {
    /// The source file could not be opened or read.
    #[error("Failed to read source file at {path}: {reason}")]
    SourceRead {
        /// Path that was passed to [`crate::FrameExtractor::start`].
        path: PathBuf,
        /// Underlying reason the read failed.
        reason: String,
    },

    /// The container's box structure is malformed or unsupported.
    #[error("Failed to demultiplex container: {0}")]
    Demux(String),

    /// The container holds no decodable video track.
    #[error("No video track found in file")]
    NoVideoTrack,

    /// The decoder could not be configured for the track.
    #[error("Failed to configure video decoder: {0}")]
    DecoderConfig(String),

    /// The decoder failed while decoding a sample.
    #[error("Failed to decode video sample: {0}")]
    DecoderRuntime(String),

    /// A kept frame could not be written to the store.
    #[error("Failed to store frame: {0}")]
    StorageWrite(String),

    /// The store could not be read or cleaned up.
    #[error("Frame store error: {0}")]
    Storage(String),

    /// A kept frame could not be encoded to the output format.
    #[error("Failed to encode frame: {0}")]
    Encode(String),

    /// The extraction configuration was rejected.
    #[error("Invalid extraction config: {0}")]
    InvalidConfig(String),

    /// The run was cancelled via [`crate::FrameExtractor::cancel`] or a
    /// [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// An I/O error occurred outside the source reader.
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// An error from the `image` crate.
    #[error("Image processing error: {0}")]
    ImageError(#[from] ImageError),
}

impl ExtractError {
    /// Returns `true` if this error ends the run.
    ///
    /// Storage and encoding failures only lose the affected frame; the run
    /// logs them and continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ExtractError::StorageWrite(_) | ExtractError::Encode(_) | ExtractError::ImageError(_)
        )
    }
}

impl From<FfmpegError> for ExtractError {
    fn from(error: FfmpegError) -> Self {
        ExtractError::DecoderRuntime(error.to_string())
    }
}
