//! # stillcut
//!
//! Extract still frames from large local video files at a fixed sampling
//! interval, without ever holding the whole file or the whole output set in
//! memory.
//!
//! A run streams the file in bounded chunks through an incremental MP4
//! demuxer, decodes samples with FFmpeg on a dedicated thread, keeps one
//! frame per interval, and encodes and stores each kept frame as it goes.
//! Every stage runs concurrently; a single [`Coordinator`] pauses reading
//! and decode submission when the queues behind them fill up.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stillcut::{DirectoryStore, ExtractionConfig, FrameExtractor, FrameStore};
//!
//! # async fn example() -> Result<(), stillcut::ExtractError> {
//! let extractor = FrameExtractor::new(Arc::new(DirectoryStore::new("frames")));
//!
//! // One frame every five seconds, as JPEG.
//! let session = extractor.start("input.mp4", ExtractionConfig::new(5.0)).await?;
//! let state = extractor.wait().await;
//!
//! for frame in extractor.store().get_by_session(&session).await? {
//!     println!("{} at {:.2}s", frame.id, frame.timestamp_seconds());
//! }
//! println!("{:?}", state.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Sampling
//!
//! The first decoded frame at or after the window start is kept. After
//! that, a frame is kept when it is at least `interval - 0.05` seconds after
//! the previously kept one. The run completes at the first frame past the
//! window end, or when the file ends.
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `hardware` | Hardware-accelerated decoding (CUDA, VAAPI, DXVA2, D3D11VA, VideoToolbox, QSV) with software fallback |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed. Only FFmpeg's decoders
//! are used; demuxing is done in Rust.

pub mod configuration;
mod conversion;
pub mod coordinator;
pub mod decoder;
pub mod demux;
pub mod encode;
pub mod error;
pub mod extractor;
mod pipeline;
pub mod progress;
pub mod sampling;
pub mod source;
pub mod store;

pub use configuration::{DEFAULT_CHUNK_SIZE, ExtractionConfig, OutputFormat, PipelineLimits};
pub use coordinator::{Coordinator, FrameSlot, Pressure};
pub use decoder::{
    DecodedFrame, DecoderAdapter, DecoderBackend, DecoderOutput, FfmpegBackend, FfmpegLogLevel,
    FrameDecoder, Picture, SampleSubmitter, get_ffmpeg_log_level, set_ffmpeg_log_level,
};
#[cfg(feature = "hardware")]
pub use decoder::{HardwareAccelerationMode, HardwareDeviceType, available_hardware_devices};
pub use demux::{DemuxEvent, Demuxer, SampleRecord, TrackDescriptor, VideoCodec};
pub use encode::encode_frame;
pub use error::ExtractError;
pub use extractor::{FrameExtractor, FrameExtractorBuilder};
pub use progress::{
    CancellationToken, FramePreview, ProcessingState, ProcessingStatus, ProgressCallback,
    ProgressInfo,
};
pub use sampling::{FrameSampler, SAMPLING_TOLERANCE, SampleDecision, estimate_kept_frames};
pub use source::{Chunk, ChunkSlice, ChunkedReader};
pub use store::{
    DirectoryStore, ExtractedFrame, FrameStore, MemoryStore, SessionId, frame_id,
    frame_id_timestamp,
};
