//! Session-scoped persistence for kept frames.
//!
//! Every run writes its frames under a fresh [`SessionId`], one
//! [`FrameStore::save`] per kept frame as the run progresses. Frames stay
//! until the caller deletes the session or clears the store; a cancelled or
//! failed run keeps whatever it already saved.
//!
//! Two stores are provided: [`DirectoryStore`] writes one file per frame
//! under a directory per session, and [`MemoryStore`] keeps everything in
//! process.

mod directory;
mod memory;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{configuration::OutputFormat, error::ExtractError};

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

const SESSION_PREFIX: &str = "session-";
const FRAME_PREFIX: &str = "frame-";

/// Identifier grouping one run's frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new, unique session id of the form `session-<uuid>`.
    pub fn new() -> Self {
        Self(format!("{SESSION_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ExtractError;

    /// Accept any id made of ASCII letters, digits, `-` and `_`, so it is
    /// always safe to use as a directory name.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let valid = !value.is_empty()
            && value
                .bytes()
                .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(ExtractError::Storage(format!("invalid session id '{value}'")))
        }
    }
}

/// Build a frame id for a frame at `timestamp_micros`.
///
/// Ids have the form `frame-<micros>-<16 hex digits>`. The random suffix
/// keeps ids unique even when two frames share a timestamp.
pub fn frame_id(timestamp_micros: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{FRAME_PREFIX}{}-{}", timestamp_micros.max(0), &suffix[..16])
}

/// Recover the timestamp embedded in a frame id.
pub fn frame_id_timestamp(id: &str) -> Option<i64> {
    let rest = id.strip_prefix(FRAME_PREFIX)?;
    let (micros, suffix) = rest.split_once('-')?;
    if suffix.is_empty() {
        return None;
    }
    micros.parse().ok()
}

/// One kept, encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFrame {
    /// Unique frame id, see [`frame_id`].
    pub id: String,
    /// Session the frame belongs to.
    pub session_id: SessionId,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Encoded image bytes.
    pub data: Vec<u8>,
    /// Encoding of `data`.
    pub format: OutputFormat,
}

impl ExtractedFrame {
    /// Create a record with a fresh id.
    pub fn new(session_id: SessionId, timestamp: i64, data: Vec<u8>, format: OutputFormat) -> Self {
        Self {
            id: frame_id(timestamp),
            session_id,
            timestamp,
            data,
            format,
        }
    }

    /// MIME type of `data`.
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// Timestamp in seconds.
    pub fn timestamp_seconds(&self) -> f64 {
        self.timestamp as f64 / 1_000_000.0
    }

    /// File name used by [`DirectoryStore`]: `<id>.<ext>`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, self.format.extension())
    }
}

/// Durable, session-scoped storage for extracted frames.
///
/// Implementations must tolerate concurrent `save` calls for the same
/// session; the pipeline persists up to
/// [`PipelineLimits::max_frames_in_flight`](crate::PipelineLimits) frames at
/// once.
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Persist one frame.
    async fn save(&self, frame: &ExtractedFrame) -> Result<(), ExtractError>;

    /// All frames of `session`, ordered by timestamp.
    async fn get_by_session(&self, session: &SessionId) -> Result<Vec<ExtractedFrame>, ExtractError>;

    /// Remove every frame of `session`. Removing an unknown session is not
    /// an error.
    async fn delete_session(&self, session: &SessionId) -> Result<(), ExtractError>;

    /// Remove every session.
    async fn clear(&self) -> Result<(), ExtractError>;

    /// Number of frames stored for `session`.
    async fn frame_count(&self, session: &SessionId) -> Result<usize, ExtractError>;

    /// Sessions that currently hold at least one frame.
    async fn sessions(&self) -> Result<Vec<SessionId>, ExtractError>;
}

/// Sort frames by timestamp, then id, for stable retrieval.
pub(crate) fn sort_frames(frames: &mut [ExtractedFrame]) {
    frames.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}
