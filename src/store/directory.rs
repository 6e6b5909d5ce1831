use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs;

use crate::{configuration::OutputFormat, error::ExtractError};

use super::{ExtractedFrame, FrameStore, SessionId, frame_id_timestamp, sort_frames};

/// A [`FrameStore`] that writes one file per frame.
///
/// Layout: `<root>/<session id>/<frame id>.<ext>`. The timestamp is
/// recovered from the frame id and the format from the extension, so the
/// directory is the only source of truth; nothing else is written.
///
/// # Example
///
/// ```no_run
/// use stillcut::{DirectoryStore, FrameStore, SessionId};
///
/// # async fn example(session: SessionId) -> Result<(), stillcut::ExtractError> {
/// let store = DirectoryStore::new("frames");
/// for frame in store.get_by_session(&session).await? {
///     println!("{} at {:.3}s ({})", frame.id, frame.timestamp_seconds(), frame.mime_type());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at `root`. Directories are created lazily on
    /// the first save.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `session`'s frames.
    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    /// Frame files of `session` with their parsed timestamp and format.
    async fn frame_files(
        &self,
        session: &SessionId,
    ) -> Result<Vec<(PathBuf, String, i64, OutputFormat)>, ExtractError> {
        let dir = self.session_dir(session);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(storage_error(&dir, error)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| storage_error(&dir, error))?
        {
            let path = entry.path();
            let (Some(stem), Some(extension)) = (
                path.file_stem().and_then(|stem| stem.to_str()),
                path.extension().and_then(|ext| ext.to_str()),
            ) else {
                continue;
            };
            let (Some(timestamp), Some(format)) =
                (frame_id_timestamp(stem), OutputFormat::from_name(extension))
            else {
                log::trace!("Ignoring stray file {}", path.display());
                continue;
            };
            files.push((path.clone(), stem.to_string(), timestamp, format));
        }
        Ok(files)
    }
}

#[async_trait]
impl FrameStore for DirectoryStore {
    async fn save(&self, frame: &ExtractedFrame) -> Result<(), ExtractError> {
        let dir = self.session_dir(&frame.session_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|error| write_error(&dir, error))?;

        let path = dir.join(frame.file_name());
        fs::write(&path, &frame.data)
            .await
            .map_err(|error| write_error(&path, error))?;

        log::trace!("Saved {} ({} bytes)", path.display(), frame.data.len());
        Ok(())
    }

    async fn get_by_session(&self, session: &SessionId) -> Result<Vec<ExtractedFrame>, ExtractError> {
        let files = self.frame_files(session).await?;
        let mut frames = Vec::with_capacity(files.len());
        for (path, id, timestamp, format) in files {
            let data = fs::read(&path)
                .await
                .map_err(|error| storage_error(&path, error))?;
            frames.push(ExtractedFrame {
                id,
                session_id: session.clone(),
                timestamp,
                data,
                format,
            });
        }
        sort_frames(&mut frames);
        Ok(frames)
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), ExtractError> {
        let dir = self.session_dir(session);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                log::debug!("Deleted session directory {}", dir.display());
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(storage_error(&dir, error)),
        }
    }

    async fn clear(&self) -> Result<(), ExtractError> {
        // Only session directories are removed; anything else under the
        // root is left alone.
        for session in self.sessions().await? {
            self.delete_session(&session).await?;
        }
        Ok(())
    }

    async fn frame_count(&self, session: &SessionId) -> Result<usize, ExtractError> {
        Ok(self.frame_files(session).await?.len())
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, ExtractError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(storage_error(&self.root, error)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| storage_error(&self.root, error))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_dir || !name.starts_with(super::SESSION_PREFIX) {
                continue;
            }
            if let Ok(session) = name.parse::<SessionId>() {
                sessions.push(session);
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

fn write_error(path: &Path, error: std::io::Error) -> ExtractError {
    ExtractError::StorageWrite(format!("{}: {error}", path.display()))
}

fn storage_error(path: &Path, error: std::io::Error) -> ExtractError {
    ExtractError::Storage(format!("{}: {error}", path.display()))
}
