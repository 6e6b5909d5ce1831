use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::error::ExtractError;

use super::{ExtractedFrame, FrameStore, SessionId, sort_frames};

/// A [`FrameStore`] that keeps frames in process memory.
///
/// Useful for embedding and tests. Frames are lost when the store is
/// dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Vec<ExtractedFrame>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SessionId, Vec<ExtractedFrame>>>, ExtractError> {
        self.sessions
            .lock()
            .map_err(|_| ExtractError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl FrameStore for MemoryStore {
    async fn save(&self, frame: &ExtractedFrame) -> Result<(), ExtractError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| ExtractError::StorageWrite("memory store lock poisoned".to_string()))?;
        sessions
            .entry(frame.session_id.clone())
            .or_default()
            .push(frame.clone());
        Ok(())
    }

    async fn get_by_session(&self, session: &SessionId) -> Result<Vec<ExtractedFrame>, ExtractError> {
        let mut frames = self.lock()?.get(session).cloned().unwrap_or_default();
        sort_frames(&mut frames);
        Ok(frames)
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), ExtractError> {
        self.lock()?.remove(session);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ExtractError> {
        self.lock()?.clear();
        Ok(())
    }

    async fn frame_count(&self, session: &SessionId) -> Result<usize, ExtractError> {
        Ok(self.lock()?.get(session).map_or(0, Vec::len))
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, ExtractError> {
        let mut sessions: Vec<SessionId> = self
            .lock()?
            .iter()
            .filter(|(_, frames)| !frames.is_empty())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        Ok(sessions)
    }
}
