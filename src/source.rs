//! Chunked access to the source file.
//!
//! [`ChunkedReader`] reads a length-known file in bounded [`Chunk`]s. Each
//! chunk's bytes live behind an [`Arc`], so the demuxer can hand out
//! [`ChunkSlice`]s that alias the chunk without copying. A chunk is freed
//! once the demuxer and every sample that references it have dropped it.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::SeekFrom,
    ops::{Deref, Range},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use crate::error::ExtractError;

/// A bounded byte range read from the source file.
#[derive(Clone)]
pub struct Chunk {
    /// Absolute file offset of the first byte.
    pub offset: u64,
    /// The bytes read.
    pub data: Arc<[u8]>,
}

impl Chunk {
    /// Wrap bytes read at `offset`.
    pub fn new(offset: u64, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk holds no bytes (a read at or past end of file).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Absolute offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Whether `[offset, offset + len)` lies entirely inside this chunk.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset.saturating_add(len) <= self.end()
    }

    /// A reference-counted view of `[offset, offset + len)`, which must lie
    /// inside the chunk.
    pub(crate) fn slice(&self, offset: u64, len: usize) -> ChunkSlice {
        let start = (offset - self.offset) as usize;
        ChunkSlice {
            buffer: Arc::clone(&self.data),
            range: start..start + len,
        }
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Chunk")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A reference-counted view into a chunk's bytes.
///
/// Cloning is cheap. The underlying chunk stays alive as long as any slice
/// refers to it.
#[derive(Clone)]
pub struct ChunkSlice {
    buffer: Arc<[u8]>,
    range: Range<usize>,
}

impl ChunkSlice {
    /// Build a slice owning a fresh buffer.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            buffer: bytes.into(),
            range: 0..len,
        }
    }

    /// Concatenate `parts` into a new buffer. Used when a sample straddles
    /// two chunks.
    pub fn copy_from(parts: &[&[u8]]) -> Self {
        let total = parts.iter().map(|part| part.len()).sum();
        let mut bytes = Vec::with_capacity(total);
        for part in parts {
            bytes.extend_from_slice(part);
        }
        Self::from_vec(bytes)
    }

    /// The viewed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.range.clone()]
    }

    /// Whether this slice shares its buffer with `chunk`.
    pub fn aliases(&self, chunk: &Chunk) -> bool {
        Arc::ptr_eq(&self.buffer, &chunk.data)
    }
}

impl Deref for ChunkSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for ChunkSlice {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Debug for ChunkSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ChunkSlice")
            .field("len", &self.range.len())
            .finish()
    }
}

/// Sequential, bounded reads from a local file of known length.
///
/// # Example
///
/// ```no_run
/// use stillcut::ChunkedReader;
///
/// # async fn example() -> Result<(), stillcut::ExtractError> {
/// let mut reader = ChunkedReader::open("input.mp4", 5 * 1024 * 1024).await?;
/// let mut offset = 0;
/// while offset < reader.len() {
///     let chunk = reader.read_chunk(offset).await?;
///     offset = chunk.end();
/// }
/// # Ok(())
/// # }
/// ```
pub struct ChunkedReader {
    file: File,
    path: PathBuf,
    len: u64,
    chunk_size: usize,
    position: u64,
}

impl ChunkedReader {
    /// Open `path` for chunked reading.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::SourceRead`] if the file cannot be opened or
    /// its length cannot be determined.
    pub async fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self, ExtractError> {
        let path = path.as_ref().to_path_buf();
        log::debug!("Opening source file {}", path.display());

        let file = File::open(&path)
            .await
            .map_err(|error| source_error(&path, error))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|error| source_error(&path, error))?;
        if !metadata.is_file() {
            return Err(ExtractError::SourceRead {
                path,
                reason: "not a regular file".to_string(),
            });
        }

        log::debug!("Source is {} bytes, reading in {chunk_size}-byte chunks", metadata.len());

        Ok(Self {
            file,
            path,
            len: metadata.len(),
            chunk_size: chunk_size.max(1),
            position: 0,
        })
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path the reader was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maximum bytes returned by [`read_chunk`](Self::read_chunk).
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// The result is shorter than `length` only at end of file, and empty
    /// when `offset` is at or past the end.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::SourceRead`] on any I/O failure.
    pub async fn read(&mut self, offset: u64, length: usize) -> Result<Chunk, ExtractError> {
        if offset >= self.len {
            return Ok(Chunk::new(offset, Vec::new()));
        }
        let available = (self.len - offset).min(length as u64) as usize;

        if offset != self.position {
            if offset < self.position {
                log::debug!("Rewinding source from {} to {offset}", self.position);
            }
            self.file
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|error| source_error(&self.path, error))?;
        }

        let mut buffer = vec![0u8; available];
        self.file
            .read_exact(&mut buffer)
            .await
            .map_err(|error| source_error(&self.path, error))?;
        self.position = offset + available as u64;

        log::trace!("Read {available} bytes at offset {offset}");
        Ok(Chunk::new(offset, buffer))
    }

    /// Read one chunk of at most [`chunk_size`](Self::chunk_size) bytes.
    pub async fn read_chunk(&mut self, offset: u64) -> Result<Chunk, ExtractError> {
        self.read(offset, self.chunk_size).await
    }
}

impl Debug for ChunkedReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ChunkedReader")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

fn source_error(path: &Path, error: std::io::Error) -> ExtractError {
    ExtractError::SourceRead {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}
