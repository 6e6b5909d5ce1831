//! Incremental MP4 / MOV demultiplexing.
//!
//! [`Demuxer`] consumes [`Chunk`]s in whatever order the caller reads them
//! and turns them into [`DemuxEvent`]s: one [`TrackDescriptor`] for the first
//! video track, then batches of [`SampleRecord`]s. It never needs the whole
//! file. Between calls it retains only the chunks that still hold bytes it
//! has not consumed, and tells the caller where to read next through
//! [`Demuxer::next_offset`].
//!
//! # Example
//!
//! ```no_run
//! use stillcut::{ChunkedReader, DemuxEvent, Demuxer};
//!
//! # async fn example() -> Result<(), stillcut::ExtractError> {
//! let mut reader = ChunkedReader::open("input.mp4", 5 * 1024 * 1024).await?;
//! let mut demuxer = Demuxer::new(reader.len(), 100);
//!
//! let mut events = Vec::new();
//! while let Some(offset) = demuxer.next_offset() {
//!     let chunk = reader.read_chunk(offset).await?;
//!     events.extend(demuxer.push(chunk)?);
//! }
//! events.extend(demuxer.flush()?);
//!
//! for event in events {
//!     match event {
//!         DemuxEvent::Track(track) => println!("{} {}x{}", track.codec_string, track.width, track.height),
//!         DemuxEvent::Samples(samples) => println!("{} samples", samples.len()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod boxes;
mod sample_table;

use std::{
    collections::VecDeque,
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};

use crate::{
    error::ExtractError,
    source::{Chunk, ChunkSlice},
};

use self::{
    boxes::{BoxHeader, FourCc, MDAT, MOOV, SampleDescription, fourcc_str, parse_movie},
    sample_table::{SampleEntry, ticks_to_micros},
};

/// Video codec of the extracted track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC (`avc1`, `avc3`).
    H264,
    /// H.265 / HEVC (`hvc1`, `hev1`).
    Hevc,
    /// VP9 (`vp09`).
    Vp9,
    /// AV1 (`av01`).
    Av1,
    /// Any other sample entry, by fourcc. Decoders reject these.
    Other(String),
}

impl VideoCodec {
    fn from_fourcc(format: &FourCc) -> Self {
        match format {
            b"avc1" | b"avc3" => VideoCodec::H264,
            b"hvc1" | b"hev1" => VideoCodec::Hevc,
            b"vp09" => VideoCodec::Vp9,
            b"av01" => VideoCodec::Av1,
            other => VideoCodec::Other(fourcc_str(other)),
        }
    }
}

impl Display for VideoCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            VideoCodec::H264 => f.write_str("H.264"),
            VideoCodec::Hevc => f.write_str("HEVC"),
            VideoCodec::Vp9 => f.write_str("VP9"),
            VideoCodec::Av1 => f.write_str("AV1"),
            VideoCodec::Other(fourcc) => write!(f, "unsupported ({fourcc})"),
        }
    }
}

/// Everything a decoder needs to know about the video track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    /// Track id from `tkhd`.
    pub track_id: u32,
    /// Codec family.
    pub codec: VideoCodec,
    /// RFC 6381 style codec string, e.g. `avc1.64001f`.
    pub codec_string: String,
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// Track timescale (ticks per second).
    pub timescale: u32,
    /// Track duration.
    pub duration: Duration,
    /// Number of samples in the track.
    pub sample_count: u32,
    /// Decoder configuration record (`avcC`, `hvcC`, `vpcC` or `av1C`
    /// payload). Empty if the sample entry carried none.
    pub codec_config: Vec<u8>,
}

impl TrackDescriptor {
    /// Track duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

/// One compressed video sample.
///
/// Timestamps are in microseconds. `data` aliases the chunk it was read
/// from unless the sample straddled two chunks.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    /// Zero-based position in decode order.
    pub number: u32,
    /// Decode timestamp.
    pub decode_timestamp: i64,
    /// Presentation timestamp.
    pub presentation_timestamp: i64,
    /// Sample duration.
    pub duration: u64,
    /// Whether the sample can be decoded without earlier samples.
    pub is_key: bool,
    /// Compressed bytes.
    pub data: ChunkSlice,
}

impl SampleRecord {
    /// Presentation timestamp in seconds.
    pub fn timestamp_seconds(&self) -> f64 {
        self.presentation_timestamp as f64 / 1_000_000.0
    }
}

/// Output of [`Demuxer::push`] and [`Demuxer::flush`].
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// The video track was found. Emitted exactly once, before any samples.
    Track(TrackDescriptor),
    /// A batch of samples in decode order.
    Samples(Vec<SampleRecord>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Walking top-level boxes looking for `moov`.
    Scanning,
    /// Buffering the `moov` payload `[start, end)`.
    Movie { start: u64, end: u64 },
    /// Emitting samples.
    Samples,
    Done,
}

/// Incremental ISO base media demuxer.
///
/// Feed it chunks with [`push`](Self::push), read wherever
/// [`next_offset`](Self::next_offset) points, and call
/// [`flush`](Self::flush) once it returns `None`.
pub struct Demuxer {
    file_len: u64,
    batch_size: usize,
    phase: Phase,
    chunks: VecDeque<Chunk>,
    cursor: u64,
    media_before_movie: Option<u64>,
    track: Option<TrackDescriptor>,
    timescale: u32,
    entries: Vec<SampleEntry>,
    next_sample: usize,
    pending: Vec<SampleRecord>,
}

impl Demuxer {
    /// Create a demuxer for a file of `file_len` bytes that emits samples
    /// in batches of `batch_size`.
    pub fn new(file_len: u64, batch_size: usize) -> Self {
        Self {
            file_len,
            batch_size: batch_size.max(1),
            phase: Phase::Scanning,
            chunks: VecDeque::new(),
            cursor: 0,
            media_before_movie: None,
            track: None,
            timescale: 0,
            entries: Vec::new(),
            next_sample: 0,
            pending: Vec::new(),
        }
    }

    /// The track descriptor, once found.
    pub fn track(&self) -> Option<&TrackDescriptor> {
        self.track.as_ref()
    }

    /// Number of samples turned into records so far, including any held
    /// for the next batch.
    pub fn samples_emitted(&self) -> usize {
        self.next_sample
    }

    /// Bytes currently retained from pushed chunks.
    pub fn retained_bytes(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Whether every sample has been emitted or the input was flushed.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// File offset the caller should read next, or `None` when the demuxer
    /// needs no more input.
    pub fn next_offset(&self) -> Option<u64> {
        let needed = match self.phase {
            Phase::Scanning if self.cursor >= self.file_len => return None,
            Phase::Scanning => self.covered_until(self.cursor),
            Phase::Movie { start, .. } => self.covered_until(start),
            Phase::Samples => self.covered_until(self.entries.get(self.next_sample)?.offset),
            Phase::Done => return None,
        };
        (needed < self.file_len).then_some(needed)
    }

    /// Feed one chunk and collect whatever events it completes.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Demux`] for malformed or unsupported box
    /// structure and [`ExtractError::NoVideoTrack`] if the movie has no
    /// video track.
    pub fn push(&mut self, chunk: Chunk) -> Result<Vec<DemuxEvent>, ExtractError> {
        let mut events = Vec::new();
        if self.phase == Phase::Done || chunk.is_empty() {
            return Ok(events);
        }
        self.retain(chunk);
        self.advance(&mut events)?;
        self.prune();
        Ok(events)
    }

    /// Signal end of input and emit the trailing partial batch.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::NoVideoTrack`] if no `moov` box was found,
    /// and [`ExtractError::Demux`] if the `moov` box was cut short.
    pub fn flush(&mut self) -> Result<Vec<DemuxEvent>, ExtractError> {
        match self.phase {
            Phase::Scanning | Phase::Done if self.track.is_none() => {
                return Err(ExtractError::NoVideoTrack);
            }
            Phase::Movie { start, end } => {
                return Err(ExtractError::Demux(format!(
                    "moov box at {start}..{end} is incomplete"
                )));
            }
            Phase::Samples => {
                let remaining = self.entries.len() - self.next_sample;
                if remaining > 0 {
                    log::warn!("Input ended with {remaining} samples unread");
                }
            }
            _ => {}
        }

        let mut events = Vec::new();
        if !self.pending.is_empty() {
            events.push(DemuxEvent::Samples(std::mem::take(&mut self.pending)));
        }
        self.next_sample = self.entries.len();
        self.phase = Phase::Done;
        self.chunks.clear();
        Ok(events)
    }

    fn advance(&mut self, events: &mut Vec<DemuxEvent>) -> Result<(), ExtractError> {
        loop {
            let progressed = match self.phase {
                Phase::Scanning => self.scan_box()?,
                Phase::Movie { start, end } => self.read_movie(start, end, events)?,
                Phase::Samples => {
                    self.collect_samples(events);
                    false
                }
                Phase::Done => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn scan_box(&mut self) -> Result<bool, ExtractError> {
        let remaining = self.file_len.saturating_sub(self.cursor);
        if remaining < 8 {
            if remaining > 0 {
                log::warn!("Ignoring {remaining} trailing bytes after the last box");
            }
            self.cursor = self.file_len;
            self.phase = Phase::Done;
            return Ok(false);
        }

        let Some(head) = self.slice_at(self.cursor, remaining.min(16)) else {
            return Ok(false);
        };
        let Some(header) = BoxHeader::parse(&head)? else {
            log::warn!("Truncated box header at offset {}", self.cursor);
            self.cursor = self.file_len;
            self.phase = Phase::Done;
            return Ok(false);
        };

        let total = header.total_len(remaining);
        match header.kind {
            MOOV => {
                if total > remaining {
                    return Err(ExtractError::Demux(format!(
                        "moov box at {} extends {} bytes past end of file",
                        self.cursor,
                        total - remaining
                    )));
                }
                log::debug!("Found moov box at {} ({total} bytes)", self.cursor);
                self.phase = Phase::Movie {
                    start: self.cursor + header.header_len,
                    end: self.cursor + total,
                };
            }
            MDAT => {
                if self.media_before_movie.is_none() {
                    log::debug!("mdat at {} precedes moov, skipping {total} bytes", self.cursor);
                    self.media_before_movie = Some(self.cursor);
                }
                self.cursor = self.cursor.saturating_add(total);
            }
            kind => {
                log::trace!("Skipping '{}' box at {}", fourcc_str(&kind), self.cursor);
                self.cursor = self.cursor.saturating_add(total);
            }
        }
        Ok(true)
    }

    fn read_movie(
        &mut self,
        start: u64,
        end: u64,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<bool, ExtractError> {
        let Some(payload) = self.slice_at(start, end - start) else {
            return Ok(false);
        };

        let movie = parse_movie(&payload)?;
        log::debug!(
            "Movie has {} tracks, duration {} ticks at timescale {}",
            movie.tracks.len(),
            movie.duration,
            movie.timescale
        );
        let fragmented = movie.fragmented;
        let track = movie.first_video_track().ok_or(ExtractError::NoVideoTrack)?;
        if track.table.is_empty() && fragmented {
            return Err(ExtractError::Demux(
                "fragmented MP4 (samples in moof boxes) is not supported".to_string(),
            ));
        }
        if track.timescale == 0 {
            return Err(ExtractError::Demux("video track timescale is zero".to_string()));
        }
        let description = track.description.clone().ok_or_else(|| {
            ExtractError::Demux("video track has no sample description".to_string())
        })?;

        let entries = track.table.expand(self.file_len)?;
        let duration_ticks = if track.duration > 0 {
            track.duration
        } else {
            entries.iter().map(|entry| u64::from(entry.duration_ticks)).sum()
        };
        let duration_micros = ticks_to_micros(duration_ticks as i64, track.timescale).max(0);

        let codec = VideoCodec::from_fourcc(&description.format);
        let descriptor = TrackDescriptor {
            track_id: track.track_id,
            codec_string: codec_string(&codec, &description),
            codec,
            width: u32::from(description.width),
            height: u32::from(description.height),
            timescale: track.timescale,
            duration: Duration::from_micros(duration_micros as u64),
            sample_count: entries.len() as u32,
            codec_config: description.config,
        };

        log::debug!(
            "Video track {}: {} {}x{}, {} samples, {:.3}s",
            descriptor.track_id,
            descriptor.codec_string,
            descriptor.width,
            descriptor.height,
            descriptor.sample_count,
            descriptor.duration_seconds()
        );
        if let (Some(mdat), Some(first)) = (self.media_before_movie, entries.first()) {
            if first.offset < start {
                log::debug!(
                    "Media data at {mdat} precedes moov, rewinding to first sample at {}",
                    first.offset
                );
            }
        }

        events.push(DemuxEvent::Track(descriptor.clone()));
        self.track = Some(descriptor);
        self.timescale = track.timescale;
        self.entries = entries;
        self.next_sample = 0;
        self.chunks
            .retain(|chunk| !(chunk.offset >= start && chunk.end() <= end));
        self.phase = if self.entries.is_empty() {
            Phase::Done
        } else {
            Phase::Samples
        };
        Ok(true)
    }

    fn collect_samples(&mut self, events: &mut Vec<DemuxEvent>) {
        while let Some(entry) = self.entries.get(self.next_sample).copied() {
            if entry.end() > self.file_len {
                log::warn!(
                    "Sample {} at offset {} runs past end of file; dropping the last {} samples",
                    self.next_sample,
                    entry.offset,
                    self.entries.len() - self.next_sample
                );
                self.next_sample = self.entries.len();
                break;
            }
            let Some(data) = self.slice_at(entry.offset, u64::from(entry.size)) else {
                return;
            };

            let record = SampleRecord {
                number: self.next_sample as u32,
                decode_timestamp: ticks_to_micros(entry.decode_ticks as i64, self.timescale),
                presentation_timestamp: ticks_to_micros(
                    (entry.decode_ticks as i64).saturating_add(entry.composition_offset),
                    self.timescale,
                ),
                duration: ticks_to_micros(i64::from(entry.duration_ticks), self.timescale) as u64,
                is_key: entry.is_sync,
                data,
            };
            log::trace!(
                "Sample {} at {}us ({} bytes{})",
                record.number,
                record.presentation_timestamp,
                entry.size,
                if record.is_key { ", key" } else { "" }
            );
            self.pending.push(record);
            self.next_sample += 1;

            if self.pending.len() >= self.batch_size {
                events.push(DemuxEvent::Samples(std::mem::take(&mut self.pending)));
            }
        }
        self.phase = Phase::Done;
    }

    fn retain(&mut self, chunk: Chunk) {
        let index = self.chunks.partition_point(|held| held.offset < chunk.offset);
        match self.chunks.get_mut(index) {
            Some(held) if held.offset == chunk.offset => {
                if chunk.len() > held.len() {
                    *held = chunk;
                }
            }
            _ => self.chunks.insert(index, chunk),
        }
    }

    /// Drop chunks that hold nothing the demuxer still needs.
    fn prune(&mut self) {
        let keep_from = match self.phase {
            Phase::Scanning => self.cursor,
            Phase::Movie { start, .. } => start,
            Phase::Samples => match self.entries.get(self.next_sample) {
                Some(entry) => entry.offset,
                None => u64::MAX,
            },
            Phase::Done => u64::MAX,
        };
        self.chunks.retain(|chunk| chunk.end() > keep_from);
    }

    /// First offset at or after `offset` not covered by retained chunks.
    fn covered_until(&self, offset: u64) -> u64 {
        let mut position = offset;
        for chunk in &self.chunks {
            if chunk.end() <= position {
                continue;
            }
            if chunk.offset > position {
                break;
            }
            position = chunk.end();
        }
        position
    }

    /// Bytes `[offset, offset + len)` if the retained chunks cover them.
    fn slice_at(&self, offset: u64, len: u64) -> Option<ChunkSlice> {
        if len == 0 {
            return Some(ChunkSlice::from_vec(Vec::new()));
        }
        let end = offset.checked_add(len)?;
        let mut parts: Vec<&[u8]> = Vec::new();
        let mut position = offset;
        for chunk in &self.chunks {
            if chunk.end() <= position {
                continue;
            }
            if chunk.offset > position {
                return None;
            }
            if parts.is_empty() && chunk.contains(offset, len) {
                return Some(chunk.slice(offset, len as usize));
            }
            let from = (position - chunk.offset) as usize;
            let to = (end.min(chunk.end()) - chunk.offset) as usize;
            parts.push(&chunk.data[from..to]);
            position = chunk.offset + to as u64;
            if position >= end {
                return Some(ChunkSlice::copy_from(&parts));
            }
        }
        None
    }
}

fn codec_string(codec: &VideoCodec, description: &SampleDescription) -> String {
    match codec {
        VideoCodec::H264 if description.config.len() >= 4 => format!(
            "avc1.{:02x}{:02x}{:02x}",
            description.config[1], description.config[2], description.config[3]
        ),
        _ => fourcc_str(&description.format),
    }
}
