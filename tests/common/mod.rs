//! Shared helpers for integration tests: a synthetic MP4 writer, an
//! in-memory demux driver, and decoder and store doubles.
//!
//! The synthetic files carry no real bitstream. Every sample starts with
//! its own zero-based number as a big-endian `u32`, which lets the fake
//! decoder check that the demuxer located each sample correctly.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use stillcut::{
    Chunk, DecodedFrame, DecoderBackend, DemuxEvent, Demuxer, ExtractError, ExtractedFrame,
    FrameDecoder, FrameStore, MemoryStore, SampleRecord, SessionId, TrackDescriptor,
};

/// Ticks per frame in the synthetic track's timescale.
const TICKS_PER_FRAME: u32 = 1000;

/// Description of a synthetic single-track MP4 file.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub frame_count: u32,
    pub fps: u32,
    pub width: u16,
    pub height: u16,
    pub sample_size: usize,
    pub samples_per_chunk: u32,
    /// Every n-th sample is a sync sample. `None` omits `stss`.
    pub keyframe_interval: Option<u32>,
    /// Place `mdat` before `moov`.
    pub media_first: bool,
    /// Handler of the only track; anything but `vide` hides the video.
    pub handler: [u8; 4],
    /// Write a uniform-size `stsz` declaring this many samples instead of
    /// the real size table.
    pub declared_samples: Option<u32>,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            frame_count: 30,
            fps: 10,
            width: 32,
            height: 18,
            sample_size: 256,
            samples_per_chunk: 5,
            keyframe_interval: Some(10),
            media_first: false,
            handler: *b"vide",
            declared_samples: None,
        }
    }
}

impl SyntheticVideo {
    /// `seconds` of video at `fps`, with a frame at both ends.
    pub fn spanning(seconds: u32, fps: u32) -> Self {
        Self {
            frame_count: seconds * fps + 1,
            fps,
            ..Self::default()
        }
    }

    pub fn timescale(&self) -> u32 {
        self.fps * TICKS_PER_FRAME
    }

    /// Presentation timestamp of sample `number`, in microseconds.
    pub fn timestamp_of(&self, number: u32) -> i64 {
        (i64::from(number) * i64::from(TICKS_PER_FRAME) * 1_000_000) / i64::from(self.timescale())
    }

    pub fn duration_seconds(&self) -> f64 {
        f64::from(self.frame_count) / f64::from(self.fps)
    }

    /// Serialize the whole file.
    pub fn build(&self) -> Vec<u8> {
        let ftyp = self.file_type();
        let media = self.media_payload();

        if self.media_first {
            let media_start = (ftyp.len() + 8) as u64;
            let movie = self.movie(media_start);
            let mut file = ftyp;
            file.extend(boxed(b"mdat", &media));
            file.extend(movie);
            file
        } else {
            // Chunk offsets do not change the size of `moov`.
            let movie_len = self.movie(0).len();
            let media_start = (ftyp.len() + movie_len + 8) as u64;
            let mut file = ftyp;
            file.extend(self.movie(media_start));
            file.extend(boxed(b"mdat", &media));
            file
        }
    }

    /// Write the file into `directory` as `name`.
    pub fn write_to(&self, directory: &Path, name: &str) -> PathBuf {
        let path = directory.join(name);
        std::fs::write(&path, self.build()).expect("Failed to write synthetic video");
        path
    }

    fn file_type(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"isom");
        body.extend_from_slice(&512u32.to_be_bytes());
        body.extend_from_slice(b"isom");
        body.extend_from_slice(b"avc1");
        boxed(b"ftyp", &body)
    }

    fn media_payload(&self) -> Vec<u8> {
        let mut media = Vec::with_capacity(self.frame_count as usize * self.sample_size);
        for number in 0..self.frame_count {
            let mut sample = vec![(number % 251) as u8; self.sample_size.max(4)];
            sample[..4].copy_from_slice(&number.to_be_bytes());
            media.extend(sample);
        }
        media
    }

    fn chunk_count(&self) -> u32 {
        self.frame_count.div_ceil(self.samples_per_chunk.max(1))
    }

    fn movie(&self, media_start: u64) -> Vec<u8> {
        let duration = self.frame_count * TICKS_PER_FRAME;

        let mut mvhd = full_box_header(0);
        mvhd.extend_from_slice(&[0; 8]);
        mvhd.extend_from_slice(&self.timescale().to_be_bytes());
        mvhd.extend_from_slice(&duration.to_be_bytes());
        mvhd.extend_from_slice(&[0; 80]);

        let mut tkhd = full_box_header(3);
        tkhd.extend_from_slice(&[0; 8]);
        tkhd.extend_from_slice(&1u32.to_be_bytes());
        tkhd.extend_from_slice(&[0; 4]);
        tkhd.extend_from_slice(&duration.to_be_bytes());
        tkhd.extend_from_slice(&[0; 60]);

        let mut mdhd = full_box_header(0);
        mdhd.extend_from_slice(&[0; 8]);
        mdhd.extend_from_slice(&self.timescale().to_be_bytes());
        mdhd.extend_from_slice(&duration.to_be_bytes());
        mdhd.extend_from_slice(&[0x55, 0xC4, 0, 0]);

        let mut hdlr = full_box_header(0);
        hdlr.extend_from_slice(&[0; 4]);
        hdlr.extend_from_slice(&self.handler);
        hdlr.extend_from_slice(&[0; 12]);
        hdlr.extend_from_slice(b"synthetic\0");

        let stbl = [
            boxed(b"stsd", &self.sample_description()),
            boxed(b"stts", &self.time_to_sample()),
            boxed(b"stsc", &self.sample_to_chunk()),
            boxed(b"stsz", &self.sample_sizes()),
            boxed(b"stco", &self.chunk_offsets(media_start)),
        ]
        .concat();
        let stbl = match self.sync_samples() {
            Some(stss) => [stbl, boxed(b"stss", &stss)].concat(),
            None => stbl,
        };

        let minf = [
            boxed(b"vmhd", &full_box_header(1)),
            boxed(b"stbl", &stbl),
        ]
        .concat();
        let mdia = [
            boxed(b"mdhd", &mdhd),
            boxed(b"hdlr", &hdlr),
            boxed(b"minf", &minf),
        ]
        .concat();
        let trak = [boxed(b"tkhd", &tkhd), boxed(b"mdia", &mdia)].concat();
        let moov = [boxed(b"mvhd", &mvhd), boxed(b"trak", &trak)].concat();
        boxed(b"moov", &moov)
    }

    fn sample_description(&self) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 16]);
        entry.extend_from_slice(&self.width.to_be_bytes());
        entry.extend_from_slice(&self.height.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&[0; 4]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 32]);
        entry.extend_from_slice(&0x0018u16.to_be_bytes());
        entry.extend_from_slice(&(-1i16).to_be_bytes());
        entry.extend(boxed(b"avcC", &[1, 0x64, 0x00, 0x1F, 0xFF, 0xE0, 0x00]));

        let mut stsd = full_box_header(0);
        stsd.extend_from_slice(&1u32.to_be_bytes());
        stsd.extend(boxed(b"avc1", &entry));
        stsd
    }

    fn time_to_sample(&self) -> Vec<u8> {
        let mut stts = full_box_header(0);
        stts.extend_from_slice(&1u32.to_be_bytes());
        stts.extend_from_slice(&self.frame_count.to_be_bytes());
        stts.extend_from_slice(&TICKS_PER_FRAME.to_be_bytes());
        stts
    }

    fn sample_to_chunk(&self) -> Vec<u8> {
        let mut stsc = full_box_header(0);
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&self.samples_per_chunk.max(1).to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc
    }

    fn sample_sizes(&self) -> Vec<u8> {
        let mut stsz = full_box_header(0);
        if let Some(declared) = self.declared_samples {
            stsz.extend_from_slice(&(self.sample_size.max(4) as u32).to_be_bytes());
            stsz.extend_from_slice(&declared.to_be_bytes());
            return stsz;
        }
        stsz.extend_from_slice(&0u32.to_be_bytes());
        stsz.extend_from_slice(&self.frame_count.to_be_bytes());
        for _ in 0..self.frame_count {
            stsz.extend_from_slice(&(self.sample_size.max(4) as u32).to_be_bytes());
        }
        stsz
    }

    fn chunk_offsets(&self, media_start: u64) -> Vec<u8> {
        let chunk_bytes = u64::from(self.samples_per_chunk.max(1)) * self.sample_size.max(4) as u64;
        let mut stco = full_box_header(0);
        stco.extend_from_slice(&self.chunk_count().to_be_bytes());
        for chunk in 0..u64::from(self.chunk_count()) {
            stco.extend_from_slice(&((media_start + chunk * chunk_bytes) as u32).to_be_bytes());
        }
        stco
    }

    fn sync_samples(&self) -> Option<Vec<u8>> {
        let interval = self.keyframe_interval?.max(1);
        let numbers: Vec<u32> = (0..self.frame_count)
            .step_by(interval as usize)
            .map(|index| index + 1)
            .collect();
        let mut stss = full_box_header(0);
        stss.extend_from_slice(&(numbers.len() as u32).to_be_bytes());
        for number in numbers {
            stss.extend_from_slice(&number.to_be_bytes());
        }
        Some(stss)
    }
}

fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_box_header(flags: u32) -> Vec<u8> {
    (flags & 0x00FF_FFFF).to_be_bytes().to_vec()
}

/// Everything a demux pass produced.
#[derive(Debug, Default)]
pub struct DemuxOutcome {
    pub track: Option<TrackDescriptor>,
    pub batches: Vec<Vec<SampleRecord>>,
    pub reads: usize,
    pub peak_retained: usize,
}

impl DemuxOutcome {
    pub fn samples(&self) -> impl Iterator<Item = &SampleRecord> {
        self.batches.iter().flatten()
    }
}

/// Drive a [`Demuxer`] over in-memory bytes the way the pipeline drives it
/// over a file.
pub fn demux_bytes(
    bytes: &[u8],
    chunk_size: usize,
    batch_size: usize,
) -> Result<DemuxOutcome, ExtractError> {
    let mut demuxer = Demuxer::new(bytes.len() as u64, batch_size);
    let mut outcome = DemuxOutcome::default();
    let mut collect = |events: Vec<DemuxEvent>, outcome: &mut DemuxOutcome| {
        for event in events {
            match event {
                DemuxEvent::Track(track) => {
                    assert!(outcome.track.is_none(), "Track reported twice");
                    assert!(outcome.batches.is_empty(), "Samples before track");
                    outcome.track = Some(track);
                }
                DemuxEvent::Samples(batch) => outcome.batches.push(batch),
            }
        }
    };

    while let Some(offset) = demuxer.next_offset() {
        let start = offset as usize;
        let end = (start + chunk_size).min(bytes.len());
        let chunk = Chunk::new(offset, bytes[start..end].to_vec());
        outcome.reads += 1;
        let events = demuxer.push(chunk)?;
        outcome.peak_retained = outcome.peak_retained.max(demuxer.retained_bytes());
        collect(events, &mut outcome);
    }
    let events = demuxer.flush()?;
    collect(events, &mut outcome);
    Ok(outcome)
}

/// Decoder backend that turns every sample into a solid-colour frame.
///
/// Counts opened and released decoders, and can fail at a chosen sample
/// or slow each decode down.
#[derive(Debug, Default)]
pub struct FakeBackend {
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    decoded: Arc<AtomicUsize>,
    fail_at: Option<u32>,
    delay: Duration,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(sample: u32) -> Self {
        Self {
            fail_at: Some(sample),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn decoded(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }
}

impl DecoderBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn open(&self, track: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, ExtractError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDecoder {
            width: track.width.max(1),
            height: track.height.max(1),
            fail_at: self.fail_at,
            delay: self.delay,
            decoded: Arc::clone(&self.decoded),
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct FakeDecoder {
    width: u32,
    height: u32,
    fail_at: Option<u32>,
    delay: Duration,
    decoded: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl FrameDecoder for FakeDecoder {
    fn decode(&mut self, sample: &SampleRecord) -> Result<Vec<DecodedFrame>, ExtractError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_at == Some(sample.number) {
            return Err(ExtractError::DecoderRuntime(format!(
                "corrupt sample {}",
                sample.number
            )));
        }
        let bytes = sample.data.as_bytes();
        let embedded = bytes
            .get(..4)
            .map(|head| u32::from_be_bytes([head[0], head[1], head[2], head[3]]));
        if embedded != Some(sample.number) {
            return Err(ExtractError::DecoderRuntime(format!(
                "sample {} carries the bytes of {embedded:?}",
                sample.number
            )));
        }
        self.decoded.fetch_add(1, Ordering::SeqCst);

        let shade = (sample.number % 256) as u8;
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([shade, 64, 255 - shade]));
        Ok(vec![DecodedFrame::from_image(
            sample.presentation_timestamp,
            DynamicImage::ImageRgb8(image),
        )])
    }

    fn flush(&mut self) -> Result<Vec<DecodedFrame>, ExtractError> {
        Ok(Vec::new())
    }
}

impl Drop for FakeDecoder {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store that rejects every `fail_every`-th save and keeps the rest in a
/// [`MemoryStore`].
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_every: usize,
    attempts: AtomicUsize,
    rejected: Mutex<Vec<i64>>,
}

impl FlakyStore {
    pub fn new(fail_every: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_every: fail_every.max(1),
            attempts: AtomicUsize::new(0),
            rejected: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Timestamps of rejected frames, in the order they were rejected.
    pub fn rejected(&self) -> Vec<i64> {
        self.rejected.lock().expect("rejected list poisoned").clone()
    }
}

#[async_trait]
impl FrameStore for FlakyStore {
    async fn save(&self, frame: &ExtractedFrame) -> Result<(), ExtractError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt % self.fail_every == 0 {
            self.rejected
                .lock()
                .expect("rejected list poisoned")
                .push(frame.timestamp);
            return Err(ExtractError::StorageWrite(format!(
                "quota exceeded on save {attempt}"
            )));
        }
        self.inner.save(frame).await
    }

    async fn get_by_session(&self, session: &SessionId) -> Result<Vec<ExtractedFrame>, ExtractError> {
        self.inner.get_by_session(session).await
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), ExtractError> {
        self.inner.delete_session(session).await
    }

    async fn clear(&self) -> Result<(), ExtractError> {
        self.inner.clear().await
    }

    async fn frame_count(&self, session: &SessionId) -> Result<usize, ExtractError> {
        self.inner.frame_count(session).await
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, ExtractError> {
        self.inner.sessions().await
    }
}

/// Timestamps of `frames`, in seconds rounded to milliseconds.
pub fn seconds(frames: &[ExtractedFrame]) -> Vec<f64> {
    frames
        .iter()
        .map(|frame| (frame.timestamp_seconds() * 1000.0).round() / 1000.0)
        .collect()
}
