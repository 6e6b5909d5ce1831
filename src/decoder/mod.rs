//! Decoder adapter.
//!
//! Decoding runs through two traits: a [`DecoderBackend`] opens a
//! [`FrameDecoder`] for a track, and the decoder turns samples into
//! [`DecodedFrame`]s. [`FfmpegBackend`] is the default backend; tests and
//! embedders can plug in their own.
//!
//! [`DecoderAdapter::spawn`] owns the decoder for the lifetime of a run. The
//! decoder lives on a dedicated blocking thread; samples reach it through a
//! [`SampleSubmitter`] and frames come back over a bounded channel. Shutting
//! the adapter down releases the decoder exactly once, after at most the
//! decode call already in progress.

mod ffmpeg;
#[cfg(feature = "hardware")]
mod hardware;

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ffmpeg_next::frame::Video as VideoFrame;
use image::DynamicImage;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    conversion::video_frame_to_image,
    coordinator::Coordinator,
    demux::{SampleRecord, TrackDescriptor},
    error::ExtractError,
    progress::CancellationToken,
};

pub use ffmpeg::{FfmpegBackend, FfmpegLogLevel, get_ffmpeg_log_level, set_ffmpeg_log_level};
#[cfg(feature = "hardware")]
pub use hardware::{HardwareAccelerationMode, HardwareDeviceType, available_hardware_devices};

/// Pixel storage of a decoded frame.
pub enum Picture {
    /// A frame still in FFmpeg's memory, converted on demand.
    Native(VideoFrame),
    /// An already converted image.
    Image(DynamicImage),
}

/// One decoded picture.
pub struct DecodedFrame {
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    picture: Picture,
}

impl DecodedFrame {
    /// Wrap an already converted image.
    pub fn from_image(timestamp: i64, image: DynamicImage) -> Self {
        Self {
            timestamp,
            width: image.width(),
            height: image.height(),
            picture: Picture::Image(image),
        }
    }

    pub(crate) fn from_native(timestamp: i64, frame: VideoFrame) -> Self {
        Self {
            timestamp,
            width: frame.width(),
            height: frame.height(),
            picture: Picture::Native(frame),
        }
    }

    /// Timestamp in seconds.
    pub fn timestamp_seconds(&self) -> f64 {
        self.timestamp as f64 / 1_000_000.0
    }

    /// The underlying picture.
    pub fn picture(&self) -> &Picture {
        &self.picture
    }

    /// Convert to an [`image::DynamicImage`], releasing native memory.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Encode`] if the pixel format cannot be
    /// converted.
    pub fn into_image(self) -> Result<DynamicImage, ExtractError> {
        match self.picture {
            Picture::Image(image) => Ok(image),
            Picture::Native(frame) => video_frame_to_image(&frame),
        }
    }
}

impl Debug for DecodedFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let kind = match self.picture {
            Picture::Native(_) => "native",
            Picture::Image(_) => "image",
        };
        f.debug_struct("DecodedFrame")
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("picture", &kind)
            .finish()
    }
}

/// A stateful decoder for one track.
///
/// Calls arrive in decode order from a single thread. A decoder may return
/// zero or more frames per sample; [`flush`](Self::flush) drains whatever
/// it still holds once the stream ends.
pub trait FrameDecoder: Send {
    /// Decode one sample.
    fn decode(&mut self, sample: &SampleRecord) -> Result<Vec<DecodedFrame>, ExtractError>;

    /// Drain buffered frames at end of stream.
    fn flush(&mut self) -> Result<Vec<DecodedFrame>, ExtractError>;
}

/// Factory for [`FrameDecoder`]s.
pub trait DecoderBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Open a decoder for `track`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::DecoderConfig`] if the codec or its
    /// configuration is unsupported.
    fn open(&self, track: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, ExtractError>;
}

enum Command {
    Decode(SampleRecord),
    Flush,
    Halt,
}

/// Output of the decoder thread.
pub type DecoderOutput = mpsc::Receiver<Result<DecodedFrame, ExtractError>>;

/// Owner of a run's decoder thread.
pub struct DecoderAdapter {
    commands: mpsc::UnboundedSender<Command>,
    halt: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Handle for feeding samples to the decoder.
#[derive(Clone)]
pub struct SampleSubmitter {
    commands: mpsc::UnboundedSender<Command>,
    coordinator: Coordinator,
}

impl DecoderAdapter {
    /// Open a decoder for `track` on a blocking thread.
    ///
    /// Returns the adapter, a submitter for samples, and a channel of at
    /// most `capacity` undelivered frames. Errors, including a failure to
    /// open the decoder, arrive on the channel and end it.
    pub fn spawn(
        backend: Arc<dyn DecoderBackend>,
        track: TrackDescriptor,
        coordinator: Coordinator,
        token: CancellationToken,
        capacity: usize,
    ) -> (Self, SampleSubmitter, DecoderOutput) {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (output_sender, output_receiver) = mpsc::channel(capacity.max(1));
        let halt = Arc::new(AtomicBool::new(false));

        let worker = DecodeWorker {
            commands: command_receiver,
            output: output_sender,
            coordinator: coordinator.clone(),
            halt: Arc::clone(&halt),
            token,
        };
        let handle = tokio::task::spawn_blocking(move || worker.run(backend.as_ref(), &track));

        let submitter = SampleSubmitter {
            commands: command_sender.clone(),
            coordinator,
        };
        let adapter = Self {
            commands: command_sender,
            halt,
            handle: Some(handle),
        };
        (adapter, submitter, output_receiver)
    }

    /// Stop decoding, discard queued samples, and wait for the decoder to
    /// be released.
    ///
    /// The frame receiver should be dropped first; a decoder thread blocked
    /// on a full output channel only notices the halt once it is.
    pub async fn shutdown(mut self) {
        self.request_halt();
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                log::warn!("Decoder thread ended abnormally: {error}");
            }
        }
    }

    fn request_halt(&self) {
        self.halt.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Halt);
    }
}

impl Drop for DecoderAdapter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_halt();
        }
    }
}

impl SampleSubmitter {
    /// Queue `sample` once the decoder queue has room.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::DecoderRuntime`] if the decoder has stopped.
    pub async fn submit(&self, sample: SampleRecord) -> Result<(), ExtractError> {
        self.coordinator.decoder_capacity().await;
        self.coordinator.sample_submitted();
        self.commands
            .send(Command::Decode(sample))
            .map_err(|_| ExtractError::DecoderRuntime("decoder is no longer running".to_string()))
    }

    /// Signal end of stream. The decoder drains and closes its output.
    pub fn finish(&self) -> Result<(), ExtractError> {
        self.commands
            .send(Command::Flush)
            .map_err(|_| ExtractError::DecoderRuntime("decoder is no longer running".to_string()))
    }
}

struct DecodeWorker {
    commands: mpsc::UnboundedReceiver<Command>,
    output: mpsc::Sender<Result<DecodedFrame, ExtractError>>,
    coordinator: Coordinator,
    halt: Arc<AtomicBool>,
    token: CancellationToken,
}

impl DecodeWorker {
    fn stopping(&self) -> bool {
        self.halt.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    fn run(mut self, backend: &dyn DecoderBackend, track: &TrackDescriptor) {
        let mut decoder = match backend.open(track) {
            Ok(decoder) => decoder,
            Err(error) => {
                let _ = self.output.blocking_send(Err(error));
                return;
            }
        };
        log::debug!(
            "Opened {} decoder for {} ({}x{})",
            backend.name(),
            track.codec_string,
            track.width,
            track.height
        );

        let mut decoded = 0u64;
        while let Some(command) = self.commands.blocking_recv() {
            if self.stopping() {
                break;
            }
            let (result, last) = match command {
                Command::Decode(sample) => {
                    let result = decoder.decode(&sample);
                    self.coordinator.sample_decoded();
                    (result, false)
                }
                Command::Flush => (decoder.flush(), true),
                Command::Halt => break,
            };

            match result {
                Ok(frames) => {
                    decoded += frames.len() as u64;
                    if !self.deliver(frames) {
                        break;
                    }
                }
                Err(error) => {
                    let _ = self.output.blocking_send(Err(error));
                    break;
                }
            }
            if last {
                break;
            }
        }

        // Samples still queued are dropped with the receiver.
        drop(decoder);
        log::debug!("Released {} decoder after {decoded} frames", backend.name());
    }

    /// Returns `false` once the run no longer wants frames.
    fn deliver(&self, frames: Vec<DecodedFrame>) -> bool {
        for frame in frames {
            if self.stopping() || self.output.blocking_send(Ok(frame)).is_err() {
                return false;
            }
        }
        true
    }
}
