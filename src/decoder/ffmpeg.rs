//! FFmpeg-backed decoding.
//!
//! FFmpeg only decodes here; container parsing is done by
//! [`Demuxer`](crate::Demuxer). Samples are handed over as packets whose
//! timestamps are already in microseconds, and the decoder configuration
//! record from the sample description becomes the codec's extradata.

use std::fmt::{Display, Formatter, Result as FmtResult};

use ffmpeg_next::{
    Packet,
    codec::{Id as CodecId, context::Context as CodecContext},
    decoder::Video as VideoDecoder,
    frame::Video as VideoFrame,
    packet::Flags as PacketFlags,
    util::log::Level,
};
use ffmpeg_sys_next::{AV_INPUT_BUFFER_PADDING_SIZE, AVRational};

#[cfg(feature = "hardware")]
use super::hardware::{self, HardwareAccelerationMode};
use super::{DecodedFrame, DecoderBackend, FrameDecoder};
use crate::{
    demux::{SampleRecord, TrackDescriptor, VideoCodec},
    error::ExtractError,
};

const MICROSECONDS: AVRational = AVRational {
    num: 1,
    den: 1_000_000,
};

/// Verbosity of FFmpeg's own stderr logging.
///
/// This is separate from the `log` records this crate emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfmpegLogLevel {
    /// Print nothing.
    Quiet,
    /// Unrecoverable errors only.
    Fatal,
    /// Recoverable errors.
    Error,
    /// Warnings (FFmpeg's default).
    Warning,
    /// Informational messages.
    Info,
    /// Debugging output.
    Debug,
}

impl FfmpegLogLevel {
    fn to_ffmpeg(self) -> Level {
        match self {
            FfmpegLogLevel::Quiet => Level::Quiet,
            FfmpegLogLevel::Fatal => Level::Fatal,
            FfmpegLogLevel::Error => Level::Error,
            FfmpegLogLevel::Warning => Level::Warning,
            FfmpegLogLevel::Info => Level::Info,
            FfmpegLogLevel::Debug => Level::Debug,
        }
    }

    fn from_ffmpeg(level: Level) -> Self {
        match level {
            Level::Quiet => FfmpegLogLevel::Quiet,
            Level::Panic | Level::Fatal => FfmpegLogLevel::Fatal,
            Level::Error => FfmpegLogLevel::Error,
            Level::Warning => FfmpegLogLevel::Warning,
            Level::Info | Level::Verbose => FfmpegLogLevel::Info,
            Level::Debug | Level::Trace => FfmpegLogLevel::Debug,
        }
    }
}

/// Set FFmpeg's stderr verbosity.
///
/// ```no_run
/// stillcut::set_ffmpeg_log_level(stillcut::FfmpegLogLevel::Error);
/// ```
pub fn set_ffmpeg_log_level(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level.to_ffmpeg());
}

/// FFmpeg's current stderr verbosity, if FFmpeg reports a known level.
pub fn get_ffmpeg_log_level() -> Option<FfmpegLogLevel> {
    ffmpeg_next::util::log::get_level()
        .ok()
        .map(FfmpegLogLevel::from_ffmpeg)
}

/// [`DecoderBackend`] built on libavcodec.
///
/// Supports H.264, HEVC, VP9 and AV1 tracks, subject to the decoders
/// compiled into the linked FFmpeg.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use stillcut::{FfmpegBackend, FfmpegLogLevel, FrameExtractor};
///
/// let extractor = FrameExtractor::builder()
///     .with_backend(Arc::new(FfmpegBackend::new().with_log_level(FfmpegLogLevel::Error)))
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend {
    log_level: Option<FfmpegLogLevel>,
    #[cfg(feature = "hardware")]
    hardware: HardwareAccelerationMode,
}

impl FfmpegBackend {
    /// A software-decoding backend that leaves FFmpeg's logging alone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set FFmpeg's stderr verbosity whenever a decoder is opened.
    #[must_use]
    pub fn with_log_level(mut self, level: FfmpegLogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Choose how hardware decoding is attempted.
    #[cfg(feature = "hardware")]
    #[must_use]
    pub fn with_hardware_acceleration(mut self, mode: HardwareAccelerationMode) -> Self {
        self.hardware = mode;
        self
    }

    fn open_decoder(&self, track: &TrackDescriptor) -> Result<(VideoDecoder, bool), ExtractError> {
        #[cfg(feature = "hardware")]
        {
            let setup = hardware::open_decoder(|| codec_context(track), self.hardware)?;
            Ok((setup.decoder, setup.hardware_active))
        }
        #[cfg(not(feature = "hardware"))]
        {
            let decoder = codec_context(track)?.decoder().video().map_err(|error| {
                ExtractError::DecoderConfig(format!("cannot open decoder: {error}"))
            })?;
            Ok((decoder, false))
        }
    }
}

impl DecoderBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open(&self, track: &TrackDescriptor) -> Result<Box<dyn FrameDecoder>, ExtractError> {
        ffmpeg_next::init()
            .map_err(|error| ExtractError::DecoderConfig(format!("FFmpeg init: {error}")))?;
        if let Some(level) = self.log_level {
            set_ffmpeg_log_level(level);
        }

        let (decoder, hardware_active) = self.open_decoder(track)?;

        Ok(Box::new(FfmpegDecoder {
            decoder,
            hardware_active,
            label: track.codec_string.clone(),
        }))
    }
}

/// A configured, unopened codec context for `track`.
fn codec_context(track: &TrackDescriptor) -> Result<CodecContext, ExtractError> {
    let id = codec_id(&track.codec)?;
    let codec = ffmpeg_next::decoder::find(id).ok_or_else(|| {
        ExtractError::DecoderConfig(format!("FFmpeg was built without a {} decoder", track.codec))
    })?;

    let mut context = CodecContext::new_with_codec(codec);
    configure(&mut context, track)?;
    Ok(context)
}

fn codec_id(codec: &VideoCodec) -> Result<CodecId, ExtractError> {
    match codec {
        VideoCodec::H264 => Ok(CodecId::H264),
        VideoCodec::Hevc => Ok(CodecId::HEVC),
        VideoCodec::Vp9 => Ok(CodecId::VP9),
        VideoCodec::Av1 => Ok(CodecId::AV1),
        VideoCodec::Other(format) => Err(ExtractError::DecoderConfig(format!(
            "unsupported sample format '{format}'"
        ))),
    }
}

/// Copy dimensions, time base and the configuration record into the codec
/// context before it is opened.
fn configure(context: &mut CodecContext, track: &TrackDescriptor) -> Result<(), ExtractError> {
    let config = &track.codec_config;
    let size = i32::try_from(config.len())
        .map_err(|_| ExtractError::DecoderConfig("codec configuration is too large".to_string()))?;

    unsafe {
        let raw = context.as_mut_ptr();
        (*raw).width = track.width as i32;
        (*raw).height = track.height as i32;
        (*raw).time_base = MICROSECONDS;
        (*raw).pkt_timebase = MICROSECONDS;

        if !config.is_empty() {
            // Freed by FFmpeg together with the context.
            let extradata = ffmpeg_sys_next::av_mallocz(
                config.len() + AV_INPUT_BUFFER_PADDING_SIZE as usize,
            ) as *mut u8;
            if extradata.is_null() {
                return Err(ExtractError::DecoderConfig(
                    "cannot allocate codec extradata".to_string(),
                ));
            }
            std::ptr::copy_nonoverlapping(config.as_ptr(), extradata, config.len());
            (*raw).extradata = extradata;
            (*raw).extradata_size = size;
        }
    }
    Ok(())
}

struct FfmpegDecoder {
    decoder: VideoDecoder,
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    hardware_active: bool,
    label: String,
}

impl FfmpegDecoder {
    fn receive(&mut self) -> Vec<DecodedFrame> {
        let mut frames = Vec::new();
        loop {
            let mut frame = VideoFrame::empty();
            if self.decoder.receive_frame(&mut frame).is_err() {
                break;
            }
            let frame = self.to_system_memory(frame);
            let timestamp = frame.timestamp().or(frame.pts()).unwrap_or(0);
            frames.push(DecodedFrame::from_native(timestamp, frame));
        }
        frames
    }

    #[cfg(feature = "hardware")]
    fn to_system_memory(&self, frame: VideoFrame) -> VideoFrame {
        if !self.hardware_active {
            return frame;
        }
        hardware::transfer_hardware_frame(&frame).unwrap_or(frame)
    }

    #[cfg(not(feature = "hardware"))]
    fn to_system_memory(&self, frame: VideoFrame) -> VideoFrame {
        frame
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn decode(&mut self, sample: &SampleRecord) -> Result<Vec<DecodedFrame>, ExtractError> {
        let mut packet = Packet::copy(sample.data.as_bytes());
        packet.set_pts(Some(sample.presentation_timestamp));
        packet.set_dts(Some(sample.decode_timestamp));
        packet.set_duration(i64::try_from(sample.duration).unwrap_or(i64::MAX));
        if sample.is_key {
            packet.set_flags(PacketFlags::KEY);
        }

        self.decoder.send_packet(&packet).map_err(|error| {
            ExtractError::DecoderRuntime(format!(
                "{} sample {}: {error}",
                self.label, sample.number
            ))
        })?;
        Ok(self.receive())
    }

    fn flush(&mut self) -> Result<Vec<DecodedFrame>, ExtractError> {
        self.decoder.send_eof().map_err(|error| {
            ExtractError::DecoderRuntime(format!("{} flush: {error}", self.label))
        })?;
        Ok(self.receive())
    }
}

impl Display for FfmpegLogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            FfmpegLogLevel::Quiet => "quiet",
            FfmpegLogLevel::Fatal => "fatal",
            FfmpegLogLevel::Error => "error",
            FfmpegLogLevel::Warning => "warning",
            FfmpegLogLevel::Info => "info",
            FfmpegLogLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}
