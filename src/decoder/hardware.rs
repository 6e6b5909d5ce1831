//! Hardware-accelerated decoding for [`FfmpegBackend`](super::FfmpegBackend).
//!
//! Availability depends on both the FFmpeg build and the host's GPU drivers.
//! Every failure on the hardware path falls back to software decoding; only
//! a decoder that cannot be opened at all is reported.

use ffmpeg_next::{
    codec::context::Context as CodecContext, decoder::Video as VideoDecoder,
    frame::Video as VideoFrame,
};
use ffmpeg_sys_next::{
    AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX, AVBufferRef, AVCodec, AVCodecContext,
    AVHWDeviceType,
};

use crate::error::ExtractError;

/// Whether and how the FFmpeg backend attempts hardware decoding.
///
/// # Example
///
/// ```no_run
/// use stillcut::{FfmpegBackend, HardwareAccelerationMode, HardwareDeviceType};
///
/// let backend = FfmpegBackend::new()
///     .with_hardware_acceleration(HardwareAccelerationMode::Specific(HardwareDeviceType::Vaapi));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HardwareAccelerationMode {
    /// Use the first device type the codec supports, if any.
    #[default]
    Auto,
    /// Never attempt hardware decoding.
    Software,
    /// Use this device type, falling back to software if unavailable.
    Specific(HardwareDeviceType),
}

/// Hardware device families FFmpeg can decode on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareDeviceType {
    /// NVIDIA CUDA.
    Cuda,
    /// Video Acceleration API (Linux).
    Vaapi,
    /// DirectX Video Acceleration 2 (Windows).
    Dxva2,
    /// Direct3D 11 Video Acceleration (Windows).
    D3d11va,
    /// Apple VideoToolbox.
    VideoToolbox,
    /// Intel Quick Sync Video.
    Qsv,
}

impl HardwareDeviceType {
    fn to_av(self) -> AVHWDeviceType {
        match self {
            HardwareDeviceType::Cuda => AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HardwareDeviceType::Vaapi => AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HardwareDeviceType::Dxva2 => AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
            HardwareDeviceType::D3d11va => AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HardwareDeviceType::VideoToolbox => AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            HardwareDeviceType::Qsv => AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
        }
    }

    fn from_av(device_type: AVHWDeviceType) -> Option<Self> {
        match device_type {
            AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA => Some(HardwareDeviceType::Cuda),
            AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI => Some(HardwareDeviceType::Vaapi),
            AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2 => Some(HardwareDeviceType::Dxva2),
            AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA => Some(HardwareDeviceType::D3d11va),
            AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX => Some(HardwareDeviceType::VideoToolbox),
            AVHWDeviceType::AV_HWDEVICE_TYPE_QSV => Some(HardwareDeviceType::Qsv),
            _ => None,
        }
    }
}

/// Device types compiled into the linked FFmpeg.
pub fn available_hardware_devices() -> Vec<HardwareDeviceType> {
    let mut devices = Vec::new();
    let mut device_type = AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        device_type = unsafe { ffmpeg_sys_next::av_hwdevice_iterate_types(device_type) };
        if device_type == AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        devices.extend(HardwareDeviceType::from_av(device_type));
    }
    devices
}

/// An opened decoder and whether it decodes on a hardware device.
pub(crate) struct HardwareDecoderSetup {
    pub decoder: VideoDecoder,
    pub hardware_active: bool,
}

/// Open a context from `build`, attaching a hardware device when `mode`
/// allows it.
///
/// `build` is called a second time when the decoder will not open with the
/// device attached, and that fresh context is opened in software.
pub(crate) fn open_decoder(
    build: impl Fn() -> Result<CodecContext, ExtractError>,
    mode: HardwareAccelerationMode,
) -> Result<HardwareDecoderSetup, ExtractError> {
    let codec_context = build()?;
    let device_type = match mode {
        HardwareAccelerationMode::Software => None,
        HardwareAccelerationMode::Auto => device_types(&codec_context).into_iter().next(),
        HardwareAccelerationMode::Specific(device) => device_types(&codec_context)
            .into_iter()
            .find(|candidate| *candidate == device.to_av()),
    };

    let device_context = device_type.and_then(|device_type| {
        create_device_context(device_type)
            .map_err(|reason| log::debug!("{reason}; decoding in software"))
            .ok()
    });

    let Some(mut device_context) = device_context else {
        return Ok(HardwareDecoderSetup {
            decoder: open_software(codec_context)?,
            hardware_active: false,
        });
    };

    unsafe {
        let context = codec_context.as_ptr() as *mut AVCodecContext;
        (*context).hw_device_ctx = ffmpeg_sys_next::av_buffer_ref(device_context);
    }
    let attempt = open_software(codec_context);
    // The codec context holds its own reference now.
    unsafe { ffmpeg_sys_next::av_buffer_unref(&mut device_context) };

    let (decoder, hardware_active) =
        with_software_fallback(attempt, || open_software(build()?))?;
    Ok(HardwareDecoderSetup {
        decoder,
        hardware_active,
    })
}

/// Keep a decoder opened on a device, or open one with `software` instead.
///
/// The flag is `true` when the device decoder was kept.
fn with_software_fallback<D>(
    hardware: Result<D, ExtractError>,
    software: impl FnOnce() -> Result<D, ExtractError>,
) -> Result<(D, bool), ExtractError> {
    match hardware {
        Ok(decoder) => Ok((decoder, true)),
        Err(error) => {
            log::debug!("Hardware decoder did not open ({error}); decoding in software");
            software().map(|decoder| (decoder, false))
        }
    }
}

fn open_software(codec_context: CodecContext) -> Result<VideoDecoder, ExtractError> {
    codec_context
        .decoder()
        .video()
        .map_err(|error| ExtractError::DecoderConfig(format!("cannot open decoder: {error}")))
}

/// Copy a decoded hardware surface into system memory.
///
/// Fails for frames that already live in system memory; callers keep the
/// original frame in that case.
pub(crate) fn transfer_hardware_frame(frame: &VideoFrame) -> Result<VideoFrame, ExtractError> {
    let mut software = VideoFrame::empty();
    let result = unsafe {
        ffmpeg_sys_next::av_hwframe_transfer_data(software.as_mut_ptr(), frame.as_ptr(), 0)
    };
    if result < 0 {
        return Err(ExtractError::DecoderRuntime(format!(
            "hardware frame transfer failed ({result})"
        )));
    }
    unsafe {
        (*software.as_mut_ptr()).pts = (*frame.as_ptr()).pts;
        (*software.as_mut_ptr()).best_effort_timestamp = (*frame.as_ptr()).best_effort_timestamp;
        (*software.as_mut_ptr()).pkt_dts = (*frame.as_ptr()).pkt_dts;
    }
    Ok(software)
}

/// Device types the context's codec can decode on, in FFmpeg's order.
fn device_types(codec_context: &CodecContext) -> Vec<AVHWDeviceType> {
    let codec: *const AVCodec = unsafe { (*codec_context.as_ptr()).codec };
    if codec.is_null() {
        return Vec::new();
    }

    let mut types = Vec::new();
    for index in 0.. {
        let config = unsafe { ffmpeg_sys_next::avcodec_get_hw_config(codec, index) };
        if config.is_null() {
            break;
        }
        let (methods, device_type) = unsafe { ((*config).methods, (*config).device_type) };
        if methods & (AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32) != 0
            && device_type != AVHWDeviceType::AV_HWDEVICE_TYPE_NONE
        {
            types.push(device_type);
        }
    }
    types
}

/// Returns a raw reference the caller must release with `av_buffer_unref`.
fn create_device_context(device_type: AVHWDeviceType) -> Result<*mut AVBufferRef, String> {
    let mut device_context: *mut AVBufferRef = std::ptr::null_mut();
    let result = unsafe {
        ffmpeg_sys_next::av_hwdevice_ctx_create(
            &mut device_context,
            device_type,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        )
    };
    if result < 0 {
        Err(format!("cannot create {device_type:?} device ({result})"))
    } else {
        log::debug!("Decoding on {device_type:?}");
        Ok(device_context)
    }
}
