//! Pixel conversion from FFmpeg frames to [`image`] buffers.

use ffmpeg_next::{
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::{DynamicImage, RgbImage};

use crate::error::ExtractError;

/// Copy plane 0 of `video_frame` into a tightly packed buffer, dropping any
/// row padding FFmpeg added.
pub(crate) fn frame_to_buffer(
    video_frame: &VideoFrame,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let row_len = width as usize * bytes_per_pixel;
    let rows = height as usize;
    let data = video_frame.data(0);

    if stride == row_len {
        data[..row_len * rows].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_len * rows);
        for row in data.chunks(stride).take(rows) {
            buffer.extend_from_slice(&row[..row_len]);
        }
        buffer
    }
}

/// Convert a decoded frame of any pixel format to an RGB image of the same
/// size.
pub(crate) fn video_frame_to_image(frame: &VideoFrame) -> Result<DynamicImage, ExtractError> {
    let (width, height) = (frame.width(), frame.height());
    let conversion_error =
        |error: ffmpeg_next::Error| ExtractError::Encode(format!("pixel conversion: {error}"));

    let buffer = if frame.format() == Pixel::RGB24 {
        frame_to_buffer(frame, width, height, 3)
    } else {
        let mut scaler = ScalingContext::get(
            frame.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            ScalingFlags::BILINEAR,
        )
        .map_err(conversion_error)?;
        let mut rgb = VideoFrame::empty();
        scaler.run(frame, &mut rgb).map_err(conversion_error)?;
        frame_to_buffer(&rgb, width, height, 3)
    };

    RgbImage::from_raw(width, height, buffer)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| {
            ExtractError::Encode(format!("{width}x{height} frame has a short pixel buffer"))
        })
}
