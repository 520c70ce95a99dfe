//! Frame decode, §4.10 step 1: `(codec, pixel_format) → model input`.
//!
//! The BT.601 YUV→RGB math mirrors `edge-agent::jpeg`'s conversion (same
//! coefficients, same plane layouts); it is duplicated here rather than
//! shared because the two crates decode in opposite directions and neither
//! is a dependency of the other, same as each `ci2-*` backend crate carries
//! its own pixel-format conversion rather than a shared helper crate.

use image::GenericImageView;

use protocol::{Codec, Frame, PixelFormat};

use crate::error::{Error, Result};

/// An RGB8 buffer ready to hand to an [`crate::model::InferenceSession`].
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;
    let r = y + (91_881 * v >> 16);
    let g = y - ((22_554 * u + 46_802 * v) >> 16);
    let b = y + (116_130 * u >> 16);
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn decode_raw(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<DecodedImage> {
    let expected = format.byte_len(width, height);
    if data.len() != expected {
        return Err(Error::Decode(format!(
            "raw buffer is {} bytes, expected {} for {}x{} {:?}",
            data.len(),
            expected,
            width,
            height,
            format
        )));
    }

    let w = width as usize;
    let h = height as usize;
    let y_plane = &data[..w * h];
    let chroma = &data[w * h..];

    let mut rgb = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col];
            let chroma_row = row / 2;
            let chroma_col = col / 2;
            let (u, v) = match format {
                PixelFormat::Nv12 => {
                    let idx = chroma_row * w + chroma_col * 2;
                    (chroma[idx], chroma[idx + 1])
                }
                PixelFormat::I420 => {
                    let plane_len = (w / 2) * (h / 2);
                    let u_idx = chroma_row * (w / 2) + chroma_col;
                    (chroma[u_idx], chroma[plane_len + u_idx])
                }
            };
            let px = yuv_to_rgb(y, u, v);
            let out_idx = (row * w + col) * 3;
            rgb[out_idx..out_idx + 3].copy_from_slice(&px);
        }
    }
    Ok(DecodedImage { width, height, rgb })
}

fn decode_jpeg(data: &[u8]) -> Result<DecodedImage> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
    let (width, height) = img.dimensions();
    let rgb = img.to_rgb8().into_raw();
    Ok(DecodedImage { width, height, rgb })
}

/// Decodes a wire [`Frame`] into an RGB8 buffer. INVALID_FRAME (§4.2,
/// §4.10 step 1) is the caller's responsibility to report on `Err`.
pub fn decode_frame(frame: &Frame) -> Result<DecodedImage> {
    match frame.codec {
        Codec::Raw => decode_raw(&frame.data, frame.width, frame.height, frame.pixel_format),
        Codec::Jpeg => decode_jpeg(&frame.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_nv12(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let w = width as usize;
        let h = height as usize;
        let mut buf = vec![y; w * h];
        for _ in 0..(w / 2) * (h / 2) {
            buf.push(u);
            buf.push(v);
        }
        buf
    }

    #[test]
    fn rejects_wrong_length_raw_buffer() {
        let err = decode_raw(&[0u8; 3], 4, 4, PixelFormat::Nv12).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn decodes_solid_gray_nv12_frame() {
        let buf = solid_nv12(4, 4, 128, 128, 128);
        let decoded = decode_raw(&buf, 4, 4, PixelFormat::Nv12).unwrap();
        assert_eq!(decoded.width, 4);
        assert_eq!(decoded.height, 4);
        assert!((decoded.rgb[0] as i32 - 128).abs() <= 1);
    }

    #[test]
    fn decodes_jpeg_round_trip_from_image_crate() {
        let mut src = image::ImageBuffer::new(8, 8);
        for px in src.pixels_mut() {
            *px = image::Rgb([10u8, 20, 30]);
        }
        let dynamic = image::DynamicImage::ImageRgb8(src);
        let mut jpeg_bytes = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_bytes, 90);
        encoder.encode_image(&dynamic).unwrap();

        let decoded = decode_jpeg(&jpeg_bytes).unwrap();
        assert_eq!(decoded.width, 8);
        assert_eq!(decoded.height, 8);
    }
}
