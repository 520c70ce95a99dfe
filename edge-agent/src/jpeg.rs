//! YUV 4:2:0 → JPEG conversion used by the feeder's degradation path
//! (§4.5.3) and by the ingester (§4.8) to attach a still to an upload.
//!
//! The color math (BT.601, full range) follows the same coefficients the
//! corpus's own NV12/I420 ⇄ RGB conversion uses; only the pixel-format
//! dispatch is new, since this crate targets the plain `image` crate rather
//! than a bespoke frame-buffer abstraction.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

use protocol::PixelFormat;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("buffer length {got} does not match the {expected} bytes {width}x{height} {format:?} requires")]
    WrongBufferLength {
        got: usize,
        expected: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
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

/// Converts a raw NV12 or I420 4:2:0 buffer to an interleaved RGB8 image.
pub fn yuv420_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>, Error> {
    let expected = format.byte_len(width, height);
    if data.len() != expected {
        return Err(Error::WrongBufferLength {
            got: data.len(),
            expected,
            width,
            height,
            format,
        });
    }

    let w = width as usize;
    let h = height as usize;
    let y_plane = &data[..w * h];
    let chroma = &data[w * h..];

    let mut out = ImageBuffer::new(width, height);
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
            out.put_pixel(col as u32, row as u32, Rgb(yuv_to_rgb(y, u, v)));
        }
    }
    Ok(out)
}

/// Encodes a raw NV12/I420 buffer directly to JPEG bytes at the given
/// quality (0-100). Used both by the feeder when degrading to JPEG and by
/// the ingester when attaching a still to an upload.
pub fn yuv420_to_jpeg(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
) -> Result<Vec<u8>, Error> {
    let rgb = yuv420_to_rgb(data, width, height, format)?;
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&rgb)?;
    Ok(out)
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
    fn rejects_wrong_buffer_length() {
        let err = yuv420_to_rgb(&[0u8; 4], 4, 4, PixelFormat::Nv12).unwrap_err();
        assert!(matches!(err, Error::WrongBufferLength { .. }));
    }

    #[test]
    fn converts_solid_gray_nv12_frame() {
        let buf = solid_nv12(4, 4, 128, 128, 128);
        let rgb = yuv420_to_rgb(&buf, 4, 4, PixelFormat::Nv12).unwrap();
        let px = rgb.get_pixel(0, 0);
        assert!((px[0] as i32 - 128).abs() <= 1);
        assert!((px[1] as i32 - 128).abs() <= 1);
        assert!((px[2] as i32 - 128).abs() <= 1);
    }

    #[test]
    fn encodes_to_nonempty_jpeg() {
        let buf = solid_nv12(16, 16, 200, 128, 128);
        let jpeg = yuv420_to_jpeg(&buf, 16, 16, PixelFormat::Nv12, 85).unwrap();
        assert!(!jpeg.is_empty());
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn i420_and_nv12_of_same_scene_agree_closely() {
        let nv12 = solid_nv12(4, 4, 100, 90, 160);
        let w = 4usize;
        let h = 4usize;
        let mut i420 = vec![100u8; w * h];
        i420.extend(std::iter::repeat(90u8).take((w / 2) * (h / 2)));
        i420.extend(std::iter::repeat(160u8).take((w / 2) * (h / 2)));

        let rgb_nv12 = yuv420_to_rgb(&nv12, 4, 4, PixelFormat::Nv12).unwrap();
        let rgb_i420 = yuv420_to_rgb(&i420, 4, 4, PixelFormat::I420).unwrap();
        assert_eq!(rgb_nv12.get_pixel(0, 0), rgb_i420.get_pixel(0, 0));
    }
}
