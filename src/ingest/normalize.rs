use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, RgbImage};

use crate::frame::{Frame, PixelLayout};

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    layout: PixelLayout,
) -> Result<Vec<u8>> {
    let expected = layout.buffer_len(width, height)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            layout,
            expected,
            pixels.len()
        ));
    }
    match layout {
        PixelLayout::Rgb24 => Ok(pixels.to_vec()),
        PixelLayout::Bgr24 => {
            let mut rgb = pixels.to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelLayout::Nv12 => nv12_to_rgb(pixels, width, height),
    }
}

pub fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let expected = PixelLayout::Nv12.buffer_len(width, height)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let px = yuv_to_rgb(pixels[j * w + i], pixels[uv_index], pixels[uv_index + 1]);
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&px);
        }
    }

    Ok(rgb)
}

/// Packed RGB to NV12 with BT.601 full-range coefficients.
///
/// Chroma for each 2x2 block is the average of the four source pixels.
pub fn rgb_to_nv12(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_rgb = PixelLayout::Rgb24.buffer_len(width, height)?;
    if rgb.len() != expected_rgb {
        return Err(anyhow!(
            "RGB frame length mismatch: expected {}, got {}",
            expected_rgb,
            rgb.len()
        ));
    }
    let out_len = PixelLayout::Nv12.buffer_len(width, height)?;
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;
    let mut nv12 = vec![0u8; out_len];

    for j in 0..h {
        for i in 0..w {
            let o = (j * w + i) * 3;
            let (r, g, b) = (rgb[o] as f32, rgb[o + 1] as f32, rgb[o + 2] as f32);
            nv12[j * w + i] = clamp_to_u8(0.299 * r + 0.587 * g + 0.114 * b);
        }
    }

    for bj in (0..h).step_by(2) {
        for bi in (0..w).step_by(2) {
            let (mut u_sum, mut v_sum) = (0.0f32, 0.0f32);
            for (dj, di) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let o = ((bj + dj) * w + bi + di) * 3;
                let (r, g, b) = (rgb[o] as f32, rgb[o + 1] as f32, rgb[o + 2] as f32);
                u_sum += -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                v_sum += 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
            }
            let uv = y_plane + (bj / 2) * w + bi;
            nv12[uv] = clamp_to_u8(u_sum / 4.0);
            nv12[uv + 1] = clamp_to_u8(v_sum / 4.0);
        }
    }

    Ok(nv12)
}

/// Resize a frame to `width`x`height` packed RGB.
pub fn resize_rgb(frame: &Frame, width: u32, height: u32) -> Result<Vec<u8>> {
    let rgb = frame.to_rgb()?;
    if frame.width == width && frame.height == height {
        return Ok(rgb);
    }
    let image = RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("RGB buffer does not match frame dimensions"))?;
    Ok(imageops::resize(&image, width, height, FilterType::Triangle).into_raw())
}

/// Copy `rows` rows of `row_bytes` out of a buffer whose rows are `stride` apart.
pub fn pack_rows(data: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<Vec<u8>> {
    if stride < row_bytes {
        return Err(anyhow!("row stride {} is shorter than a row of {} bytes", stride, row_bytes));
    }
    let mut packed = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| anyhow!("buffer ends inside row {} of {}", row, rows))?;
        packed.extend_from_slice(line);
    }
    Ok(packed)
}

pub const LETTERBOX_FILL: u8 = 114;

/// Aspect-preserving resize into a `width`x`height` canvas.
///
/// The image is scaled by `min(width / fw, height / fh)` and centred; the
/// remaining border is filled with [`LETTERBOX_FILL`] grey.
pub fn letterbox_rgb(frame: &Frame, width: u32, height: u32) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(anyhow!("letterbox target must be non-zero"));
    }
    let scale = (width as f32 / frame.width as f32).min(height as f32 / frame.height as f32);
    let inner_w = ((frame.width as f32 * scale).round() as u32).clamp(1, width);
    let inner_h = ((frame.height as f32 * scale).round() as u32).clamp(1, height);
    let inner = resize_rgb(frame, inner_w, inner_h)?;

    let (w, iw) = (width as usize, inner_w as usize);
    let pad_x = (width - inner_w) as usize / 2;
    let pad_y = (height - inner_h) as usize / 2;
    let mut canvas = vec![LETTERBOX_FILL; w * height as usize * 3];
    for (row, src) in inner.chunks_exact(iw * 3).enumerate() {
        let dst = ((pad_y + row) * w + pad_x) * 3;
        canvas[dst..dst + iw * 3].copy_from_slice(src);
    }
    Ok(canvas)
}

pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let rgb = normalize_to_rgb(&nv12, 2, 2, PixelLayout::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);

        Ok(())
    }

    #[test]
    fn bgr_is_swapped_to_rgb() -> Result<()> {
        let rgb = normalize_to_rgb(&[1, 2, 3], 1, 1, PixelLayout::Bgr24)?;
        assert_eq!(rgb, vec![3, 2, 1]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        let rgb = normalize_to_rgb(&pixels, 1, 3, PixelLayout::Rgb24)?;
        assert_eq!(rgb, pixels);
        assert!(normalize_to_rgb(&pixels, 2, 3, PixelLayout::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn rgb_to_nv12_roundtrips_flat_colour() -> Result<()> {
        let rgb: Vec<u8> = [200u8, 40, 180].repeat(16);
        let nv12 = rgb_to_nv12(&rgb, 4, 4)?;
        assert_eq!(nv12.len(), 24);
        let back = nv12_to_rgb(&nv12, 4, 4)?;
        for (a, b) in back.iter().zip(rgb.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 2, "{} vs {}", a, b);
        }
        Ok(())
    }

    #[test]
    fn rgb_to_nv12_rejects_odd_dimensions() {
        let rgb = vec![0u8; 3 * 3 * 2];
        assert!(rgb_to_nv12(&rgb, 3, 2).is_err());
    }

    #[test]
    fn resize_changes_dimensions() -> Result<()> {
        let frame = Frame::solid(8, 4, [10, 20, 30], Local::now())?;
        let out = resize_rgb(&frame, 4, 4)?;
        assert_eq!(out.len(), 4 * 4 * 3);
        assert_eq!(&out[..3], &[10, 20, 30]);
        Ok(())
    }

    #[test]
    fn pack_rows_drops_stride_padding() -> Result<()> {
        // two rows of 3 bytes, each padded to 4
        let data = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(pack_rows(&data, 4, 3, 2)?, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(pack_rows(&data[..6], 3, 3, 2)?, vec![1, 2, 3, 0, 4, 5]);
        assert!(pack_rows(&data, 4, 3, 3).is_err());
        assert!(pack_rows(&data, 2, 3, 1).is_err());
        Ok(())
    }

    #[test]
    fn letterbox_centres_wide_frame_with_padding() -> Result<()> {
        // 128x64 black frame with a white block at x 40..72, y 8..40
        let mut data = vec![0u8; 128 * 64 * 3];
        for y in 8..40 {
            for x in 40..72 {
                let o = (y * 128 + x) * 3;
                data[o..o + 3].fill(255);
            }
        }
        let frame = Frame::new(data, 128, 64, PixelLayout::Bgr24, Local::now())?;

        let out = letterbox_rgb(&frame, 64, 64)?;
        assert_eq!(out.len(), 64 * 64 * 3);
        let px = |x: usize, y: usize| &out[(y * 64 + x) * 3..(y * 64 + x) * 3 + 3];
        // scale 0.5, 16 rows of padding above and below
        assert_eq!(px(0, 15), &[LETTERBOX_FILL; 3]);
        assert_eq!(px(63, 48), &[LETTERBOX_FILL; 3]);
        assert_eq!(px(0, 16), &[0, 0, 0]);
        assert_eq!(px(28, 28), &[255, 255, 255]);
        assert_eq!(px(10, 30), &[0, 0, 0]);
        Ok(())
    }

    #[test]
    fn letterbox_of_matching_aspect_is_plain_resize() -> Result<()> {
        let frame = Frame::solid(32, 32, [10, 20, 30], Local::now())?;
        assert_eq!(letterbox_rgb(&frame, 16, 16)?, resize_rgb(&frame, 16, 16)?);
        Ok(())
    }
}
