//! Per-frame overlay transforms.
//!
//! A transform rewrites one RGB24 frame in place and must leave it the
//! same size. The current production transform composites the cached
//! overlay image as a fixed watermark; landmark-anchored compositing plugs
//! in behind the same trait.

use crate::overlay::OverlayImage;

pub trait FrameTransform: Send + Sync {
    /// Apply the overlay to `frame`, a `width * height * 3` RGB24 buffer.
    fn apply(&self, frame: &mut [u8], width: u32, height: u32, overlay: &OverlayImage, opacity: f32);
}

/// Composites the overlay at a fixed anchor in the bottom-right corner,
/// scaled to at most a quarter of the frame width.
pub struct Watermark {
    pub margin: u32,
}

impl Watermark {
    pub fn new() -> Self {
        Self { margin: 16 }
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTransform for Watermark {
    fn apply(
        &self,
        frame: &mut [u8],
        width: u32,
        height: u32,
        overlay: &OverlayImage,
        opacity: f32,
    ) {
        if overlay.width == 0 || overlay.height == 0 || width == 0 || height == 0 {
            return;
        }
        debug_assert_eq!(frame.len(), width as usize * height as usize * 3);

        let opacity = opacity.clamp(0.0, 1.0);
        if opacity == 0.0 {
            return;
        }

        // Scale the overlay down to a quarter of the frame width, keeping
        // aspect ratio. Never upscale.
        let target_w = (width / 4).max(1).min(overlay.width);
        let target_h =
            ((overlay.height as u64 * target_w as u64) / overlay.width as u64).max(1) as u32;

        let origin_x = width.saturating_sub(target_w + self.margin);
        let origin_y = height.saturating_sub(target_h + self.margin);

        for oy in 0..target_h {
            let fy = origin_y + oy;
            if fy >= height {
                break;
            }
            // Nearest-neighbour sample row in the overlay.
            let sy = (oy as u64 * overlay.height as u64 / target_h as u64) as u32;
            for ox in 0..target_w {
                let fx = origin_x + ox;
                if fx >= width {
                    break;
                }
                let sx = (ox as u64 * overlay.width as u64 / target_w as u64) as u32;

                let src = ((sy * overlay.width + sx) * 4) as usize;
                let alpha = overlay.rgba[src + 3] as f32 / 255.0 * opacity;
                if alpha <= 0.0 {
                    continue;
                }

                let dst = ((fy * width + fx) * 3) as usize;
                for channel in 0..3 {
                    let over = overlay.rgba[src + channel] as f32;
                    let under = frame[dst + channel] as f32;
                    frame[dst + channel] = (over * alpha + under * (1.0 - alpha)).round() as u8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_overlay(width: u32, height: u32, rgba: [u8; 4]) -> OverlayImage {
        OverlayImage {
            width,
            height,
            rgba: rgba
                .iter()
                .copied()
                .cycle()
                .take((width * height * 4) as usize)
                .collect(),
        }
    }

    #[test]
    fn zero_opacity_is_identity() {
        let overlay = solid_overlay(8, 8, [255, 0, 0, 255]);
        let mut frame = vec![10u8; 64 * 48 * 3];
        let expected = frame.clone();
        Watermark::new().apply(&mut frame, 64, 48, &overlay, 0.0);
        assert_eq!(frame, expected);
    }

    #[test]
    fn opaque_overlay_replaces_anchor_pixels() {
        let overlay = solid_overlay(8, 8, [255, 0, 0, 255]);
        let (w, h) = (64u32, 48u32);
        let mut frame = vec![0u8; (w * h * 3) as usize];
        Watermark { margin: 0 }.apply(&mut frame, w, h, &overlay, 1.0);

        // Bottom-right 16x16 block carries the red overlay.
        let px = ((h - 1) * w + (w - 1)) as usize * 3;
        assert_eq!(&frame[px..px + 3], &[255, 0, 0]);

        // Top-left corner untouched.
        assert_eq!(&frame[0..3], &[0, 0, 0]);
    }

    #[test]
    fn half_opacity_blends() {
        let overlay = solid_overlay(4, 4, [200, 0, 0, 255]);
        let (w, h) = (64u32, 48u32);
        let mut frame = vec![100u8; (w * h * 3) as usize];
        Watermark { margin: 0 }.apply(&mut frame, w, h, &overlay, 0.5);

        let px = ((h - 1) * w + (w - 1)) as usize * 3;
        assert_eq!(frame[px], 150); // 200 * 0.5 + 100 * 0.5
        assert_eq!(frame[px + 1], 50); // 0 * 0.5 + 100 * 0.5
    }

    #[test]
    fn frame_size_is_preserved() {
        let overlay = solid_overlay(32, 32, [0, 255, 0, 128]);
        let (w, h) = (320u32, 240u32);
        let mut frame = vec![0u8; (w * h * 3) as usize];
        Watermark::new().apply(&mut frame, w, h, &overlay, 0.7);
        assert_eq!(frame.len(), (w * h * 3) as usize);
    }

    #[test]
    fn transparent_pixels_leave_frame_untouched() {
        let overlay = solid_overlay(8, 8, [255, 255, 255, 0]);
        let (w, h) = (64u32, 48u32);
        let mut frame = vec![42u8; (w * h * 3) as usize];
        let expected = frame.clone();
        Watermark { margin: 0 }.apply(&mut frame, w, h, &overlay, 1.0);
        assert_eq!(frame, expected);
    }
}
