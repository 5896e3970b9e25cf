//! Debug overlay
//!
//! Draws the latest face rectangle and a status bar onto a copy of the
//! captured frame. Only frames handed to `on_frame` are touched, never the
//! buffered original.

use super::{CameraStatus, PixelFormat, Region, VideoFrame, VisionInfo};

/// Outline thickness in pixels
const LINE_WIDTH: u32 = 2;
/// Status bar height in pixels
const BAR_HEIGHT: u32 = 4;

const GREEN: [u8; 3] = [0, 255, 0];
const AMBER: [u8; 3] = [255, 191, 0];
const RED: [u8; 3] = [255, 0, 0];
const GRAY: [u8; 3] = [128, 128, 128];

fn status_color(status: CameraStatus) -> [u8; 3] {
    match status {
        CameraStatus::Running => GREEN,
        CameraStatus::Recovering => AMBER,
        CameraStatus::Error => RED,
        CameraStatus::Initialized | CameraStatus::Stopped => GRAY,
    }
}

/// Draw the overlay for `info` onto `frame` in place
pub fn draw_debug_overlay(frame: &mut VideoFrame, info: &VisionInfo) {
    if !frame.is_valid() {
        return;
    }
    fill_rect(frame, 0, 0, frame.width, BAR_HEIGHT.min(frame.height), status_color(info.camera_status));
    if let Some(region) = info.face_region.filter(|_| info.face_detected) {
        outline_rect(frame, region, GREEN);
    }
}

fn outline_rect(frame: &mut VideoFrame, r: Region, rgb: [u8; 3]) {
    let t = LINE_WIDTH.min(r.width).min(r.height);
    fill_rect(frame, r.x, r.y, r.width, t, rgb);
    fill_rect(frame, r.x, (r.y + r.height).saturating_sub(t), r.width, t, rgb);
    fill_rect(frame, r.x, r.y, t, r.height, rgb);
    fill_rect(frame, (r.x + r.width).saturating_sub(t), r.y, t, r.height, rgb);
}

fn fill_rect(frame: &mut VideoFrame, x: u32, y: u32, w: u32, h: u32, rgb: [u8; 3]) {
    let x1 = (x + w).min(frame.width);
    let y1 = (y + h).min(frame.height);
    for py in y.min(y1)..y1 {
        for px in x.min(x1)..x1 {
            put_pixel(frame, px, py, rgb);
        }
    }
}

fn put_pixel(frame: &mut VideoFrame, x: u32, y: u32, [r, g, b]: [u8; 3]) {
    let bpp = frame.pixel_format.bytes_per_pixel();
    let i = (y as usize * frame.width as usize + x as usize) * bpp;
    let px = &mut frame.data[i..i + bpp];
    match frame.pixel_format {
        PixelFormat::Rgba => px[..3].copy_from_slice(&[r, g, b]),
        PixelFormat::Bgra => px[..3].copy_from_slice(&[b, g, r]),
        PixelFormat::Rgb => px.copy_from_slice(&[r, g, b]),
        PixelFormat::Gray => px[0] = ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8,
    }
}
