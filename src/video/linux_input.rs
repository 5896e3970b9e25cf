//! Linux camera driver using Video4Linux2
//!
//! Uses the v4l crate for capture. `V4l2Mmap` and `V4l2UserPtr` negotiate
//! MJPEG first and fall back to YUYV; `Auto` keeps whatever pixel format the
//! device is already configured for and streams through mmap buffers.

#![cfg(target_os = "linux")]

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::io::{mmap, userptr};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use super::device::{Backend, CameraDriver};
use super::{now_ns, PixelFormat, VideoFrame};
use crate::config::{DeviceConfig, Resolution};

/// Driver buffers queued per stream
const BUFFER_COUNT: u32 = 4;
/// Upper bound on one blocking dequeue
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Encoding of the buffers the device hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Mjpeg,
    Yuyv,
    Rgb24,
}

impl Encoding {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Encoding::Mjpeg),
            b"YUYV" => Some(Encoding::Yuyv),
            b"RGB3" => Some(Encoding::Rgb24),
            _ => None,
        }
    }
}

enum Stream {
    Mmap(mmap::Stream<'static>),
    UserPtr(userptr::Stream),
}

impl Stream {
    fn next_buffer(&mut self) -> io::Result<&[u8]> {
        match self {
            Stream::Mmap(s) => s.next().map(|(buf, _meta)| buf),
            Stream::UserPtr(s) => s.next().map(|(buf, _meta)| buf),
        }
    }
}

struct Session {
    // Stream must drop before the device it streams from
    stream: Stream,
    _device: Device,
    encoding: Encoding,
    width: u32,
    height: u32,
}

/// `CameraDriver` backed by a V4L2 capture device
pub struct V4l2Driver {
    session: Option<Session>,
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self { session: None }
    }

    fn negotiate(device: &Device, config: &DeviceConfig, backend: Backend) -> io::Result<(Encoding, u32, u32)> {
        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;

        let actual = if backend == Backend::Auto {
            device.set_format(&fmt)?
        } else {
            // Try MJPEG first (compressed, higher frame rates)
            fmt.fourcc = FourCC::new(b"MJPG");
            match device.set_format(&fmt) {
                Ok(actual) if actual.fourcc == fmt.fourcc => actual,
                _ => {
                    fmt.fourcc = FourCC::new(b"YUYV");
                    device.set_format(&fmt)?
                }
            }
        };

        let encoding = Encoding::from_fourcc(actual.fourcc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported pixel format {}", actual.fourcc),
            )
        })?;
        if actual.width != config.width || actual.height != config.height {
            log::info!(
                "camera {} negotiated {}x{} instead of {}x{}",
                config.index,
                actual.width,
                actual.height,
                config.width,
                config.height
            );
        }
        Ok((encoding, actual.width, actual.height))
    }

    fn decode(encoding: Encoding, buf: &[u8], width: u32, height: u32) -> Option<VideoFrame> {
        let frame = match encoding {
            Encoding::Mjpeg => {
                let (data, width, height) = mjpeg_to_rgba(buf)?;
                VideoFrame::new(width, height, PixelFormat::Rgba, data, now_ns())
            }
            Encoding::Yuyv => {
                let data = yuyv_to_rgba(buf, width, height)?;
                VideoFrame::new(width, height, PixelFormat::Rgba, data, now_ns())
            }
            Encoding::Rgb24 => {
                let len = (width * height * 3) as usize;
                let data = buf.get(..len)?.to_vec();
                VideoFrame::new(width, height, PixelFormat::Rgb, data, now_ns())
            }
        };
        Some(frame)
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for V4l2Driver {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn open(&mut self, config: &DeviceConfig, backend: Backend) -> io::Result<()> {
        self.release();

        let device = Device::new(config.index as usize)?;
        let (encoding, width, height) = Self::negotiate(&device, config, backend)?;
        let stream = match backend {
            Backend::Auto | Backend::V4l2Mmap => {
                let mut s = mmap::Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
                s.set_timeout(READ_TIMEOUT);
                Stream::Mmap(s)
            }
            Backend::V4l2UserPtr => {
                let mut s = userptr::Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
                s.set_timeout(READ_TIMEOUT);
                Stream::UserPtr(s)
            }
        };

        log::debug!(
            "opened /dev/video{} via {} ({:?} {}x{})",
            config.index,
            backend,
            encoding,
            width,
            height
        );
        self.session = Some(Session {
            stream,
            _device: device,
            encoding,
            width,
            height,
        });
        Ok(())
    }

    fn grab(&mut self) -> Option<VideoFrame> {
        let session = self.session.as_mut()?;
        let (encoding, width, height) = (session.encoding, session.width, session.height);
        match session.stream.next_buffer() {
            Ok(buf) => Self::decode(encoding, buf, width, height),
            Err(e) => {
                log::trace!("v4l2 dequeue failed: {}", e);
                None
            }
        }
    }

    fn release(&mut self) {
        self.session = None;
    }
}

// v4l Device is not thread-safe, but a driver is only ever used from one loop at a time
unsafe impl Send for V4l2Driver {}

/// Capture device found by `enumerate_cameras`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
    pub resolutions: Vec<String>,
}

impl CameraDevice {
    /// Label as shown in camera pickers ("Camera N")
    pub fn label(&self) -> String {
        format!("Camera {}", self.index)
    }
}

/// Probe `/dev/video0..max` for capture devices
pub fn enumerate_cameras(max: u32) -> Vec<CameraDevice> {
    let mut cameras = Vec::new();
    for index in 0..max {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        cameras.push(CameraDevice {
            index,
            name: caps.card.clone(),
            resolutions: supported_resolutions(&device)
                .into_iter()
                .map(|r| r.to_string())
                .collect(),
        });
    }
    cameras
}

/// Resolutions from the usual webcam ladder the device accepts exactly
fn supported_resolutions(device: &Device) -> Vec<Resolution> {
    const LADDER: [(u32, u32); 6] = [
        (1920, 1080),
        (1280, 720),
        (800, 600),
        (640, 480),
        (352, 288),
        (320, 240),
    ];

    let Ok(mut fmt) = device.format() else {
        return vec![Resolution::DEFAULT];
    };
    let resolutions: Vec<_> = LADDER
        .iter()
        .filter(|&&(width, height)| {
            fmt.width = width;
            fmt.height = height;
            matches!(device.set_format(&fmt), Ok(actual) if actual.width == width && actual.height == height)
        })
        .map(|&(width, height)| Resolution::new(width, height))
        .collect();

    if resolutions.is_empty() {
        vec![Resolution::DEFAULT]
    } else {
        resolutions
    }
}

/// Convert YUYV (YUY2) to RGBA. `None` if the buffer is short.
pub fn yuyv_to_rgba(yuyv: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let pixel_count = (width * height) as usize;
    let yuyv = yuyv.get(..pixel_count * 2)?;
    let mut rgba = vec![255u8; pixel_count * 4];

    for (src, dst) in yuyv.chunks_exact(4).zip(rgba.chunks_exact_mut(8)) {
        let u = src[1] as f32 - 128.0;
        let v = src[3] as f32 - 128.0;
        for (y, px) in [src[0], src[2]].into_iter().zip(dst.chunks_exact_mut(4)) {
            let y = y as f32;
            px[0] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            px[1] = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            px[2] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        }
    }

    Some(rgba)
}

/// Decode an MJPEG frame to RGBA (using image crate)
pub fn mjpeg_to_rgba(jpeg_data: &[u8]) -> Option<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory_with_format(jpeg_data, image::ImageFormat::Jpeg).ok()?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Some((rgba.into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_starts_closed() {
        let mut driver = V4l2Driver::new();
        assert_eq!(driver.name(), "v4l2");
        assert!(driver.grab().is_none());
        driver.release();
    }

    #[test]
    fn test_enumerate_cameras() {
        // Empty in CI without video devices; only ensure it doesn't panic
        let cameras = enumerate_cameras(16);
        for camera in cameras {
            assert!(!camera.resolutions.is_empty());
        }
    }

    #[test]
    fn test_yuyv_to_rgba() {
        // Two gray pixels
        let yuyv = [128, 128, 128, 128];
        let rgba = yuyv_to_rgba(&yuyv, 2, 1).unwrap();
        assert_eq!(rgba, vec![128, 128, 128, 255, 128, 128, 128, 255]);
    }

    #[test]
    fn test_yuyv_short_buffer_is_rejected() {
        assert!(yuyv_to_rgba(&[128, 128], 2, 1).is_none());
    }

    #[test]
    fn test_mjpeg_to_rgba() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([200, 200, 200]));
        let mut jpeg = Vec::new();
        img.write_to(&mut io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let (rgba, width, height) = mjpeg_to_rgba(&jpeg).unwrap();
        assert_eq!((width, height), (8, 4));
        assert_eq!(rgba.len(), 8 * 4 * 4);
        assert!(mjpeg_to_rgba(b"not a jpeg").is_none());
    }

    #[test]
    fn test_rgb24_decode_uses_rgb_layout() {
        let buf = vec![10u8; 2 * 2 * 3];
        let frame = V4l2Driver::decode(Encoding::Rgb24, &buf, 2, 2).unwrap();
        assert_eq!(frame.pixel_format, PixelFormat::Rgb);
        assert!(frame.is_valid());
    }
}
