//! Capture devices.
//!
//! A `CaptureDevice` exposes exactly three operations: acquire the handle,
//! read one frame, release the handle. Reconnection policy lives in
//! `CameraSource`, never here.
//!
//! Backends:
//! - `stub://` URLs: synthetic frames, with optional injected failures
//! - `rtsp://` and friends: GStreamer decode (feature: camera-gstreamer)

use anyhow::{anyhow, Result};
#[cfg(feature = "camera-gstreamer")]
use anyhow::Context;
#[cfg(feature = "camera-gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "camera-gstreamer")]
use std::time::Duration;

use crate::frame::Frame;
use crate::now_ms;

pub trait CaptureDevice: Send {
    /// Human-readable identity for logs (URL, device path).
    fn describe(&self) -> String;

    /// Acquire the device handle.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame from an open handle.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the handle. Safe to call when nothing is held.
    fn release(&mut self);
}

/// Configuration shared by device backends.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// e.g. "rtsp://192.168.1.100:554/stream" or "stub://doorway"
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            url: "stub://doorway".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Pick a backend from the URL scheme.
pub fn device_from_config(config: &DeviceConfig) -> Result<Box<dyn CaptureDevice>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevice::from_config(config)?));
    }
    #[cfg(feature = "camera-gstreamer")]
    {
        Ok(Box::new(GstreamerDevice::new(config.clone())))
    }
    #[cfg(not(feature = "camera-gstreamer"))]
    {
        Err(anyhow!(
            "camera url '{}' requires the camera-gstreamer feature",
            config.url
        ))
    }
}

// ----------------------------------------------------------------------------
// Synthetic device (stub://)
// ----------------------------------------------------------------------------

/// Generates moving-gradient frames.
///
/// Query parameters inject faults for demos and soak tests:
/// `stub://doorway?fail_opens=2&fail_every=500` fails the first two opens and
/// every 500th read.
pub struct SyntheticDevice {
    url: String,
    width: u32,
    height: u32,
    fail_opens: u32,
    fail_every: Option<u64>,
    open: bool,
    frame_count: u64,
}

impl SyntheticDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            url: "stub://synthetic".to_string(),
            width,
            height,
            fail_opens: 0,
            fail_every: None,
            open: false,
            frame_count: 0,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let mut device = Self::new(config.width, config.height);
        device.url = config.url.clone();
        if let Some((_, query)) = config.url.split_once('?') {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
                match key {
                    "fail_opens" => {
                        device.fail_opens = value
                            .parse()
                            .map_err(|_| anyhow!("fail_opens must be an integer"))?;
                    }
                    "fail_every" => {
                        let every: u64 = value
                            .parse()
                            .map_err(|_| anyhow!("fail_every must be an integer"))?;
                        device.fail_every = (every > 0).then_some(every);
                    }
                    other => return Err(anyhow!("unknown stub parameter '{}'", other)),
                }
            }
        }
        Ok(device)
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];
        let shift = self.frame_count;
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = (i as u64) % self.width as u64;
            let y = (i as u64) / self.width as u64;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = 96;
        }
        pixels
    }
}

impl CaptureDevice for SyntheticDevice {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(anyhow!("{}: synthetic open failure", self.url));
        }
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("{}: device not open", self.url));
        }
        self.frame_count += 1;
        if let Some(every) = self.fail_every {
            if self.frame_count.is_multiple_of(every) {
                return Err(anyhow!("{}: synthetic read failure", self.url));
            }
        }
        Frame::new(
            self.generate_pixels(),
            self.width,
            self.height,
            self.frame_count,
            now_ms()?,
        )
    }

    fn release(&mut self) {
        self.open = false;
    }
}

// ----------------------------------------------------------------------------
// GStreamer device
// ----------------------------------------------------------------------------

#[cfg(feature = "camera-gstreamer")]
pub struct GstreamerDevice {
    config: DeviceConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
}

#[cfg(feature = "camera-gstreamer")]
impl GstreamerDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            pipeline: None,
            frame_count: 0,
        }
    }

    fn build_pipeline(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        gstreamer::init().context("initialize gstreamer")?;

        let source = if self.config.url.starts_with("/dev/") {
            format!("v4l2src device={}", self.config.url)
        } else {
            format!("uridecodebin uri={}", self.config.url)
        };
        let description = format!(
            "{} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source, self.config.width, self.config.height
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        Ok((pipeline, appsink))
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = (1000 / self.config.target_fps.max(1)).saturating_mul(4);
        let timeout = Duration::from_millis(base_ms.max(500) as u64);
        gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64)
    }
}

#[cfg(feature = "camera-gstreamer")]
impl CaptureDevice for GstreamerDevice {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        self.release();
        let (pipeline, appsink) = self.build_pipeline()?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        self.pipeline = Some((pipeline, appsink));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let timeout = self.frame_timeout();
        let (_, appsink) = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("{}: device not open", self.config.url))?;
        let sample = appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("{}: stream stalled", self.config.url))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::new(pixels, width, height, self.frame_count, now_ms()?)
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("{}: failed to stop pipeline: {}", self.config.url, err);
            }
        }
    }
}

#[cfg(feature = "camera-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(url: &str) -> Result<SyntheticDevice> {
        SyntheticDevice::from_config(&DeviceConfig {
            url: url.to_string(),
            target_fps: 10,
            width: 32,
            height: 24,
        })
    }

    #[test]
    fn synthetic_device_produces_frames_after_open() -> Result<()> {
        let mut device = stub("stub://test")?;
        assert!(device.read_frame().is_err());
        device.open()?;
        let frame = device.read_frame()?;
        assert_eq!((frame.width, frame.height, frame.seq), (32, 24, 1));
        device.release();
        assert!(device.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn synthetic_device_injects_open_failures() -> Result<()> {
        let mut device = stub("stub://test?fail_opens=2")?;
        assert!(device.open().is_err());
        assert!(device.open().is_err());
        device.open()?;
        Ok(())
    }

    #[test]
    fn synthetic_device_injects_read_failures() -> Result<()> {
        let mut device = stub("stub://test?fail_every=3")?;
        device.open()?;
        assert!(device.read_frame().is_ok());
        assert!(device.read_frame().is_ok());
        assert!(device.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn unknown_stub_parameter_is_rejected() {
        assert!(stub("stub://test?explode=1").is_err());
    }

    #[cfg(not(feature = "camera-gstreamer"))]
    #[test]
    fn non_stub_url_requires_feature() {
        let config = DeviceConfig {
            url: "rtsp://camera/stream".to_string(),
            ..DeviceConfig::default()
        };
        assert!(device_from_config(&config).is_err());
    }
}
