//! Frame acquisition.
//!
//! - `device`: raw capture backends (synthetic `stub://`, GStreamer)
//! - `backoff`: reconnect delay schedule
//! - `source`: the reconnecting `CameraSource` state machine
//!
//! Frames never leave the process except as annotated JPEGs on the live feed.

mod backoff;
mod device;
mod source;

pub use backoff::Backoff;
#[cfg(feature = "camera-gstreamer")]
pub use device::GstreamerDevice;
pub use device::{device_from_config, CaptureDevice, DeviceConfig, SyntheticDevice};
pub use source::{CameraSource, CameraState, CameraStatus, Capture};
