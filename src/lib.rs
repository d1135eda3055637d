//! Cam-Frame-Grabber: a camera frame acquisition driver for dataflow hosts.
//!
//! The driver selects a capture device, negotiates a capture format, and
//! turns every delivered frame into timestamped raw, color and luminance
//! images, undistorted with a camera model that can be replaced at runtime.
//! Capture backends sit behind the traits in [`traits`], so the whole
//! pipeline runs against the synthetic backend in [`mock`] as well as real
//! V4L2 hardware.

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod frame;
pub mod grabber;
pub mod lifecycle;
pub mod mock;
pub mod negotiation;
pub mod pipeline;
pub mod ports;
pub mod processor;
pub mod registry;
pub mod selector;
pub mod timesync;
pub mod traits;
pub mod undistort;

pub use config::{Attributes, CameraModelSource, GrabberConfig};
pub use device::V4L2Backend;
pub use frame::{ChannelSeq, Image};
pub use grabber::FrameGrabber;
pub use lifecycle::{LifecycleState, ReadinessLatch, UploadGate};
pub use negotiation::FormatPreference;
pub use ports::{Measurement, PushPort, Timestamp};
pub use registry::{ComponentRegistry, HostContext};
pub use traits::{
    CaptureBackend, CaptureDevice, CaptureSession, DeviceDescriptor, Format, FormatCapability,
    FrameListener, FrameSample, GrabberError, PixelFormat, Result,
};
pub use undistort::{CameraModel, Matrix3};
