//! Core traits and types for the capture backend abstraction.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Pixel format code (e.g., YUYV, MJPG, BGR3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// GREY pixel format (8-bit luminance).
    pub const GREY: Self = Self::new(b"GREY");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Memory layout of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 24-bit interleaved, blue first.
    Bgr24,
    /// 24-bit interleaved, red first.
    Rgb24,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion JPEG (compressed, no fixed pixel size).
    Mjpeg,
    /// 8-bit luminance.
    Gray8,
    /// Any other layout, identified by its code.
    Other(FourCC),
}

impl PixelFormat {
    /// Bytes per pixel, or `None` for compressed and unknown layouts.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Bgr24 | Self::Rgb24 => Some(3),
            Self::Yuyv => Some(2),
            Self::Gray8 => Some(1),
            Self::Mjpeg | Self::Other(_) => None,
        }
    }

    /// The `FourCC` code for this layout.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Bgr24 => FourCC::BGR3,
            Self::Rgb24 => FourCC::RGB3,
            Self::Yuyv => FourCC::YUYV,
            Self::Mjpeg => FourCC::MJPG,
            Self::Gray8 => FourCC::GREY,
            Self::Other(code) => code,
        }
    }
}

impl From<FourCC> for PixelFormat {
    fn from(fourcc: FourCC) -> Self {
        match fourcc {
            FourCC::BGR3 => Self::Bgr24,
            FourCC::RGB3 => Self::Rgb24,
            FourCC::YUYV => Self::Yuyv,
            FourCC::MJPG => Self::Mjpeg,
            FourCC::GREY => Self::Gray8,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bgr24 => f.write_str("BGR24"),
            Self::Rgb24 => f.write_str("RGB24"),
            Self::Yuyv => f.write_str("YUYV"),
            Self::Mjpeg => f.write_str("MJPG"),
            Self::Gray8 => f.write_str("GRAY8"),
            Self::Other(code) => write!(f, "{code}"),
        }
    }
}

/// The only layout the capture pipeline accepts on its connected output.
pub const PREFERRED_PIXEL_FORMAT: PixelFormat = PixelFormat::Bgr24;

/// Row order of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// First row in memory is the top of the image.
    #[default]
    TopLeft,
    /// First row in memory is the bottom of the image (DIB style).
    BottomLeft,
}

/// Video format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
    /// Row order.
    pub origin: Origin,
}

impl Format {
    /// Create a tightly packed, top-down format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let stride = match pixel_format.bytes_per_pixel() {
            Some(bpp) => width * bpp,
            None => 0,
        };
        Self {
            width,
            height,
            pixel_format,
            stride,
            size: stride * height,
            origin: Origin::TopLeft,
        }
    }

    /// Set the row order.
    #[must_use]
    pub const fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Minimum number of bytes a buffer in this format must hold:
    /// width x height x bytes-per-pixel.
    #[must_use]
    pub fn min_buffer_len(&self) -> Option<usize> {
        let bpp = self.pixel_format.bytes_per_pixel()?;
        Some(self.width as usize * self.height as usize * bpp as usize)
    }
}

/// One entry of the format list a device advertises.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatCapability {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Nominal frame rate (frames per second, 0 if unknown).
    pub fps: f64,
}

impl FormatCapability {
    /// Create a capability entry.
    #[must_use]
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat, fps: f64) -> Self {
        Self {
            width,
            height,
            pixel_format,
            fps,
        }
    }
}

impl fmt::Display for FormatCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} @ {:.1} fps",
            self.width, self.height, self.pixel_format, self.fps
        )
    }
}

/// An enumerated capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Friendly name.
    pub name: String,
    /// Backend-specific device path.
    pub path: String,
    /// Backend-specific handle (enumeration index).
    pub index: usize,
}

impl DeviceDescriptor {
    /// Create a descriptor.
    pub fn new(name: &str, path: &str, index: usize) -> Self {
        Self {
            name: name.to_owned(),
            path: path.to_owned(),
            index,
        }
    }
}

/// A frame as handed to the dispatch callback.
///
/// The pixel data is borrowed from the capture subsystem and is only valid
/// for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample<'a> {
    /// Pixel data.
    pub data: &'a [u8],
    /// Native timestamp reported by the backend, in backend ticks.
    pub native_time: f64,
    /// Layout of `data`.
    pub format: Format,
}

/// Adjustable camera properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraControl {
    /// Exposure time.
    Exposure,
    /// Sensor gain.
    Gain,
    /// Brightness.
    Brightness,
    /// Contrast.
    Contrast,
    /// Color saturation.
    Saturation,
    /// Sharpness.
    Sharpness,
    /// Gamma.
    Gamma,
    /// White balance temperature.
    WhiteBalance,
    /// Backlight compensation.
    BacklightCompensation,
}

impl fmt::Display for CameraControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exposure => "exposure",
            Self::Gain => "gain",
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
            Self::Saturation => "saturation",
            Self::Sharpness => "sharpness",
            Self::Gamma => "gamma",
            Self::WhiteBalance => "white balance",
            Self::BacklightCompensation => "backlight compensation",
        };
        f.write_str(name)
    }
}

/// Whether the device or the application drives a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// The value is set explicitly.
    #[default]
    Manual,
    /// The device regulates the property itself.
    Auto,
}

/// Requested value for a camera control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetting {
    /// Control value (ignored by most backends in `Auto` mode).
    pub value: i32,
    /// Manual or automatic regulation.
    pub mode: ControlMode,
}

impl ControlSetting {
    /// A manually set value.
    #[must_use]
    pub const fn manual(value: i32) -> Self {
        Self {
            value,
            mode: ControlMode::Manual,
        }
    }

    /// Automatic regulation, starting from `value`.
    #[must_use]
    pub const fn auto(value: i32) -> Self {
        Self {
            value,
            mode: ControlMode::Auto,
        }
    }
}

/// Error type for frame grabber operations.
#[derive(Debug, Error)]
pub enum GrabberError {
    /// No capture device could be selected.
    #[error("no video capture device found")]
    DeviceNotFound,
    /// A step of building the capture graph failed.
    #[error("failed to construct capture pipeline: {0}")]
    PipelineConstruction(String),
    /// The device cannot deliver the required format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// A camera control could not be applied.
    #[error("failed to set {control}: {reason}")]
    CameraControl {
        /// The control that was rejected.
        control: CameraControl,
        /// Backend message.
        reason: String,
    },
    /// A delivered frame was rejected.
    #[error("frame rejected: {0}")]
    FrameValidation(String),
    /// A configuration attribute could not be interpreted.
    #[error("invalid attribute {key}={value:?}: {reason}")]
    InvalidAttribute {
        /// Attribute name.
        key: String,
        /// Raw attribute value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A camera model file could not be loaded.
    #[error("failed to load camera model {path:?}: {reason}")]
    CameraModel {
        /// File that failed.
        path: PathBuf,
        /// Why it failed.
        reason: String,
    },
    /// No factory is registered under the requested component type.
    #[error("no component registered as {0:?}")]
    UnknownComponent(String),
    /// No port with the given name exists.
    #[error("no port named {0:?}")]
    UnknownPort(String),
    /// An image operation in OpenCV failed.
    #[error("vision operation failed: {0}")]
    Vision(#[from] opencv::Error),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for frame grabber operations.
pub type Result<T> = std::result::Result<T, GrabberError>;

/// Receives frames from a running capture session.
///
/// Backends invoke `on_frame` serially from their own thread. The call must
/// return promptly; the backend does not deliver the next frame until it does.
pub trait FrameListener: Send + Sync {
    /// Handle one captured frame.
    fn on_frame(&self, sample: &FrameSample<'_>);
}

/// Abstraction over a platform capture API.
pub trait CaptureBackend {
    /// The device type returned by `open`.
    type Device: CaptureDevice;

    /// Enumerate the available capture devices.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open an enumerated device for configuration.
    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Device>;
}

/// An opened, not yet connected capture device.
pub trait CaptureDevice {
    /// The session type returned by `connect`.
    type Session: CaptureSession + 'static;

    /// All formats the device advertises.
    fn capabilities(&self) -> Result<Vec<FormatCapability>>;

    /// Select the capture format.
    fn set_format(&mut self, capability: &FormatCapability) -> Result<()>;

    /// Apply a camera control.
    fn set_control(&mut self, control: CameraControl, setting: ControlSetting) -> Result<()>;

    /// Connect the capture output through `listener` to a discarding sink,
    /// requesting the preferred layout. The returned session is paused.
    fn connect(self, listener: Arc<dyn FrameListener>) -> Result<Self::Session>;
}

/// Run-state control of a connected capture graph.
pub trait CaptureSession: Send + Sync {
    /// The format frames are actually delivered in.
    fn connected_format(&self) -> Format;

    /// Start delivering frames.
    fn run(&self) -> Result<()>;

    /// Suspend delivery, keeping the graph and device allocated.
    fn pause(&self) -> Result<()>;

    /// Stop the graph completely.
    fn stop(&self) -> Result<()>;
}
