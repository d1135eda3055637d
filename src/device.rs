//! V4L2 capture backend using the v4l crate.
//!
//! Each connected device is owned by a capture thread that streams through
//! mmap buffers and calls the listener for every dequeued buffer. The thread
//! follows the run state of its [`V4L2Session`]: it streams while running,
//! turns streaming off while paused and exits once stopped.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use tracing::{debug, info, warn};

use crate::traits::{
    CameraControl, CaptureBackend, CaptureDevice, CaptureSession, ControlMode, ControlSetting,
    DeviceDescriptor, Format, FormatCapability, FourCC, FrameListener, FrameSample, GrabberError,
    PixelFormat, Result,
};

/// Number of mmap buffers per stream.
const BUFFER_COUNT: u32 = 4;

/// Back-off after a failed dequeue.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Longest wait for a buffer before the thread re-checks its run state.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

const CID_BASE: u32 = 0x0098_0900;
const CID_BRIGHTNESS: u32 = CID_BASE;
const CID_CONTRAST: u32 = CID_BASE + 1;
const CID_SATURATION: u32 = CID_BASE + 2;
const CID_AUTO_WHITE_BALANCE: u32 = CID_BASE + 12;
const CID_GAMMA: u32 = CID_BASE + 16;
const CID_GAIN: u32 = CID_BASE + 19;
const CID_WHITE_BALANCE_TEMPERATURE: u32 = CID_BASE + 26;
const CID_SHARPNESS: u32 = CID_BASE + 27;
const CID_BACKLIGHT_COMPENSATION: u32 = CID_BASE + 28;

const CID_CAMERA_CLASS_BASE: u32 = 0x009A_0900;
const CID_EXPOSURE_AUTO: u32 = CID_CAMERA_CLASS_BASE + 1;
const CID_EXPOSURE_ABSOLUTE: u32 = CID_CAMERA_CLASS_BASE + 2;

/// `V4L2_EXPOSURE_MANUAL`.
const EXPOSURE_MANUAL: i64 = 1;
/// `V4L2_EXPOSURE_APERTURE_PRIORITY`, the automatic mode UVC cameras offer.
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Identification data reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver name (e.g. "uvcvideo", "vivid").
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device supports video capture.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

fn query_info(device: &Device) -> Result<DeviceInfo> {
    let caps = device
        .query_caps()
        .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;
    Ok(DeviceInfo {
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus,
        can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
        can_stream: caps.capabilities.contains(Flags::STREAMING),
    })
}

/// Capture backend over the `/dev/video*` nodes of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4L2Backend;

impl V4L2Backend {
    /// Create the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CaptureBackend for V4L2Backend {
    type Device = V4L2Device;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        let mut devices = Vec::new();
        for node in nodes {
            let path = node.path().display().to_string();
            let info = match Device::with_path(node.path())
                .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))
                .and_then(|device| query_info(&device))
            {
                Ok(info) => info,
                Err(err) => {
                    debug!(%path, %err, "skipping video node");
                    continue;
                }
            };
            if !info.can_capture {
                continue;
            }
            devices.push(DeviceDescriptor::new(&info.card, &path, node.index()));
        }
        Ok(devices)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Self::Device> {
        V4L2Device::open(Path::new(&descriptor.path))
    }
}

/// An opened V4L2 capture device.
pub struct V4L2Device {
    device: Device,
    info: DeviceInfo,
}

impl std::fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Device")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl V4L2Device {
    /// Open the device node at `path` (e.g. `/dev/video0`).
    pub fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(|err| {
            GrabberError::PipelineConstruction(format!("cannot open {}: {err}", path.display()))
        })?;
        let info = query_info(&device)?;
        if !info.can_capture || !info.can_stream {
            return Err(GrabberError::PipelineConstruction(format!(
                "{} does not support streaming capture",
                info.card
            )));
        }
        Ok(Self { device, info })
    }

    /// Driver identification.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The format currently set on the device.
    pub fn current_format(&self) -> Result<Format> {
        let fmt = self
            .device
            .format()
            .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;
        Ok(Format {
            stride: fmt.stride,
            size: fmt.size,
            ..Format::new(fmt.width, fmt.height, PixelFormat::from(FourCC::from(fmt.fourcc)))
        })
    }

    fn frame_rate(&self, fourcc: v4l::FourCC, width: u32, height: u32) -> f64 {
        let Ok(intervals) = self.device.enum_frameintervals(fourcc, width, height) else {
            return 0.0;
        };
        intervals
            .iter()
            .map(|interval| match &interval.interval {
                FrameIntervalEnum::Discrete(fraction) => fraction_to_fps(fraction),
                FrameIntervalEnum::Stepwise(stepwise) => fraction_to_fps(&stepwise.min),
            })
            .fold(0.0, f64::max)
    }

    fn write_control(&self, control: CameraControl, id: u32, value: Value) -> Result<()> {
        self.device
            .set_control(Control { id, value })
            .map_err(|err| GrabberError::CameraControl {
                control,
                reason: err.to_string(),
            })
    }
}

fn fraction_to_fps(fraction: &v4l::Fraction) -> f64 {
    if fraction.numerator == 0 {
        return 0.0;
    }
    f64::from(fraction.denominator) / f64::from(fraction.numerator)
}

impl CaptureDevice for V4L2Device {
    type Session = V4L2Session;

    fn capabilities(&self) -> Result<Vec<FormatCapability>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;

        let mut capabilities = Vec::new();
        for description in descriptions {
            let pixel_format = PixelFormat::from(FourCC::from(description.fourcc));
            let sizes = self
                .device
                .enum_framesizes(description.fourcc)
                .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;

            for size in sizes {
                let dimensions = match size.size {
                    FrameSizeEnum::Discrete(discrete) => vec![(discrete.width, discrete.height)],
                    FrameSizeEnum::Stepwise(stepwise) => vec![
                        (stepwise.min_width, stepwise.min_height),
                        (stepwise.max_width, stepwise.max_height),
                    ],
                };
                for (width, height) in dimensions {
                    let fps = self.frame_rate(description.fourcc, width, height);
                    capabilities.push(FormatCapability::new(width, height, pixel_format, fps));
                }
            }
        }
        Ok(capabilities)
    }

    fn set_format(&mut self, capability: &FormatCapability) -> Result<()> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;
        fmt.width = capability.width;
        fmt.height = capability.height;
        fmt.fourcc = capability.pixel_format.fourcc().into();

        let actual = self
            .device
            .set_format(&fmt)
            .map_err(|err| GrabberError::PipelineConstruction(err.to_string()))?;
        if actual.width != capability.width || actual.height != capability.height {
            return Err(GrabberError::UnsupportedFormat(format!(
                "driver adjusted {capability} to {}x{}",
                actual.width, actual.height
            )));
        }

        if capability.fps >= 1.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let fps = capability.fps.round() as u32;
            if let Err(err) = self.device.set_params(&Parameters::with_fps(fps)) {
                warn!(fps, %err, "frame rate not applied");
            }
        }
        Ok(())
    }

    fn set_control(&mut self, control: CameraControl, setting: ControlSetting) -> Result<()> {
        let value = i64::from(setting.value);
        match (control, setting.mode) {
            (CameraControl::Exposure, ControlMode::Auto) => self.write_control(
                control,
                CID_EXPOSURE_AUTO,
                Value::Integer(EXPOSURE_APERTURE_PRIORITY),
            ),
            (CameraControl::Exposure, ControlMode::Manual) => {
                self.write_control(control, CID_EXPOSURE_AUTO, Value::Integer(EXPOSURE_MANUAL))?;
                self.write_control(control, CID_EXPOSURE_ABSOLUTE, Value::Integer(value))
            }
            (CameraControl::WhiteBalance, ControlMode::Auto) => {
                self.write_control(control, CID_AUTO_WHITE_BALANCE, Value::Boolean(true))
            }
            (CameraControl::WhiteBalance, ControlMode::Manual) => {
                self.write_control(control, CID_AUTO_WHITE_BALANCE, Value::Boolean(false))?;
                self.write_control(control, CID_WHITE_BALANCE_TEMPERATURE, Value::Integer(value))
            }
            (CameraControl::Gain, _) => self.write_control(control, CID_GAIN, Value::Integer(value)),
            (CameraControl::Brightness, _) => {
                self.write_control(control, CID_BRIGHTNESS, Value::Integer(value))
            }
            (CameraControl::Contrast, _) => {
                self.write_control(control, CID_CONTRAST, Value::Integer(value))
            }
            (CameraControl::Saturation, _) => {
                self.write_control(control, CID_SATURATION, Value::Integer(value))
            }
            (CameraControl::Sharpness, _) => {
                self.write_control(control, CID_SHARPNESS, Value::Integer(value))
            }
            (CameraControl::Gamma, _) => self.write_control(control, CID_GAMMA, Value::Integer(value)),
            (CameraControl::BacklightCompensation, _) => {
                self.write_control(control, CID_BACKLIGHT_COMPENSATION, Value::Integer(value))
            }
        }
    }

    fn connect(self, listener: Arc<dyn FrameListener>) -> Result<Self::Session> {
        let format = self.current_format()?;
        let control = Arc::new(GraphControl {
            state: Mutex::new(GraphState::Paused),
            changed: Condvar::new(),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker_control = Arc::clone(&control);
        let device = self.device;
        let worker = std::thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || capture_loop(&device, &listener, format, &worker_control, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                return Err(GrabberError::PipelineConstruction(
                    "capture thread exited during setup".to_owned(),
                ));
            }
        }

        info!(card = %self.info.card, %format.pixel_format, "capture graph connected");
        Ok(V4L2Session {
            format,
            control,
            worker: Mutex::new(Some(worker)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphState {
    Paused,
    Running,
    Stopped,
}

#[derive(Debug)]
struct GraphControl {
    state: Mutex<GraphState>,
    changed: Condvar,
}

impl GraphControl {
    fn get(&self) -> GraphState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: GraphState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != GraphState::Stopped {
            *current = state;
        }
        drop(current);
        self.changed.notify_all();
    }

    fn wait_while_paused(&self) -> GraphState {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *self
            .changed
            .wait_while(guard, |state| *state == GraphState::Paused)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_precision_loss)]
fn native_seconds(timestamp: v4l::Timestamp) -> f64 {
    timestamp.sec as f64 + timestamp.usec as f64 * 1e-6
}

/// A dequeue that timed out only means no frame arrived yet.
fn is_dequeue_timeout(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::TimedOut
}

fn capture_loop(
    device: &Device,
    listener: &Arc<dyn FrameListener>,
    format: Format,
    control: &GraphControl,
    ready: &crossbeam_channel::Sender<Result<()>>,
) {
    let mut stream = match Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(mut stream) => {
            stream.set_timeout(DEQUEUE_TIMEOUT);
            let _ = ready.send(Ok(()));
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(GrabberError::PipelineConstruction(format!(
                "cannot map capture buffers: {err}"
            ))));
            return;
        }
    };

    let mut streaming = false;
    loop {
        match control.get() {
            GraphState::Stopped => break,
            GraphState::Paused => {
                if streaming {
                    if let Err(err) = stream.stop() {
                        warn!(%err, "failed to turn streaming off");
                    }
                    streaming = false;
                }
                control.wait_while_paused();
                continue;
            }
            GraphState::Running => {}
        }

        match stream.next() {
            Ok((buffer, meta)) => {
                streaming = true;
                let used = usize::try_from(meta.bytesused).unwrap_or(usize::MAX);
                let data = buffer.get(..used).unwrap_or(buffer);
                listener.on_frame(&FrameSample {
                    data,
                    native_time: native_seconds(meta.timestamp),
                    format,
                });
            }
            Err(err) if is_dequeue_timeout(&err) => {
                debug!("no buffer within {DEQUEUE_TIMEOUT:?}");
            }
            Err(err) => {
                warn!(%err, "failed to dequeue buffer");
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }

    if streaming {
        if let Err(err) = stream.stop() {
            warn!(%err, "failed to turn streaming off");
        }
    }
    debug!("capture thread finished");
}

/// Run-state control of a connected V4L2 device.
pub struct V4L2Session {
    format: Format,
    control: Arc<GraphControl>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for V4L2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Session")
            .field("format", &self.format)
            .field("state", &self.control.get())
            .finish_non_exhaustive()
    }
}

impl CaptureSession for V4L2Session {
    fn connected_format(&self) -> Format {
        self.format
    }

    fn run(&self) -> Result<()> {
        if self.control.get() == GraphState::Stopped {
            return Err(GrabberError::PipelineConstruction(
                "capture graph already stopped".to_owned(),
            ));
        }
        self.control.set(GraphState::Running);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.control.set(GraphState::Paused);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.control.set(GraphState::Stopped);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                return Err(GrabberError::PipelineConstruction(
                    "capture thread panicked".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for V4L2Session {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "failed to stop capture thread");
        }
    }
}
