//! Synthetic capture backend for testing without hardware.
//!
//! Frames are either pushed by hand through a [`SyntheticFeed`] or produced
//! by an optional generator thread at a fixed rate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::traits::{
    CameraControl, CaptureBackend, CaptureDevice, CaptureSession, ControlSetting,
    DeviceDescriptor, Format, FormatCapability, FrameListener, FrameSample, GrabberError,
    PixelFormat, Result,
};

/// Description of one synthetic camera.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    name: String,
    path: String,
    capabilities: Vec<FormatCapability>,
    connected_format: Option<Format>,
    failing_controls: Vec<CameraControl>,
}

impl SyntheticCamera {
    /// A camera offering 320x240 and 640x480 in BGR24 and YUYV at 30 fps.
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_owned(),
            path: path.to_owned(),
            capabilities: vec![
                FormatCapability::new(640, 480, PixelFormat::Yuyv, 30.0),
                FormatCapability::new(640, 480, PixelFormat::Bgr24, 30.0),
                FormatCapability::new(320, 240, PixelFormat::Yuyv, 30.0),
                FormatCapability::new(320, 240, PixelFormat::Bgr24, 30.0),
            ],
            connected_format: None,
            failing_controls: Vec::new(),
        }
    }

    /// Replace the advertised formats.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<FormatCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Report `format` after connecting instead of the selected capability.
    #[must_use]
    pub const fn with_connected_format(mut self, format: Format) -> Self {
        self.connected_format = Some(format);
        self
    }

    /// Make `control` fail when applied.
    #[must_use]
    pub fn with_failing_control(mut self, control: CameraControl) -> Self {
        self.failing_controls.push(control);
        self
    }
}

#[derive(Default)]
struct SpyState {
    enumerations: usize,
    opens: usize,
    applied_controls: Vec<(CameraControl, ControlSetting)>,
    feeds: Vec<SyntheticFeed>,
}

/// Observes what the pipeline did with a [`SyntheticBackend`].
#[derive(Clone, Default)]
pub struct SyntheticSpy {
    state: Arc<Mutex<SpyState>>,
}

impl std::fmt::Debug for SyntheticSpy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticSpy")
            .field("enumerations", &self.enumerations())
            .field("opens", &self.opens())
            .finish_non_exhaustive()
    }
}

impl SyntheticSpy {
    fn with_state<R, F: FnOnce(&mut SpyState) -> R>(&self, f: F) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// How often devices were enumerated.
    pub fn enumerations(&self) -> usize {
        self.with_state(|state| state.enumerations)
    }

    /// How often a device was opened.
    pub fn opens(&self) -> usize {
        self.with_state(|state| state.opens)
    }

    /// Controls accepted by any device, in application order.
    pub fn applied_controls(&self) -> Vec<(CameraControl, ControlSetting)> {
        self.with_state(|state| state.applied_controls.clone())
    }

    /// Feed of the most recently connected session.
    pub fn feed(&self) -> Option<SyntheticFeed> {
        self.with_state(|state| state.feeds.last().cloned())
    }
}

/// A [`CaptureBackend`] over a fixed list of [`SyntheticCamera`]s.
#[derive(Debug, Default)]
pub struct SyntheticBackend {
    cameras: Vec<SyntheticCamera>,
    generator_fps: Option<f64>,
    spy: SyntheticSpy,
}

impl SyntheticBackend {
    /// A backend without cameras.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a camera. Enumeration order is insertion order.
    #[must_use]
    pub fn with_camera(mut self, camera: SyntheticCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    /// Generate color bars at `fps` while a session is running.
    #[must_use]
    pub const fn with_generator(mut self, fps: f64) -> Self {
        self.generator_fps = Some(fps);
        self
    }

    /// Handle for inspecting what happened on this backend.
    pub fn spy(&self) -> SyntheticSpy {
        self.spy.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    type Device = SyntheticDevice;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.spy.with_state(|state| state.enumerations += 1);
        Ok(self
            .cameras
            .iter()
            .enumerate()
            .map(|(index, camera)| DeviceDescriptor::new(&camera.name, &camera.path, index))
            .collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Device> {
        let camera = self
            .cameras
            .get(device.index)
            .filter(|camera| camera.path == device.path)
            .ok_or(GrabberError::DeviceNotFound)?;
        self.spy.with_state(|state| state.opens += 1);

        Ok(SyntheticDevice {
            camera: camera.clone(),
            selected: None,
            generator_fps: self.generator_fps,
            spy: self.spy.clone(),
        })
    }
}

/// An opened synthetic camera.
#[derive(Debug)]
pub struct SyntheticDevice {
    camera: SyntheticCamera,
    selected: Option<FormatCapability>,
    generator_fps: Option<f64>,
    spy: SyntheticSpy,
}

impl CaptureDevice for SyntheticDevice {
    type Session = SyntheticSession;

    fn capabilities(&self) -> Result<Vec<FormatCapability>> {
        Ok(self.camera.capabilities.clone())
    }

    fn set_format(&mut self, capability: &FormatCapability) -> Result<()> {
        if !self.camera.capabilities.contains(capability) {
            return Err(GrabberError::UnsupportedFormat(format!(
                "{capability} is not offered by {}",
                self.camera.name
            )));
        }
        self.selected = Some(*capability);
        Ok(())
    }

    fn set_control(&mut self, control: CameraControl, setting: ControlSetting) -> Result<()> {
        if self.camera.failing_controls.contains(&control) {
            return Err(GrabberError::CameraControl {
                control,
                reason: "not supported by device".to_owned(),
            });
        }
        self.spy
            .with_state(|state| state.applied_controls.push((control, setting)));
        Ok(())
    }

    fn connect(self, listener: Arc<dyn FrameListener>) -> Result<Self::Session> {
        let format = match (self.camera.connected_format, self.selected) {
            (Some(format), _) => format,
            (None, Some(capability)) => {
                Format::new(capability.width, capability.height, capability.pixel_format)
            }
            (None, None) => {
                return Err(GrabberError::PipelineConstruction(
                    "no format selected before connecting".to_owned(),
                ));
            }
        };

        let feed = SyntheticFeed {
            shared: Arc::new(FeedShared {
                listener,
                format,
                state: Mutex::new(RunState::Paused),
                changed: Condvar::new(),
                runs: AtomicUsize::new(0),
                pauses: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }),
        };
        self.spy
            .with_state(|state| state.feeds.push(feed.clone()));

        let generator = match self.generator_fps {
            Some(fps) if fps > 0.0 => Some(spawn_generator(feed.clone(), fps)?),
            _ => None,
        };

        Ok(SyntheticSession {
            feed,
            generator: Mutex::new(generator),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Paused,
    Running,
    Stopped,
}

struct FeedShared {
    listener: Arc<dyn FrameListener>,
    format: Format,
    state: Mutex<RunState>,
    changed: Condvar,
    runs: AtomicUsize,
    pauses: AtomicUsize,
    stops: AtomicUsize,
}

/// Pushes frames into a connected synthetic session.
#[derive(Clone)]
pub struct SyntheticFeed {
    shared: Arc<FeedShared>,
}

impl std::fmt::Debug for SyntheticFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticFeed")
            .field("format", &self.shared.format)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyntheticFeed {
    fn state(&self) -> RunState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunState) {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
        self.shared.changed.notify_all();
    }

    /// The format frames are delivered in.
    pub fn format(&self) -> Format {
        self.shared.format
    }

    /// Whether the session is running.
    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// How often the session was told to run.
    pub fn run_count(&self) -> usize {
        self.shared.runs.load(Ordering::SeqCst)
    }

    /// How often the session was told to pause.
    pub fn pause_count(&self) -> usize {
        self.shared.pauses.load(Ordering::SeqCst)
    }

    /// How often the session was told to stop.
    pub fn stop_count(&self) -> usize {
        self.shared.stops.load(Ordering::SeqCst)
    }

    /// Deliver one buffer to the listener. Returns `false` without
    /// delivering unless the session is running.
    pub fn deliver(&self, native_time: f64, data: &[u8]) -> bool {
        if !self.is_running() {
            return false;
        }
        self.shared.listener.on_frame(&FrameSample {
            data,
            native_time,
            format: self.shared.format,
        });
        true
    }

    /// Deliver a generated `pattern` frame in the connected format.
    pub fn deliver_pattern(&self, native_time: f64, pattern: TestPattern) -> bool {
        let data = generate_test_frame(&self.shared.format, pattern);
        self.deliver(native_time, &data)
    }
}

fn spawn_generator(feed: SyntheticFeed, fps: f64) -> Result<JoinHandle<()>> {
    let period = Duration::from_secs_f64(1.0 / fps);
    std::thread::Builder::new()
        .name("synthetic-camera".to_owned())
        .spawn(move || {
            let mut native_time = 0.0;
            loop {
                {
                    let guard = feed
                        .shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let state = *feed
                        .shared
                        .changed
                        .wait_while(guard, |state| *state == RunState::Paused)
                        .unwrap_or_else(PoisonError::into_inner);
                    if state == RunState::Stopped {
                        break;
                    }
                }
                feed.deliver_pattern(native_time, TestPattern::ColorBars);
                native_time += period.as_secs_f64();
                std::thread::sleep(period);
            }
            debug!("synthetic generator finished");
        })
        .map_err(GrabberError::from)
}

/// Run-state control of a connected synthetic camera.
pub struct SyntheticSession {
    feed: SyntheticFeed,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyntheticSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticSession")
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

impl SyntheticSession {
    /// The feed pushing into this session.
    pub fn feed(&self) -> SyntheticFeed {
        self.feed.clone()
    }
}

impl CaptureSession for SyntheticSession {
    fn connected_format(&self) -> Format {
        self.feed.format()
    }

    fn run(&self) -> Result<()> {
        self.feed.shared.runs.fetch_add(1, Ordering::SeqCst);
        if self.feed.state() == RunState::Stopped {
            return Err(GrabberError::PipelineConstruction(
                "session already stopped".to_owned(),
            ));
        }
        self.feed.set_state(RunState::Running);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.feed.shared.pauses.fetch_add(1, Ordering::SeqCst);
        if self.feed.state() != RunState::Stopped {
            self.feed.set_state(RunState::Paused);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.feed.shared.stops.fetch_add(1, Ordering::SeqCst);
        self.feed.set_state(RunState::Stopped);
        let handle = self
            .generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("synthetic generator thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        if self.feed.state() != RunState::Stopped {
            let _ = self.stop();
        }
    }
}

/// Test pattern types for synthetic frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Eight vertical color bars.
    ColorBars,
    /// Horizontal gray gradient from dark to light.
    Gradient,
    /// Solid color with the given B, G, R values.
    Solid(u8, u8, u8),
}

/// Color bars in BGR order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [255, 255, 0],
    [0, 255, 0],
    [255, 0, 255],
    [0, 0, 255],
    [255, 0, 0],
    [0, 0, 0],
];

impl TestPattern {
    /// BGR value of the pixel in column `x` of a `width` wide frame.
    fn pixel(self, x: u32, width: u32) -> [u8; 3] {
        match self {
            Self::ColorBars => {
                let bar = (x * 8 / width.max(1)).min(7) as usize;
                BARS.get(bar).copied().unwrap_or_default()
            }
            Self::Gradient => {
                let value = u8::try_from(x * 255 / width.saturating_sub(1).max(1)).unwrap_or(u8::MAX);
                [value; 3]
            }
            Self::Solid(b, g, r) => [b, g, r],
        }
    }
}

/// Generate a frame of `pattern` in `format`. Only BGR24 carries the
/// pattern; other fixed-size layouts are zero-filled.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let stride = format.stride as usize;
    let mut data = vec![0u8; stride * format.height as usize];
    if format.pixel_format != PixelFormat::Bgr24 || stride == 0 {
        return data;
    }

    for row in data.chunks_exact_mut(stride) {
        for (x, px) in (0..format.width).zip(row.chunks_exact_mut(3)) {
            px.copy_from_slice(&pattern.pixel(x, format.width));
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(AtomicUsize);

    impl FrameListener for Counter {
        fn on_frame(&self, _sample: &FrameSample<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connected(camera: SyntheticCamera) -> (SyntheticSession, Arc<Counter>) {
        let backend = SyntheticBackend::new().with_camera(camera);
        let devices = backend.enumerate().expect("enumerate should succeed");
        let mut device = backend
            .open(devices.first().expect("one device"))
            .expect("open should succeed");
        device
            .set_format(&FormatCapability::new(320, 240, PixelFormat::Bgr24, 30.0))
            .expect("set_format should succeed");
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let session = device
            .connect(Arc::clone(&counter) as Arc<dyn FrameListener>)
            .expect("connect should succeed");
        (session, counter)
    }

    #[test]
    fn test_enumerate_in_insertion_order() {
        let backend = SyntheticBackend::new()
            .with_camera(SyntheticCamera::new("CamA", "/dev/a"))
            .with_camera(SyntheticCamera::new("CamB", "/dev/b"));
        let devices = backend.enumerate().expect("enumerate should succeed");

        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["CamA", "CamB"]);
        assert_eq!(backend.spy().enumerations(), 1);
    }

    #[test]
    fn test_set_format_rejects_unadvertised() {
        let backend = SyntheticBackend::new().with_camera(SyntheticCamera::new("Cam", "/dev/a"));
        let mut device = backend
            .open(&DeviceDescriptor::new("Cam", "/dev/a", 0))
            .expect("open should succeed");
        let result = device.set_format(&FormatCapability::new(1920, 1080, PixelFormat::Bgr24, 30.0));
        assert!(matches!(result, Err(GrabberError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_session_delivers_only_while_running() {
        let (session, counter) = connected(SyntheticCamera::new("Cam", "/dev/a"));
        let feed = session.feed();
        assert_eq!(feed.format(), Format::new(320, 240, PixelFormat::Bgr24));

        assert!(!feed.deliver_pattern(0.0, TestPattern::ColorBars));
        session.run().expect("run should succeed");
        assert!(feed.deliver_pattern(1.0, TestPattern::ColorBars));
        session.pause().expect("pause should succeed");
        assert!(!feed.deliver_pattern(2.0, TestPattern::ColorBars));

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(feed.run_count(), 1);
        assert_eq!(feed.pause_count(), 1);
    }

    #[test]
    fn test_stopped_session_cannot_run() {
        let (session, _) = connected(SyntheticCamera::new("Cam", "/dev/a"));
        session.stop().expect("stop should succeed");
        assert!(session.run().is_err());
    }

    #[test]
    fn test_generator_produces_frames() {
        let backend = SyntheticBackend::new()
            .with_camera(SyntheticCamera::new("Cam", "/dev/a"))
            .with_generator(200.0);
        let mut device = backend
            .open(&DeviceDescriptor::new("Cam", "/dev/a", 0))
            .expect("open should succeed");
        device
            .set_format(&FormatCapability::new(320, 240, PixelFormat::Bgr24, 30.0))
            .expect("set_format should succeed");
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let session = device
            .connect(Arc::clone(&counter) as Arc<dyn FrameListener>)
            .expect("connect should succeed");

        session.run().expect("run should succeed");
        std::thread::sleep(Duration::from_millis(100));
        session.stop().expect("stop should succeed");

        assert!(counter.0.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(64, 4, PixelFormat::Bgr24);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), 64 * 4 * 3);
        // First bar is white, last is black.
        assert_eq!(data.get(..3), Some(&[255, 255, 255][..]));
        assert_eq!(data.get(63 * 3..64 * 3), Some(&[0, 0, 0][..]));
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(64, 2, PixelFormat::Bgr24);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        assert_eq!(data.first(), Some(&0));
        assert_eq!(data.get(63 * 3), Some(&255));
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(8, 8, PixelFormat::Bgr24);
        let data = generate_test_frame(&format, TestPattern::Solid(10, 20, 30));

        assert!(data.chunks_exact(3).all(|px| px == [10, 20, 30]));
    }

    #[test]
    fn test_non_bgr_is_zero_filled() {
        let format = Format::new(8, 8, PixelFormat::Yuyv);
        let data = generate_test_frame(&format, TestPattern::Solid(10, 20, 30));

        assert_eq!(data.len(), 8 * 8 * 2);
        assert!(data.iter().all(|&b| b == 0));
    }
}
