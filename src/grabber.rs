//! The frame grabber component: owns the capture pipeline, the dispatcher
//! and the output ports, and maps start/stop onto the capture graph.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::config::GrabberConfig;
use crate::dispatcher::FrameDispatcher;
use crate::frame::Image;
use crate::lifecycle::{Lifecycle, LifecycleState, ReadyCallback, UploadGate};
use crate::pipeline::CapturePipeline;
use crate::ports::{Measurement, PushPort, Timestamp};
use crate::processor::{FrameProcessor, OutputPorts};
use crate::traits::{DeviceDescriptor, FrameListener, GrabberError, Result};
use crate::undistort::{CameraModel, Matrix3, SharedIntrinsics};

/// Name prefix of inputs that accept replacement camera models.
pub const INTRINSICS_INPUT_PREFIX: &str = "CameraModel";

/// Name of the intrinsic matrix pull port.
pub const INTRINSICS_OUTPUT: &str = "Intrinsics";

fn dimension(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// A camera frame grabber.
///
/// Construction selects the device and builds a paused capture graph; frames
/// only reach the outputs between [`FrameGrabber::start`] and
/// [`FrameGrabber::stop`]. Dropping the grabber stops the graph.
pub struct FrameGrabber {
    name: String,
    config: GrabberConfig,
    lifecycle: Arc<Lifecycle>,
    ports: Arc<OutputPorts>,
    intrinsics: Arc<SharedIntrinsics>,
    dispatcher: Arc<FrameDispatcher<FrameProcessor>>,
    pipeline: CapturePipeline,
    upload_gate: Option<Arc<dyn UploadGate>>,
    /// Serializes lifecycle transitions with their graph calls. Holds the
    /// start generation: a deferred start only runs if no stop or other
    /// start happened after it was requested.
    control: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for FrameGrabber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGrabber")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl FrameGrabber {
    /// Build a grabber named `name` on `backend`.
    ///
    /// Loads the camera model, builds the paused capture pipeline and arms
    /// the dispatcher with the negotiated format. The grabber starts out
    /// `Initializing`.
    ///
    /// # Arguments
    ///
    /// * `name` - Instance name used in log lines
    /// * `config` - Parsed grabber attributes
    /// * `backend` - Capture system the device is selected from
    /// * `upload_gate` - Consulted on start when `config` asks for GPU upload
    ///
    /// # Returns
    ///
    /// The initialized grabber, or the error that stopped construction: the
    /// camera model file could not be loaded or the pipeline could not be
    /// built.
    pub fn new<B: crate::traits::CaptureBackend>(
        name: &str,
        config: GrabberConfig,
        backend: &B,
        upload_gate: Option<Arc<dyn UploadGate>>,
    ) -> Result<Self> {
        let model = CameraModel::load(
            &config.camera_model,
            dimension(config.desired_width),
            dimension(config.desired_height),
        )?;

        let lifecycle = Arc::new(Lifecycle::new());
        let ports = Arc::new(OutputPorts::new());
        let intrinsics = Arc::new(SharedIntrinsics::new(model));

        let processor = FrameProcessor::new(
            config.desired_width,
            config.desired_height,
            Arc::clone(&ports),
            Arc::clone(&intrinsics),
        );
        let dispatcher = Arc::new(FrameDispatcher::new(
            processor,
            Arc::clone(&lifecycle),
            config.divisor,
            config.time_offset_ms,
        ));

        let listener: Arc<dyn FrameListener> = Arc::clone(&dispatcher) as Arc<dyn FrameListener>;
        let pipeline = CapturePipeline::build(backend, &config, listener)?;
        dispatcher.arm(pipeline.format());

        let upload_gate = if config.upload_image_on_gpu {
            if upload_gate.is_none() {
                warn!(component = name, "GPU upload requested but no upload gate available");
            }
            upload_gate
        } else {
            None
        };

        lifecycle.set(LifecycleState::Initializing);
        info!(
            component = name,
            device = %pipeline.device().name,
            width = pipeline.width(),
            height = pipeline.height(),
            "frame grabber initialized"
        );

        Ok(Self {
            name: name.to_owned(),
            config,
            lifecycle,
            ports,
            intrinsics,
            dispatcher,
            pipeline,
            upload_gate,
            control: Arc::new(Mutex::new(0)),
        })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration the grabber was built with.
    pub const fn config(&self) -> &GrabberConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// The device in use.
    pub const fn device(&self) -> &DeviceDescriptor {
        self.pipeline.device()
    }

    /// Negotiated capture width.
    pub const fn width(&self) -> u32 {
        self.pipeline.width()
    }

    /// Negotiated capture height.
    pub const fn height(&self) -> u32 {
        self.pipeline.height()
    }

    /// Frame statistics.
    pub fn dispatcher(&self) -> &FrameDispatcher<FrameProcessor> {
        &self.dispatcher
    }

    /// Start forwarding frames.
    ///
    /// Calling it while running does nothing. With a GPU upload gate that is
    /// not ready yet, the state becomes running at once but the graph only
    /// runs when the gate opens, unless the grabber was stopped or restarted
    /// in between.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Capture is running, or will run once the gate opens
    /// * `Err` - The capture graph refused to run; the previous state is kept
    pub fn start(&self) -> Result<()> {
        let mut generation = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if self.lifecycle.is_running() {
            debug!(component = %self.name, "already running");
            return Ok(());
        }
        *generation += 1;
        self.dispatcher.resync();

        if let Some(gate) = self.upload_gate.as_ref().filter(|gate| !gate.is_ready()) {
            self.lifecycle.set(LifecycleState::Running);
            let requested = *generation;
            // The gate may run the callback right away, which takes the lock.
            drop(generation);
            info!(component = %self.name, "GPU upload not ready, deferring capture start");
            gate.when_ready(self.deferred_start(requested));
            return Ok(());
        }

        let previous = self.lifecycle.state();
        self.lifecycle.set(LifecycleState::Running);
        if let Err(err) = self.pipeline.run() {
            self.lifecycle.set(previous);
            return Err(err);
        }
        info!(component = %self.name, "capture started");
        Ok(())
    }

    fn deferred_start(&self, requested: u64) -> ReadyCallback {
        let control = Arc::clone(&self.control);
        let lifecycle = Arc::clone(&self.lifecycle);
        let session = self.pipeline.session();
        let name = self.name.clone();
        Box::new(move || {
            let generation = control.lock().unwrap_or_else(PoisonError::into_inner);
            if *generation != requested || !lifecycle.is_running() {
                debug!(component = %name, "start superseded before GPU upload became ready");
                return;
            }
            match session.run() {
                Ok(()) => info!(component = %name, "deferred capture start"),
                Err(err) => {
                    warn!(component = %name, %err, "deferred capture start failed");
                    lifecycle.set(LifecycleState::Stopped);
                }
            }
        })
    }

    /// Pause the graph and stop forwarding frames.
    pub fn stop(&self) -> Result<()> {
        let mut generation = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.lifecycle.set(LifecycleState::Stopped);
        self.pipeline.pause()?;
        info!(component = %self.name, "capture stopped");
        Ok(())
    }

    /// Look up an image output by name.
    pub fn output(&self, name: &str) -> Result<&PushPort<Image>> {
        self.ports
            .get(name)
            .ok_or_else(|| GrabberError::UnknownPort(name.to_owned()))
    }

    /// Subscribe to the image output `name`.
    pub fn connect_output(&self, name: &str) -> Result<Receiver<Measurement<Image>>> {
        self.output(name).map(PushPort::connect)
    }

    /// Undistorted single-channel output.
    pub fn luminance_output(&self) -> &PushPort<Image> {
        &self.ports.luminance
    }

    /// Undistorted color output.
    pub fn color_output(&self) -> &PushPort<Image> {
        &self.ports.color
    }

    /// Unprocessed output.
    pub fn raw_output(&self) -> &PushPort<Image> {
        &self.ports.raw
    }

    /// The intrinsic matrix of the current camera model, stamped `timestamp`.
    pub fn intrinsics(&self, timestamp: Timestamp) -> Measurement<Matrix3> {
        Measurement::new(timestamp, self.intrinsics.intrinsic_matrix())
    }

    /// Deliver a replacement camera model on input `port`. It applies from
    /// the next processed frame on.
    pub fn push_camera_model(&self, port: &str, model: CameraModel) -> Result<()> {
        if !port.starts_with(INTRINSICS_INPUT_PREFIX) {
            return Err(GrabberError::UnknownPort(port.to_owned()));
        }
        debug!(component = %self.name, port, "camera model update");
        self.intrinsics.replace(model);
        Ok(())
    }
}

impl Drop for FrameGrabber {
    fn drop(&mut self) {
        let mut generation = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.lifecycle.set(LifecycleState::Stopped);
        if let Err(err) = self.pipeline.stop() {
            warn!(component = %self.name, %err, "failed to stop capture graph");
        }
        self.ports.luminance.disconnect_all();
        self.ports.color.disconnect_all();
        self.ports.raw.disconnect_all();
        drop(generation);
        debug!(component = %self.name, "frame grabber released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraModelSource;
    use crate::lifecycle::ReadinessLatch;
    use crate::mock::{SyntheticBackend, SyntheticCamera, SyntheticSpy};

    fn backend() -> (SyntheticBackend, SyntheticSpy) {
        let backend = SyntheticBackend::new().with_camera(SyntheticCamera::new("Cam", "/dev/cam0"));
        let spy = backend.spy();
        (backend, spy)
    }

    #[test]
    fn test_new_grabber_is_initializing() {
        let (backend, _) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");

        assert_eq!(grabber.state(), LifecycleState::Initializing);
        assert_eq!((grabber.width(), grabber.height()), (320, 240));
        assert!(grabber.dispatcher().is_armed());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (backend, spy) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");

        grabber.start().expect("start failed");
        grabber.start().expect("second start failed");

        let feed = spy.feed().expect("session connected");
        assert_eq!(grabber.state(), LifecycleState::Running);
        assert_eq!(feed.run_count(), 1);
    }

    #[test]
    fn test_stop_pauses_graph() {
        let (backend, spy) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");

        grabber.start().expect("start failed");
        grabber.stop().expect("stop failed");

        let feed = spy.feed().expect("session connected");
        assert_eq!(grabber.state(), LifecycleState::Stopped);
        assert!(!feed.is_running());
    }

    #[test]
    fn test_deferred_start_waits_for_gate() {
        let (backend, spy) = backend();
        let latch = Arc::new(ReadinessLatch::new());
        let config = GrabberConfig {
            upload_image_on_gpu: true,
            ..GrabberConfig::default()
        };
        let gate: Arc<dyn UploadGate> = Arc::clone(&latch) as Arc<dyn UploadGate>;
        let grabber =
            FrameGrabber::new("grabber", config, &backend, Some(gate)).expect("construction failed");
        let feed = spy.feed().expect("session connected");

        grabber.start().expect("start failed");
        assert_eq!(grabber.state(), LifecycleState::Running);
        assert!(!feed.is_running());

        latch.signal_ready();
        assert!(feed.is_running());
    }

    #[test]
    fn test_deferred_start_cancelled_by_stop() {
        let (backend, spy) = backend();
        let latch = Arc::new(ReadinessLatch::new());
        let config = GrabberConfig {
            upload_image_on_gpu: true,
            ..GrabberConfig::default()
        };
        let gate: Arc<dyn UploadGate> = Arc::clone(&latch) as Arc<dyn UploadGate>;
        let grabber =
            FrameGrabber::new("grabber", config, &backend, Some(gate)).expect("construction failed");
        let feed = spy.feed().expect("session connected");

        grabber.start().expect("start failed");
        grabber.stop().expect("stop failed");
        latch.signal_ready();

        assert!(!feed.is_running());
        assert_eq!(feed.run_count(), 0);
    }

    #[test]
    fn test_restart_while_gate_closed_runs_once() {
        let (backend, spy) = backend();
        let latch = Arc::new(ReadinessLatch::new());
        let config = GrabberConfig {
            upload_image_on_gpu: true,
            ..GrabberConfig::default()
        };
        let gate: Arc<dyn UploadGate> = Arc::clone(&latch) as Arc<dyn UploadGate>;
        let grabber =
            FrameGrabber::new("grabber", config, &backend, Some(gate)).expect("construction failed");
        let feed = spy.feed().expect("session connected");

        grabber.start().expect("start failed");
        grabber.stop().expect("stop failed");
        grabber.start().expect("restart failed");
        latch.signal_ready();

        assert!(feed.is_running());
        assert_eq!(feed.run_count(), 1);
    }

    #[test]
    fn test_concurrent_start_stop_keeps_graph_in_step() {
        let (backend, spy) = backend();
        let grabber = Arc::new(
            FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
                .expect("construction failed"),
        );
        let feed = spy.feed().expect("session connected");

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let grabber = Arc::clone(&grabber);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        if (worker + round) % 2 == 0 {
                            grabber.start().expect("start failed");
                        } else {
                            grabber.stop().expect("stop failed");
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert_eq!(
            feed.is_running(),
            grabber.state() == LifecycleState::Running
        );
        grabber.stop().expect("final stop failed");
        assert!(!feed.is_running());
    }

    #[test]
    fn test_gate_ignored_without_gpu_upload() {
        let (backend, spy) = backend();
        let latch: Arc<dyn UploadGate> = Arc::new(ReadinessLatch::new());
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, Some(latch))
            .expect("construction failed");

        grabber.start().expect("start failed");
        assert!(spy.feed().expect("session connected").is_running());
    }

    #[test]
    fn test_camera_model_input_prefix() {
        let (backend, _) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");
        let model = CameraModel {
            fx: 500.0,
            ..CameraModel::identity(320, 240)
        };

        grabber
            .push_camera_model("CameraModelLeft", model)
            .expect("prefixed port accepted");
        assert!(matches!(
            grabber.push_camera_model("Calibration", CameraModel::identity(320, 240)),
            Err(GrabberError::UnknownPort(_))
        ));

        let intrinsics = grabber.intrinsics(42);
        assert_eq!(intrinsics.timestamp, 42);
        let [[fx, ..], ..] = *intrinsics.value;
        assert!((fx - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unreadable_camera_model_is_fatal() {
        let (backend, spy) = backend();
        let config = GrabberConfig {
            camera_model: CameraModelSource::ModelFile("/nonexistent/model.toml".into()),
            ..GrabberConfig::default()
        };

        let result = FrameGrabber::new("grabber", config, &backend, None);
        assert!(matches!(result, Err(GrabberError::CameraModel { .. })));
        assert_eq!(spy.enumerations(), 0);
    }

    #[test]
    fn test_output_lookup() {
        let (backend, _) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");

        assert!(grabber.connect_output("OutputRAW").is_ok());
        assert!(grabber.raw_output().is_connected());
        assert!(matches!(
            grabber.output("Depth"),
            Err(GrabberError::UnknownPort(_))
        ));
    }

    #[test]
    fn test_drop_stops_graph() {
        let (backend, spy) = backend();
        let grabber = FrameGrabber::new("grabber", GrabberConfig::default(), &backend, None)
            .expect("construction failed");
        grabber.start().expect("start failed");

        drop(grabber);

        let feed = spy.feed().expect("session connected");
        assert_eq!(feed.stop_count(), 1);
        assert!(!feed.is_running());
    }
}
