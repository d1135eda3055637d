//! Capture pipeline construction: device selection, format negotiation,
//! camera controls and listener wiring.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::GrabberConfig;
use crate::negotiation::negotiate;
use crate::selector::select_device;
use crate::traits::{
    CameraControl, CaptureBackend, CaptureDevice, CaptureSession, ControlSetting,
    DeviceDescriptor, Format, FrameListener, GrabberError, Result, PREFERRED_PIXEL_FORMAT,
};

/// A connected capture graph: device -> listener -> discard.
pub struct CapturePipeline {
    device: DeviceDescriptor,
    format: Format,
    session: Arc<dyn CaptureSession>,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("device", &self.device)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl CapturePipeline {
    /// Build the pipeline on `backend` and register `listener` with it.
    ///
    /// Selects a device, negotiates the capture format, applies the camera
    /// controls and connects `listener`. The graph is left paused. Any
    /// failure aborts construction, except for camera controls, which are
    /// applied best-effort.
    ///
    /// # Arguments
    ///
    /// * `backend` - Capture system to enumerate and open devices on
    /// * `config` - Desired device, size, format preference and controls
    /// * `listener` - Receives every frame once the graph runs
    ///
    /// # Returns
    ///
    /// * `Ok(CapturePipeline)` - A paused graph delivering BGR24 frames
    /// * `Err(GrabberError::DeviceNotFound)` - Nothing to capture from
    /// * `Err(GrabberError::UnsupportedFormat)` - No capability of the desired
    ///   size, or the connected format is not BGR24
    pub fn build<B: CaptureBackend>(
        backend: &B,
        config: &GrabberConfig,
        listener: Arc<dyn FrameListener>,
    ) -> Result<Self> {
        let candidates = backend.enumerate()?;
        let device = select_device(
            &candidates,
            config.device_name.as_deref(),
            config.device_path.as_deref(),
        )?
        .clone();

        let mut opened = backend.open(&device)?;

        let capabilities = opened.capabilities()?;
        let capability = negotiate(
            &capabilities,
            config.desired_width,
            config.desired_height,
            config.format_preference,
        )?;
        opened.set_format(&capability)?;

        let applied = apply_controls(&mut opened, &config.controls);
        if applied < config.controls.len() {
            warn!(
                applied,
                requested = config.controls.len(),
                "not all camera controls were accepted"
            );
        }

        let session = opened.connect(listener)?;
        let format = session.connected_format();
        if format.pixel_format != PREFERRED_PIXEL_FORMAT {
            // Dropping the session here stops whatever the backend started.
            return Err(GrabberError::UnsupportedFormat(format!(
                "connected media type is {}, need {PREFERRED_PIXEL_FORMAT}",
                format.pixel_format
            )));
        }

        info!(
            width = format.width,
            height = format.height,
            fps = capability.fps,
            "image dimensions"
        );

        session.pause()?;

        Ok(Self {
            device,
            format,
            session: Arc::new(session),
        })
    }

    /// The selected device.
    pub const fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// The negotiated frame format.
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Negotiated width.
    pub const fn width(&self) -> u32 {
        self.format.width
    }

    /// Negotiated height.
    pub const fn height(&self) -> u32 {
        self.format.height
    }

    /// Shared handle to the run-state control.
    pub fn session(&self) -> Arc<dyn CaptureSession> {
        Arc::clone(&self.session)
    }

    /// Start delivering frames.
    pub fn run(&self) -> Result<()> {
        self.session.run()
    }

    /// Suspend delivery.
    pub fn pause(&self) -> Result<()> {
        self.session.pause()
    }

    /// Stop the graph completely.
    pub fn stop(&self) -> Result<()> {
        self.session.stop()
    }
}

/// Apply `controls` in order; returns how many were accepted.
fn apply_controls<D: CaptureDevice>(
    device: &mut D,
    controls: &[(CameraControl, ControlSetting)],
) -> usize {
    let mut applied = 0;
    for &(control, setting) in controls {
        match device.set_control(control, setting) {
            Ok(()) => {
                info!(%control, value = setting.value, mode = ?setting.mode, "camera control set");
                applied += 1;
            }
            Err(err) => warn!(%err, "camera control not applied"),
        }
    }
    applied
}
