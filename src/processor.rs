//! Turns dispatched frames into published image measurements.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::frame::{ChannelSeq, Image};
use crate::ports::{Measurement, PushPort, Timestamp};
use crate::traits::{FrameSample, Result};
use crate::undistort::SharedIntrinsics;

/// Name of the luminance output.
pub const LUMINANCE_OUTPUT: &str = "Output";
/// Name of the color output.
pub const COLOR_OUTPUT: &str = "ColorOutput";
/// Name of the raw passthrough output.
pub const RAW_OUTPUT: &str = "OutputRAW";

/// Receives validated, timestamped frames from the dispatcher.
pub trait FrameSink: Send + Sync {
    /// Handle one frame. Called synchronously from the capture callback.
    fn handle_frame(&self, timestamp: Timestamp, sample: &FrameSample<'_>);
}

/// The image output ports of a grabber.
#[derive(Debug)]
pub struct OutputPorts {
    /// Undistorted single-channel images.
    pub luminance: PushPort<Image>,
    /// Resized, undistorted color images.
    pub color: PushPort<Image>,
    /// Untouched frames.
    pub raw: PushPort<Image>,
}

impl Default for OutputPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPorts {
    /// Create the three unconnected ports.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            luminance: PushPort::new(LUMINANCE_OUTPUT),
            color: PushPort::new(COLOR_OUTPUT),
            raw: PushPort::new(RAW_OUTPUT),
        }
    }

    /// Look a port up by name.
    pub fn get(&self, name: &str) -> Option<&PushPort<Image>> {
        [&self.luminance, &self.color, &self.raw]
            .into_iter()
            .find(|port| port.name() == name)
    }
}

/// Resizes, undistorts and color-converts frames for whichever outputs are
/// connected.
#[derive(Debug)]
pub struct FrameProcessor {
    desired_width: i32,
    desired_height: i32,
    ports: Arc<OutputPorts>,
    intrinsics: Arc<SharedIntrinsics>,
}

impl FrameProcessor {
    /// Create a processor publishing to `ports`. Color output larger than
    /// the desired size is downsampled to it.
    #[must_use]
    pub const fn new(
        desired_width: i32,
        desired_height: i32,
        ports: Arc<OutputPorts>,
        intrinsics: Arc<SharedIntrinsics>,
    ) -> Self {
        Self {
            desired_width,
            desired_height,
            ports,
            intrinsics,
        }
    }

    /// Target size if `image` exceeds it, `None` if it should pass unresized.
    fn downsample_target(&self, image: &Image) -> Option<(u32, u32)> {
        let width = u32::try_from(self.desired_width).ok().filter(|w| *w > 0)?;
        let height = u32::try_from(self.desired_height).ok().filter(|h| *h > 0)?;
        (image.width() > width || image.height() > height).then_some((width, height))
    }

    /// Produce and publish the outputs for one raw frame.
    pub fn process(&self, timestamp: Timestamp, raw: &Image) -> Result<()> {
        let ports = &self.ports;

        if ports.raw.is_connected() {
            ports.raw.send(&Measurement::new(timestamp, raw.clone()));
        }

        let want_color = ports.color.is_connected();
        let want_luminance = ports.luminance.is_connected();
        if !want_color && !want_luminance {
            return Ok(());
        }

        // One snapshot per frame: an intrinsics update lands on the next one.
        let undistorter = self.intrinsics.current();

        let mut color = match self.downsample_target(raw) {
            Some((width, height)) => {
                debug!(width, height, "downsampling");
                Some(raw.resize(width, height)?)
            }
            None => None,
        };

        if want_color {
            let source = color.take().unwrap_or_else(|| raw.clone());
            let corrected = undistorter
                .undistort(source)?
                .with_channel_seq(ChannelSeq::Bgr)?;
            ports
                .color
                .send(&Measurement::new(timestamp, corrected.clone()));
            color = Some(corrected);
        }

        if want_luminance {
            let gray = color.as_ref().unwrap_or(raw).to_luma()?;
            ports
                .luminance
                .send(&Measurement::new(timestamp, undistorter.undistort(gray)?));
        }

        Ok(())
    }
}

impl FrameSink for FrameProcessor {
    fn handle_frame(&self, timestamp: Timestamp, sample: &FrameSample<'_>) {
        let ports = &self.ports;
        if !ports.raw.is_connected() && !ports.color.is_connected() && !ports.luminance.is_connected()
        {
            return;
        }

        let result = Image::from_sample(sample).and_then(|raw| self.process(timestamp, &raw));
        if let Err(err) = result {
            warn!(%err, "frame processing failed");
        }
    }
}
