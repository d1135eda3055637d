//! Capture format negotiation.

use std::cmp::Ordering;
use std::str::FromStr;

use tracing::{debug, info};

use crate::traits::{FormatCapability, GrabberError, Result, PREFERRED_PIXEL_FORMAT};

/// Tie-break between correctly sized candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPreference {
    /// Preferred layout first, then the highest frame rate.
    #[default]
    LayoutThenFrameRate,
    /// Highest frame rate first, then the preferred layout.
    FrameRateThenLayout,
    /// The first correctly sized entry, replaced by the first one in the
    /// preferred layout if there is one.
    FirstMatch,
}

impl FromStr for FormatPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "layoutThenFrameRate" => Ok(Self::LayoutThenFrameRate),
            "frameRateThenLayout" => Ok(Self::FrameRateThenLayout),
            "firstMatch" => Ok(Self::FirstMatch),
            other => Err(format!(
                "unknown format preference {other:?} \
                 (expected layoutThenFrameRate, frameRateThenLayout or firstMatch)"
            )),
        }
    }
}

/// Whether `capability` has the desired size. Non-positive desired
/// dimensions match anything.
fn matches_size(capability: &FormatCapability, desired_width: i32, desired_height: i32) -> bool {
    let width_ok = desired_width <= 0 || i64::from(capability.width) == i64::from(desired_width);
    let height_ok =
        desired_height <= 0 || i64::from(capability.height) == i64::from(desired_height);
    width_ok && height_ok
}

fn is_preferred(capability: &FormatCapability) -> bool {
    capability.pixel_format == PREFERRED_PIXEL_FORMAT
}

/// Ordering under `preference`; `Greater` means `a` is the better candidate.
fn compare(a: &FormatCapability, b: &FormatCapability, preference: FormatPreference) -> Ordering {
    let layout = is_preferred(a).cmp(&is_preferred(b));
    let rate = a.fps.total_cmp(&b.fps);
    match preference {
        FormatPreference::LayoutThenFrameRate => layout.then(rate),
        FormatPreference::FrameRateThenLayout => rate.then(layout),
        FormatPreference::FirstMatch => layout,
    }
}

/// Pick a capture format from the advertised `capabilities`.
///
/// Only entries matching the desired size are considered. Among those the
/// best one under `preference` wins; on a full tie the earliest entry is kept.
///
/// # Errors
///
/// Returns `UnsupportedFormat` if no entry has the desired size.
pub fn negotiate(
    capabilities: &[FormatCapability],
    desired_width: i32,
    desired_height: i32,
    preference: FormatPreference,
) -> Result<FormatCapability> {
    let mut best: Option<&FormatCapability> = None;

    for capability in capabilities {
        debug!(%capability, "advertised media type");

        if !matches_size(capability, desired_width, desired_height) {
            continue;
        }

        best = match best {
            Some(current) if compare(capability, current, preference) != Ordering::Greater => {
                Some(current)
            }
            _ => Some(capability),
        };
    }

    let chosen = best.copied().ok_or_else(|| {
        GrabberError::UnsupportedFormat(format!(
            "no advertised format matches {desired_width}x{desired_height}"
        ))
    })?;

    info!(format = %chosen, "selected capture format");
    Ok(chosen)
}
