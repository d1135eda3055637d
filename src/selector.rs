//! Capture device selection.

use tracing::{info, warn};

use crate::traits::{DeviceDescriptor, GrabberError, Result};

/// Pick the device to capture from.
///
/// The first candidate whose name contains `desired_name` wins; if
/// `desired_path` is given, a candidate whose path contains it as well is
/// preferred over name-only matches. Without a desired name, or when nothing
/// matches, the first enumerated device is used.
///
/// # Errors
///
/// Returns `DeviceNotFound` if `candidates` is empty.
pub fn select_device<'a>(
    candidates: &'a [DeviceDescriptor],
    desired_name: Option<&str>,
    desired_path: Option<&str>,
) -> Result<&'a DeviceDescriptor> {
    for candidate in candidates {
        info!(name = %candidate.name, path = %candidate.path, "possible capture device");
    }

    let first = candidates.first().ok_or(GrabberError::DeviceNotFound)?;

    let Some(name) = desired_name else {
        info!(name = %first.name, "using camera");
        return Ok(first);
    };

    let mut by_name = candidates
        .iter()
        .filter(|candidate| candidate.name.contains(name));

    let selected = match desired_path {
        Some(path) => {
            let by_name: Vec<&DeviceDescriptor> = by_name.collect();
            by_name
                .iter()
                .find(|candidate| candidate.path.contains(path))
                .or_else(|| by_name.first())
                .copied()
        }
        None => by_name.next(),
    };

    let selected = selected.unwrap_or_else(|| {
        warn!(desired = name, fallback = %first.name, "no device matches desired name");
        first
    });

    info!(name = %selected.name, path = %selected.path, "using camera");
    Ok(selected)
}
