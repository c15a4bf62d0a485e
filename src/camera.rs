//! Camera discovery
//!
//! Cameras are V4L2 device nodes (`/dev/videoN`). Only the first few ports
//! are scanned.

use crate::error::CheckoutError;
use std::path::{Path, PathBuf};

/// Ports scanned during discovery
pub const SCANNED_PORTS: u32 = 5;

/// Device directory scanned in production
pub const DEVICE_ROOT: &str = "/dev";

/// Path of the device node for a port
pub fn device_path(root: &Path, port: u32) -> PathBuf {
    root.join(format!("video{port}"))
}

/// Ports with a device node under `root`
pub fn discover_cameras(root: &Path) -> Vec<u32> {
    (0..SCANNED_PORTS)
        .filter(|port| {
            let path = device_path(root, *port);
            tracing::debug!("Looking for a camera in port {port}: {}", path.display());
            path.exists()
        })
        .inspect(|port| tracing::info!("Camera found in port {port}"))
        .collect()
}

/// Pick the camera to run on.
///
/// An explicit index always wins. Otherwise exactly one camera must be
/// present.
pub fn select_camera(explicit: Option<u32>, found: &[u32]) -> Result<u32, CheckoutError> {
    if let Some(port) = explicit {
        return Ok(port);
    }
    match found {
        [] => Err(CheckoutError::NoCamera),
        [port] => Ok(*port),
        many => Err(CheckoutError::AmbiguousCamera(many.to_vec())),
    }
}
