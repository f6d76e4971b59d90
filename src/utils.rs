use std::path::Path;

use tracing::{debug, info, warn};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Auto-detect best capture device.
///
/// Memory-to-memory codec nodes also advertise capture queues, so only
/// single-purpose capture devices are considered. An MJPEG-capable camera
/// wins over raw-only ones.
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..64 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || caps.capabilities.contains(Flags::VIDEO_M2M)
        {
            continue;
        }
        let Ok(formats) = Capture::enum_formats(&dev) else {
            continue;
        };

        let formats: Vec<PixelFormat> = formats
            .iter()
            .filter_map(|f| PixelFormat::from_fourcc(f.fourcc))
            .collect();
        debug!("{} ({}) offers {:?}", path, caps.card, formats);

        if formats.contains(&PixelFormat::Mjpeg) {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            return Ok(FoundDevice {
                path,
                format: PixelFormat::Mjpeg,
            });
        }
        if fallback.is_none() {
            if let Some(format) = formats.into_iter().find(|f| !f.is_compressed()) {
                info!("Found {} device: {} - {}", format, path, caps.card);
                fallback = Some(FoundDevice { path, format });
            }
        }
    }

    fallback.ok_or_else(|| Error::device("/dev/video*", "no suitable capture device found"))
}

/// Pin the calling thread to `core`; false when the core doesn't exist
pub fn pin_current_thread(core: usize) -> bool {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.into_iter().find(|c| c.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            info!("Pinned to core {}", core);
            true
        }
        _ => {
            warn!("Could not pin to core {}", core);
            false
        }
    }
}
