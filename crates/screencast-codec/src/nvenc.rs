//! NVENC hardware availability probe.
//!
//! Hardware encode sessions are not wired up; the probe exists so the
//! encoder factory and diagnostics can report what the machine has.

#[cfg(all(windows, feature = "nvenc"))]
mod nvenc_impl {
    use std::sync::OnceLock;

    use nvidia_video_codec_sdk::safe::api::ENCODE_API;
    use tracing::{debug, info};

    static NVENC_AVAILABLE: OnceLock<bool> = OnceLock::new();

    /// Check if NVENC is available on this system.
    pub fn check_nvenc_available() -> bool {
        *NVENC_AVAILABLE.get_or_init(|| match ENCODE_API.lock() {
            Ok(_) => {
                info!("NVENC API available");
                true
            }
            Err(e) => {
                debug!("NVENC not available: {:?}", e);
                false
            }
        })
    }
}

#[cfg(not(all(windows, feature = "nvenc")))]
mod nvenc_impl {
    use tracing::debug;

    /// NVENC is not available on non-Windows or without the nvenc feature.
    pub fn check_nvenc_available() -> bool {
        debug!("NVENC support not compiled in (requires Windows + nvenc feature)");
        false
    }
}

/// Check if an NVENC-capable driver is present.
pub fn nvenc_available() -> bool {
    nvenc_impl::check_nvenc_available()
}

/// Check if NVENC support is compiled into this build.
pub fn is_compiled_with_nvenc() -> bool {
    cfg!(all(windows, feature = "nvenc"))
}
