//! Compute device probe and capability record.
//!
//! The probe runs once at session start. Kernel dispatch and loader policy
//! consult the resulting [`DeviceCaps`]. When compiled without the `cuda`
//! feature, the host reference device is reported (unified memory, fp16
//! arithmetic through `half`, no subgroup operations).

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineResult;

/// Capabilities of the compute device the session runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Device name for diagnostics.
    pub name: String,

    /// Native 16-bit float arithmetic.
    pub fp16: bool,

    /// Subgroup (warp/wave) operations.
    pub subgroups: bool,

    /// Subgroup operations on 16-bit floats.
    pub subgroups_fp16: bool,

    /// Host and device share one address space (no explicit transfers).
    pub unified_memory: bool,

    /// Largest single buffer the device accepts, in bytes.
    pub max_buffer_bytes: u64,
}

impl DeviceCaps {
    /// The host reference device. Always available; every kernel runs
    /// through the host execution path.
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            fp16: true,
            subgroups: false,
            subgroups_fp16: false,
            unified_memory: true,
            max_buffer_bytes: 1 << 31,
        }
    }

    /// Capability record of a discrete device with full feature support.
    /// Used by variant-selection tests.
    pub fn full_featured() -> Self {
        Self {
            name: "test-discrete".to_string(),
            fp16: true,
            subgroups: true,
            subgroups_fp16: true,
            unified_memory: false,
            max_buffer_bytes: 1 << 31,
        }
    }

    /// Minimal capability record: f32 only, no subgroups.
    /// Used by variant-selection tests.
    pub fn minimal() -> Self {
        Self {
            name: "test-minimal".to_string(),
            fp16: false,
            subgroups: false,
            subgroups_fp16: false,
            unified_memory: false,
            max_buffer_bytes: 1 << 28,
        }
    }

    /// Log an advisory when a model's resident weight set is close to the
    /// device buffer bound. MoE models mitigate this by loading experts
    /// lazily; dense models cannot.
    pub fn warn_if_tight(&self, required_bytes: u64, is_moe: bool) {
        if required_bytes > self.max_buffer_bytes {
            warn!(
                required_bytes,
                max_buffer_bytes = self.max_buffer_bytes,
                is_moe,
                "model resident set exceeds device buffer bound{}",
                if is_moe {
                    "; experts will be hydrated on demand"
                } else {
                    ""
                }
            );
        }
    }
}

/// Probe the compute device once at session start.
///
/// With the `cuda` feature enabled, enumerates devices through the CUDA
/// runtime. Without it, reports the host reference device.
pub fn probe() -> EngineResult<DeviceCaps> {
    #[cfg(feature = "cuda")]
    {
        probe_cuda()
    }

    #[cfg(not(feature = "cuda"))]
    {
        let caps = DeviceCaps::host();
        info!(device = %caps.name, "CUDA not enabled, using host execution path");
        Ok(caps)
    }
}

#[cfg(feature = "cuda")]
fn probe_cuda() -> EngineResult<DeviceCaps> {
    // Real implementation would use cudarc to enumerate devices and read
    // attributes (warp size, fp16 throughput, max allocation).
    // TODO(cuda): enumerate via cudarc::driver and map device attributes.
    Err(crate::error::EngineError::DeviceUnavailable(
        "cudarc device enumeration not wired up".to_string(),
    ))
}
