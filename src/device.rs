//! # Compute Device Selection
//!
//! Picks the candle device the emotion model runs on. `auto` prefers CUDA, then
//! Metal, then CPU; explicit GPU preferences fall back to CPU when the device
//! cannot be opened.

use candle_core::Device;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Result of auto-detection, computed once per process.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

fn try_cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| debug!(error = %e, "CUDA unavailable"))
        .ok()
}

fn try_metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| debug!(error = %e, "Metal unavailable"))
        .ok()
}

fn auto_device() -> Device {
    AUTO_DEVICE
        .get_or_init(|| {
            let device = try_cuda().or_else(try_metal).unwrap_or(Device::Cpu);
            info!(device = %device_label(&device), "Selected inference device");
            device
        })
        .clone()
}

pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => auto_device(),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => try_cuda().unwrap_or_else(|| {
            warn!("CUDA requested but not available, using CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => try_metal().unwrap_or_else(|| {
            warn!("Metal requested but not available, using CPU");
            Device::Cpu
        }),
    }
}

/// Resolve a device from the `models.device` config string.
///
/// Unknown values are logged and treated as `auto`.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => select_device(preference),
        Err(_) => {
            warn!(device = %device_str, "Invalid device preference, using auto");
            auto_device()
        }
    }
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Which accelerators this build can use, reported by the classifier status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub configured: String,
    pub cuda_available: bool,
    pub metal_available: bool,
}

impl DeviceSummary {
    pub fn detect(configured: &str) -> Self {
        Self {
            configured: configured.to_string(),
            cuda_available: candle_core::utils::cuda_is_available(),
            metal_available: candle_core::utils::metal_is_available(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_is_cpu() {
        let device = create_device_from_string("cpu");
        assert_eq!(device_label(&device), "cpu");
    }

    #[test]
    fn test_device_summary_keeps_configured_value() {
        let summary = DeviceSummary::detect("auto");
        assert_eq!(summary.configured, "auto");
    }
}
