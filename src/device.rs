//! # Compute Device Selection
//!
//! Picks where the recognition model runs. `auto` prefers CUDA, then Metal,
//! then the CPU; an explicit GPU choice that is not available falls back to
//! the CPU with a warning instead of refusing to start.

use candle_core::Device;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(anyhow::anyhow!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Resolve the preference to a concrete device.
    pub fn select(self) -> Device {
        let device = match self {
            DevicePreference::Cpu => Some(Device::Cpu),
            DevicePreference::Cuda => cuda(),
            DevicePreference::Metal => metal(),
            DevicePreference::Auto => cuda().or_else(metal),
        };

        match device {
            Some(device) => {
                info!("Running recognition on {}", describe(&device));
                device
            }
            None if self == DevicePreference::Auto => {
                info!("No GPU available, running recognition on CPU");
                Device::Cpu
            }
            None => {
                warn!("Requested {:?} device is not available, falling back to CPU", self);
                Device::Cpu
            }
        }
    }
}

fn cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| debug!("CUDA not available: {}", e))
        .ok()
}

fn metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| debug!("Metal not available: {}", e))
        .ok()
}

pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
