use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(ValueEnum, Deserialize, Serialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Prefer CUDA, then Metal, falling back to the CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Resolves the preference to a concrete device. Explicit accelerators fail when the binary was
/// built without their feature or no such device exists.
#[tracing::instrument(level = "debug")]
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Auto if cuda_is_available() => Device::new_cuda(0)?,
        DevicePreference::Auto if metal_is_available() => Device::new_metal(0)?,
        DevicePreference::Auto | DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)?,
        DevicePreference::Metal => Device::new_metal(0)?,
    };
    Ok(device)
}

pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
