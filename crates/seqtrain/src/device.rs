use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

use crate::config::DevicePreference;

const FORCE_CPU_ENV: &str = "CANDLE_FORCE_CPU";

/// Picks the compute device. Setting `CANDLE_FORCE_CPU` pins the CPU;
/// accelerators that fail to initialise fall back to it as well.
pub fn select_device(preference: DevicePreference) -> Device {
    if std::env::var_os(FORCE_CPU_ENV).is_some() {
        tracing::info!("{FORCE_CPU_ENV} set; using CPU");
        return Device::Cpu;
    }

    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_or_cpu(),
        DevicePreference::Metal => metal_or_cpu(),
        DevicePreference::Auto => {
            if metal_is_available() {
                metal_or_cpu()
            } else if cuda_is_available() {
                cuda_or_cpu()
            } else {
                Device::Cpu
            }
        }
    };

    tracing::info!(
        cuda = device.is_cuda(),
        metal = device.is_metal(),
        cpu = device.is_cpu(),
        "device selected"
    );
    device
}

fn cuda_or_cpu() -> Device {
    match Device::new_cuda(0) {
        Ok(device) => device,
        Err(err) => {
            tracing::warn!(%err, "failed to initialise CUDA device, falling back to CPU");
            Device::Cpu
        }
    }
}

fn metal_or_cpu() -> Device {
    match Device::new_metal(0) {
        Ok(device) => device,
        Err(err) => {
            tracing::warn!(%err, "failed to initialise Metal device, falling back to CPU");
            Device::Cpu
        }
    }
}
