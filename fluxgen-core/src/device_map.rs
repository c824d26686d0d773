use std::fmt;

use candle_core::Device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// The compute backend a run executes on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Metal,
    Cuda,
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metal => write!(f, "Metal"),
            Self::Cuda => write!(f, "CUDA"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

/// A backend together with the opened candle device. Chosen once per run.
#[derive(Clone, Debug)]
pub struct SelectedDevice {
    pub backend: Backend,
    pub device: Device,
}

impl SelectedDevice {
    pub fn cpu() -> Self {
        Self {
            backend: Backend::Cpu,
            device: Device::Cpu,
        }
    }

    pub fn is_metal(&self) -> bool {
        self.backend == Backend::Metal
    }
}
