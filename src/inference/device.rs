use anyhow::{anyhow, Result};
use candle::Device;
use tracing::warn;

/// Compute target named by `EMBEDDING_DEVICE`, before any backend is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Accepts `cpu`, `cuda[:N]`, `gpu[:N]`, `mps` and `metal[:N]`.
    /// Unknown values fall back to CPU with a warning.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        let ordinal = || {
            trimmed
                .split(':')
                .nth(1)
                .and_then(|part| part.trim().parse::<usize>().ok())
                .unwrap_or(0)
        };

        if lower.is_empty() || lower == "cpu" {
            DeviceSpec::Cpu
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            DeviceSpec::Cuda(ordinal())
        } else if lower == "mps" || lower.starts_with("metal") {
            DeviceSpec::Metal(ordinal())
        } else {
            warn!(
                "unrecognized EMBEDDING_DEVICE value '{}', defaulting to cpu",
                trimmed
            );
            DeviceSpec::Cpu
        }
    }

    pub fn build(self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                anyhow!(
                    "failed to initialize CUDA device {} ({err}). Build with the `cuda` \
                     feature and ensure CUDA libraries are available.",
                    ordinal
                )
            }),
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal).map_err(|err| {
                anyhow!(
                    "failed to initialize Metal device {} ({err}). Build with the `metal` feature.",
                    ordinal
                )
            }),
        }
    }
}

pub fn build_device(value: &str) -> Result<Device> {
    DeviceSpec::parse(value).build()
}
