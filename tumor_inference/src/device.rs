use candle_core::Device;
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Compute device requested in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl ComputeDevice {
    /// Opens the requested device, falling back to the CPU when the accelerator is missing
    /// or the crate was built without support for it.
    pub fn resolve(self) -> Device {
        let device = match self {
            Self::Cpu => return Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal),
            Self::Metal(ordinal) => Device::new_metal(ordinal),
        };

        match device {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("Device {} unavailable, falling back to cpu: {}", self, e);
                Device::Cpu
            }
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal(i) => write!(f, "metal:{i}"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, ordinal) = match s.trim().split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("{} is not a valid device ordinal", ordinal))?;
                (kind, ordinal)
            }
            None => (s.trim(), 0),
        };

        match kind.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            other => Err(format!(
                "{} is not a supported device. Use either `cpu`, `cuda[:N]` or `metal[:N]`.",
                other
            )),
        }
    }
}

impl TryFrom<String> for ComputeDevice {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
