use std::path::Path;
use std::sync::Arc;

use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, OrtError, Session, SessionBuilder};
use serde::{Deserialize, Serialize};

/// Device requested in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cuda,
    Mps,
    Cpu,
}

/// Device the process runs inference on, as reported by `/ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Device {
    #[serde(rename = "CUDA")]
    Cuda,
    #[serde(rename = "MPS")]
    Mps,
    #[serde(rename = "CPU")]
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "CUDA",
            Device::Mps => "MPS",
            Device::Cpu => "CPU",
        }
    }

    fn execution_provider(&self) -> Option<ExecutionProvider> {
        match self {
            Device::Cuda => Some(ExecutionProvider::CUDA(Default::default())),
            Device::Mps => Some(ExecutionProvider::CoreML(Default::default())),
            Device::Cpu => None,
        }
    }

    fn is_available(&self) -> bool {
        self.execution_provider()
            .map(|ep| ep.is_available())
            .unwrap_or(true)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the device once per process: Apple accelerator, then CUDA, then CPU.
/// A pinned preference that is not available also falls back to CPU.
pub fn probe(preference: DevicePreference) -> Device {
    let candidates: &[Device] = match preference {
        DevicePreference::Auto => &[Device::Mps, Device::Cuda],
        DevicePreference::Mps => &[Device::Mps],
        DevicePreference::Cuda => &[Device::Cuda],
        DevicePreference::Cpu => &[],
    };

    for device in candidates {
        if device.is_available() {
            tracing::info!(%device, "using accelerator");
            return *device;
        }
        tracing::info!(%device, "device not available");
    }

    tracing::info!("using CPU device");
    Device::Cpu
}

pub fn environment() -> Result<Arc<Environment>, OrtError> {
    Ok(Arc::new(Environment::builder().with_name("EasyEarth").build()?))
}

/// Build a session on `device`, retrying on CPU if the provider refuses.
pub fn build_session(env: &Arc<Environment>, device: Device, model: &Path) -> Result<Session, OrtError> {
    if let Some(provider) = device.execution_provider() {
        let accelerated = SessionBuilder::new(env)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([provider])
            .and_then(|builder| builder.with_model_from_file(model));
        match accelerated {
            Ok(session) => {
                tracing::debug!(model = %model.display(), %device, "session ready");
                return Ok(session);
            }
            Err(e) => {
                tracing::warn!(model = %model.display(), %device, error = %e, "falling back to CPU");
            }
        }
    }

    let session = SessionBuilder::new(env)?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_model_from_file(model)?;
    tracing::debug!(model = %model.display(), device = "CPU", "session ready");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_skips_probing() {
        assert_eq!(probe(DevicePreference::Cpu), Device::Cpu);
    }

    #[test]
    fn auto_probe_reports_a_known_device() {
        let device = probe(DevicePreference::Auto);
        assert!(["CUDA", "MPS", "CPU"].contains(&device.as_str()));
    }

    #[test]
    fn device_serializes_in_upper_case() {
        assert_eq!(serde_json::to_value(Device::Cuda).unwrap(), "CUDA");
        assert_eq!(serde_json::to_value(Device::Mps).unwrap(), "MPS");
        assert_eq!(serde_json::to_value(Device::Cpu).unwrap(), "CPU");
    }

    #[test]
    fn preference_parses_lower_case() {
        let pref: DevicePreference = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(pref, DevicePreference::Cuda);
        assert_eq!(DevicePreference::default(), DevicePreference::Auto);
    }
}
