// src/config.rs
// Engine configuration. Defaults can be overridden from the environment:
//
//   FERROGRAD_BACKEND               host | accelerator
//   FERROGRAD_ACCELERATOR           none | reference | cuda
//   FERROGRAD_ACCELERATOR_CAPACITY  element capacity of the reference device
//   FERROGRAD_CUDA_DEVICE           CUDA device ordinal
use crate::backend::{Backend, DeviceRegistry, ReferenceAccelerator};
use crate::error::{AutogradError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const ENV_BACKEND: &str = "FERROGRAD_BACKEND";
pub const ENV_ACCELERATOR: &str = "FERROGRAD_ACCELERATOR";
pub const ENV_ACCELERATOR_CAPACITY: &str = "FERROGRAD_ACCELERATOR_CAPACITY";
pub const ENV_CUDA_DEVICE: &str = "FERROGRAD_CUDA_DEVICE";

/// Which accelerator runtime, if any, a graph is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AcceleratorChoice {
    #[default]
    None,
    Reference {
        #[serde(default)]
        capacity: Option<usize>,
    },
    Cuda {
        #[serde(default)]
        ordinal: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend new tensors are created on.
    pub backend: Backend,
    pub accelerator: AcceleratorChoice,
}

impl EngineConfig {
    pub fn host() -> Self {
        Self::default()
    }

    /// Reference accelerator attached, tensors still created on the host.
    pub fn reference() -> Self {
        Self {
            backend: Backend::Host,
            accelerator: AcceleratorChoice::Reference { capacity: None },
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(backend) = lookup(ENV_BACKEND) {
            config.backend = backend.parse()?;
        }

        let capacity = lookup(ENV_ACCELERATOR_CAPACITY)
            .map(|v| parse_number(ENV_ACCELERATOR_CAPACITY, &v))
            .transpose()?;
        let ordinal = lookup(ENV_CUDA_DEVICE)
            .map(|v| parse_number(ENV_CUDA_DEVICE, &v))
            .transpose()?
            .unwrap_or(0);

        config.accelerator = match lookup(ENV_ACCELERATOR).as_deref().map(str::trim) {
            None | Some("") => {
                if config.backend.is_accelerator() {
                    // An accelerator backend needs some runtime behind it.
                    AcceleratorChoice::Reference { capacity }
                } else {
                    AcceleratorChoice::None
                }
            }
            Some("none") => AcceleratorChoice::None,
            Some("reference") => AcceleratorChoice::Reference { capacity },
            Some("cuda") => AcceleratorChoice::Cuda { ordinal },
            Some(other) => {
                return Err(AutogradError::Config(format!(
                    "{} must be none, reference or cuda, got '{}'",
                    ENV_ACCELERATOR, other
                )));
            }
        };
        Ok(config)
    }

    /// Materializes the device context this configuration describes.
    pub fn build_registry(&self) -> Result<DeviceRegistry> {
        let mut registry = match self.accelerator {
            AcceleratorChoice::None => DeviceRegistry::new(),
            AcceleratorChoice::Reference { capacity } => {
                let runtime = match capacity {
                    Some(elements) => ReferenceAccelerator::with_capacity(elements),
                    None => ReferenceAccelerator::new(),
                };
                DeviceRegistry::with_accelerator(Arc::new(runtime))
            }
            AcceleratorChoice::Cuda { ordinal } => cuda_registry(ordinal)?,
        };
        if self.backend.is_accelerator() && !registry.has_accelerator() {
            warn!("accelerator backend requested without an accelerator runtime");
        }
        registry.set_active_backend(self.backend)?;
        Ok(registry)
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| AutogradError::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

#[cfg(feature = "cuda")]
fn cuda_registry(ordinal: usize) -> Result<DeviceRegistry> {
    let runtime = crate::backend::CudaAccelerator::new(ordinal)?;
    Ok(DeviceRegistry::with_accelerator(Arc::new(runtime)))
}

#[cfg(not(feature = "cuda"))]
fn cuda_registry(ordinal: usize) -> Result<DeviceRegistry> {
    warn!(ordinal, "CUDA accelerator requested but the cuda feature is disabled");
    Err(AutogradError::Config(
        "the cuda accelerator requires building with the `cuda` feature".to_string(),
    ))
}
