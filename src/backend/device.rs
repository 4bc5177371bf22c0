// src/backend/device.rs
use crate::backend::accelerator::AcceleratorRuntime;
use crate::error::{AutogradError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Physical execution target a storage buffer resides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Host,
    Accelerator,
}

impl Backend {
    pub fn is_host(&self) -> bool {
        matches!(self, Backend::Host)
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Backend::Accelerator)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Host => write!(f, "host"),
            Backend::Accelerator => write!(f, "accelerator"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = AutogradError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Backend::Host),
            "accelerator" | "cuda" | "gpu" => Ok(Backend::Accelerator),
            other => Err(AutogradError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Device context owned by a graph.
///
/// Holds the backend new tensors are created on and, when one is attached,
/// the accelerator runtime. Changing the active backend never relocates
/// tensors that already exist.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    active: Backend,
    accelerator: Option<Arc<dyn AcceleratorRuntime>>,
}

impl DeviceRegistry {
    /// Host-only registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accelerator(runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        info!(runtime = runtime.name(), "accelerator attached");
        Self {
            active: Backend::Host,
            accelerator: Some(runtime),
        }
    }

    pub fn active_backend(&self) -> Backend {
        self.active
    }

    pub fn set_active_backend(&mut self, backend: Backend) -> Result<()> {
        if backend.is_accelerator() && self.accelerator.is_none() {
            return Err(AutogradError::BackendUnavailable(backend));
        }
        if backend != self.active {
            info!(from = %self.active, to = %backend, "active backend changed");
        }
        self.active = backend;
        Ok(())
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }

    pub fn accelerator(&self) -> Result<&Arc<dyn AcceleratorRuntime>> {
        self.accelerator
            .as_ref()
            .ok_or(AutogradError::BackendUnavailable(Backend::Accelerator))
    }
}
