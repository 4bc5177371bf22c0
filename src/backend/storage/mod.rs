mod accelerator;
mod host;

pub use accelerator::AcceleratorStorage;
pub use host::HostStorage;

use crate::backend::kernel::{BinaryOp, GradOp, UnaryOp};
use crate::backend::{Backend, DeviceRegistry};
use crate::error::{AutogradError, Result};
use crate::shape::Shape;
use std::any::Any;
use std::fmt::Debug;
use tracing::debug;

/// Trait for the physical storage of a buffer on one backend.
/// Every kernel returns a fresh storage and leaves its inputs untouched,
/// except `write`, `fill` and `axpy` which mutate `self` in place.
pub trait StorageBackend: Debug + Any {
    /// Backend the elements physically reside on
    fn backend(&self) -> Backend;

    /// Get tensor shape
    fn shape(&self) -> &[usize];

    // Downcasting to the concrete storage of the other operand
    fn as_any(&self) -> &dyn Any;

    /// Total number of elements
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    fn clone_storage(&self) -> Result<Box<dyn StorageBackend>>;

    /// Copies the elements to a host vector in row-major order.
    /// On an accelerator this waits for all outstanding launches.
    fn to_vec(&self) -> Result<Vec<f32>>;

    fn write(&mut self, values: &[f32]) -> Result<()>;

    fn fill(&mut self, value: f32) -> Result<()>;

    /// Elementwise `self op other`. Shapes must be equal or one side rank-0.
    fn binary(&self, op: BinaryOp, other: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>>;

    fn unary(&self, op: UnaryOp) -> Result<Box<dyn StorageBackend>>;

    /// Fused local derivative with `self` as the upstream gradient.
    fn gradient(&self, op: GradOp, saved: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>>;

    /// Sum of every element as a rank-0 storage
    fn sum_all(&self) -> Result<Box<dyn StorageBackend>>;

    /// Repeats a single element into `shape`.
    fn expand(&self, shape: &[usize]) -> Result<Box<dyn StorageBackend>>;

    /// Joins `self` and `rest` along a new leading axis.
    fn stack(&self, rest: &[&dyn StorageBackend]) -> Result<Box<dyn StorageBackend>>;

    /// Slice `index` of the leading axis
    fn select(&self, index: usize) -> Result<Box<dyn StorageBackend>>;

    /// self += alpha * x
    fn axpy(&mut self, alpha: f32, x: &dyn StorageBackend) -> Result<()>;
}

/// A shaped buffer resident on exactly one backend.
///
/// Reads and writes must declare the backend they expect the buffer to be on;
/// a mismatch is reported as [`AutogradError::BackendMismatch`] rather than
/// routed through an implicit copy.
#[derive(Debug)]
pub struct StorageBuffer {
    inner: Box<dyn StorageBackend>,
}

impl StorageBuffer {
    fn wrap(inner: Box<dyn StorageBackend>) -> Self {
        Self { inner }
    }

    /// Zero-initialized buffer on `backend`.
    pub fn zeros(shape: &Shape, backend: Backend, devices: &DeviceRegistry) -> Result<Self> {
        let inner: Box<dyn StorageBackend> = match backend {
            Backend::Host => Box::new(HostStorage::zeros(shape.dims())),
            Backend::Accelerator => Box::new(AcceleratorStorage::zeros(
                devices.accelerator()?.clone(),
                shape.dims(),
            )?),
        };
        Ok(Self::wrap(inner))
    }

    /// Buffer holding `values` in row-major order.
    pub fn from_vec(
        values: Vec<f32>,
        shape: &Shape,
        backend: Backend,
        devices: &DeviceRegistry,
    ) -> Result<Self> {
        if values.len() != shape.numel() {
            return Err(AutogradError::ShapeMismatch {
                op: "from_vec",
                expected: shape.clone(),
                found: Shape::from([values.len()]),
            });
        }
        let inner: Box<dyn StorageBackend> = match backend {
            Backend::Host => Box::new(HostStorage::from_vec(values, shape.dims())?),
            Backend::Accelerator => Box::new(AcceleratorStorage::from_slice(
                devices.accelerator()?.clone(),
                &values,
                shape.dims(),
            )?),
        };
        Ok(Self::wrap(inner))
    }

    pub fn backend(&self) -> Backend {
        self.inner.backend()
    }

    pub fn shape(&self) -> Shape {
        Shape::from(self.inner.shape())
    }

    pub fn numel(&self) -> usize {
        self.inner.numel()
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.inner.as_ref()
    }

    fn expect_backend(&self, declared: Backend) -> Result<()> {
        if self.backend() != declared {
            return Err(AutogradError::BackendMismatch {
                expected: declared,
                found: self.backend(),
            });
        }
        Ok(())
    }

    fn same_backend(&self, other: &StorageBuffer) -> Result<()> {
        other.expect_backend(self.backend())
    }

    /// Reads every element, asserting the buffer lives on `declared`.
    pub fn read(&self, declared: Backend) -> Result<Vec<f32>> {
        self.expect_backend(declared)?;
        self.inner.to_vec()
    }

    /// Overwrites every element, asserting the buffer lives on `declared`.
    pub fn write(&mut self, declared: Backend, values: &[f32]) -> Result<()> {
        self.expect_backend(declared)?;
        if values.len() != self.numel() {
            return Err(AutogradError::ShapeMismatch {
                op: "write",
                expected: self.shape(),
                found: Shape::from([values.len()]),
            });
        }
        self.inner.write(values)
    }

    /// Copy of this buffer on `target`. `self` is left untouched whether or
    /// not the copy succeeds.
    pub fn transferred(&self, target: Backend, devices: &DeviceRegistry) -> Result<Self> {
        if self.backend() == target {
            return self.try_clone();
        }
        let fail = |reason: String| AutogradError::TransferFailure { target, reason };
        let values = self.inner.to_vec().map_err(|e| fail(e.to_string()))?;
        let shape = self.shape();
        let copy = match target {
            Backend::Host => StorageBuffer::from_vec(values, &shape, Backend::Host, devices),
            Backend::Accelerator => {
                let runtime = devices.accelerator().map_err(|e| fail(e.to_string()))?;
                AcceleratorStorage::from_slice(runtime.clone(), &values, shape.dims())
                    .map(|s| StorageBuffer::wrap(Box::new(s)))
            }
        }
        .map_err(|e| match e {
            AutogradError::TransferFailure { .. } => e,
            other => fail(other.to_string()),
        })?;
        debug!(from = %self.backend(), to = %target, numel = copy.numel(), "buffer transferred");
        Ok(copy)
    }

    /// Moves this buffer to `target`. On failure the buffer keeps its
    /// previous backend and contents.
    pub fn transfer(&mut self, target: Backend, devices: &DeviceRegistry) -> Result<()> {
        if self.backend() == target {
            return Ok(());
        }
        *self = self.transferred(target, devices)?;
        Ok(())
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::wrap(self.inner.clone_storage()?))
    }

    pub fn binary(&self, op: BinaryOp, other: &StorageBuffer) -> Result<Self> {
        self.same_backend(other)?;
        Ok(Self::wrap(self.inner.binary(op, other.storage())?))
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Self> {
        Ok(Self::wrap(self.inner.unary(op)?))
    }

    pub fn gradient(&self, op: GradOp, saved: &StorageBuffer) -> Result<Self> {
        self.same_backend(saved)?;
        Ok(Self::wrap(self.inner.gradient(op, saved.storage())?))
    }

    pub fn sum_all(&self) -> Result<Self> {
        Ok(Self::wrap(self.inner.sum_all()?))
    }

    pub fn expand(&self, shape: &Shape) -> Result<Self> {
        Ok(Self::wrap(self.inner.expand(shape.dims())?))
    }

    /// Stacks `parts` along a new leading axis. All parts share one backend.
    pub fn stack(parts: &[&StorageBuffer]) -> Result<Self> {
        let (first, rest) = parts.split_first().ok_or(AutogradError::ShapeMismatch {
            op: "stack",
            expected: Shape::from([1]),
            found: Shape::from([0]),
        })?;
        for part in rest {
            first.same_backend(part)?;
        }
        let rest: Vec<&dyn StorageBackend> = rest.iter().map(|p| p.storage()).collect();
        Ok(Self::wrap(first.inner.stack(&rest)?))
    }

    pub fn select(&self, index: usize) -> Result<Self> {
        Ok(Self::wrap(self.inner.select(index)?))
    }

    /// self += alpha * x
    pub fn axpy(&mut self, alpha: f32, x: &StorageBuffer) -> Result<()> {
        self.same_backend(x)?;
        self.inner.axpy(alpha, x.storage())
    }

    /// Adds `x` into this buffer elementwise.
    pub fn accumulate(&mut self, x: &StorageBuffer) -> Result<()> {
        self.axpy(1.0, x)
    }

    pub fn zero(&mut self) -> Result<()> {
        self.inner.fill(0.0)
    }

    pub fn fill(&mut self, value: f32) -> Result<()> {
        self.inner.fill(value)
    }

    pub fn is_all_zero(&self) -> Result<bool> {
        Ok(self.inner.to_vec()?.iter().all(|&v| v == 0.0))
    }

    /// Synchronized host copy of the elements regardless of residency.
    /// Meant for diagnostics only; compute paths go through `read`.
    pub fn snapshot(&self) -> Result<Vec<f32>> {
        self.inner.to_vec()
    }
}
