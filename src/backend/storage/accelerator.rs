// src/backend/storage/accelerator.rs
use super::StorageBackend;
use crate::backend::Backend;
use crate::backend::accelerator::{AcceleratorRuntime, DevicePtr, Launch, Operand};
use crate::backend::kernel::{BinaryOp, GradOp, UnaryOp};
use crate::error::{AutogradError, Result};
use crate::shape::Shape;
use std::any::Any;
use std::sync::Arc;

/// Storage resident in accelerator memory. Kernels are enqueued on the
/// runtime's stream and return immediately; the allocation is released when
/// the storage is dropped.
#[derive(Debug)]
pub struct AcceleratorStorage {
    runtime: Arc<dyn AcceleratorRuntime>,
    ptr: DevicePtr,
    shape: Vec<usize>,
}

impl AcceleratorStorage {
    pub fn zeros(runtime: Arc<dyn AcceleratorRuntime>, shape: &[usize]) -> Result<Self> {
        let ptr = runtime.alloc_zeros(shape.iter().product())?;
        Ok(Self {
            runtime,
            ptr,
            shape: shape.to_vec(),
        })
    }

    pub fn from_slice(
        runtime: Arc<dyn AcceleratorRuntime>,
        values: &[f32],
        shape: &[usize],
    ) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(AutogradError::ShapeMismatch {
                op: "upload",
                expected: Shape::from(shape),
                found: Shape::from([values.len()]),
            });
        }
        let ptr = runtime.upload(values)?;
        Ok(Self {
            runtime,
            ptr,
            shape: shape.to_vec(),
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn runtime(&self) -> &Arc<dyn AcceleratorRuntime> {
        &self.runtime
    }

    fn output(&self, shape: &[usize]) -> Result<Self> {
        Self::zeros(self.runtime.clone(), shape)
    }

    /// Resolves `other` to accelerator storage owned by the same runtime.
    fn peer<'a>(&self, other: &'a dyn StorageBackend) -> Result<&'a AcceleratorStorage> {
        let peer = other
            .as_any()
            .downcast_ref::<AcceleratorStorage>()
            .ok_or(AutogradError::BackendMismatch {
                expected: Backend::Accelerator,
                found: other.backend(),
            })?;
        if !Arc::ptr_eq(&self.runtime, &peer.runtime) {
            return Err(AutogradError::Accelerator(format!(
                "{} and {} belong to different accelerator runtimes",
                self.ptr, peer.ptr
            )));
        }
        Ok(peer)
    }

    fn mismatch(&self, op: &'static str, other: &[usize]) -> AutogradError {
        AutogradError::ShapeMismatch {
            op,
            expected: Shape::from(self.shape.as_slice()),
            found: Shape::from(other),
        }
    }
}

impl Drop for AcceleratorStorage {
    fn drop(&mut self) {
        self.runtime.release(self.ptr);
    }
}

impl StorageBackend for AcceleratorStorage {
    fn backend(&self) -> Backend {
        Backend::Accelerator
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_storage(&self) -> Result<Box<dyn StorageBackend>> {
        let out = self.output(&self.shape)?;
        self.runtime.launch(Launch::Copy {
            src: self.ptr,
            src_offset: 0,
            src_stride: 1,
            dst: out.ptr,
            dst_offset: 0,
            len: self.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn to_vec(&self) -> Result<Vec<f32>> {
        self.runtime.download(self.ptr, self.numel())
    }

    fn write(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.numel() {
            return Err(self.mismatch("write", &[values.len()]));
        }
        // The old allocation is released in stream order, after any launch
        // still reading it.
        let fresh = self.runtime.upload(values)?;
        let old = std::mem::replace(&mut self.ptr, fresh);
        self.runtime.release(old);
        Ok(())
    }

    fn fill(&mut self, value: f32) -> Result<()> {
        self.runtime.launch(Launch::Fill {
            dst: self.ptr,
            value,
            len: self.numel(),
        })
    }

    fn binary(&self, op: BinaryOp, other: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>> {
        let rhs = self.peer(other)?;
        let (lhs_op, rhs_op, shape) = if self.shape == rhs.shape {
            (Operand::dense(self.ptr), Operand::dense(rhs.ptr), &self.shape)
        } else if rhs.shape.is_empty() {
            (Operand::dense(self.ptr), Operand::broadcast(rhs.ptr), &self.shape)
        } else if self.shape.is_empty() {
            (Operand::broadcast(self.ptr), Operand::dense(rhs.ptr), &rhs.shape)
        } else {
            return Err(self.mismatch("binary", &rhs.shape));
        };
        let out = self.output(shape)?;
        self.runtime.launch(Launch::Binary {
            op,
            lhs: lhs_op,
            rhs: rhs_op,
            out: out.ptr,
            len: out.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn unary(&self, op: UnaryOp) -> Result<Box<dyn StorageBackend>> {
        let out = self.output(&self.shape)?;
        self.runtime.launch(Launch::Unary {
            op,
            input: self.ptr,
            out: out.ptr,
            len: out.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn gradient(&self, op: GradOp, saved: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>> {
        let saved = self.peer(saved)?;
        if saved.shape != self.shape {
            return Err(self.mismatch("gradient", &saved.shape));
        }
        let out = self.output(&self.shape)?;
        self.runtime.launch(Launch::Gradient {
            op,
            upstream: self.ptr,
            saved: saved.ptr,
            out: out.ptr,
            len: out.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn sum_all(&self) -> Result<Box<dyn StorageBackend>> {
        let out = self.output(&[])?;
        self.runtime.launch(Launch::SumAll {
            input: self.ptr,
            out: out.ptr,
            len: self.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn expand(&self, shape: &[usize]) -> Result<Box<dyn StorageBackend>> {
        if self.numel() != 1 {
            return Err(self.mismatch("expand", shape));
        }
        let out = self.output(shape)?;
        self.runtime.launch(Launch::Copy {
            src: self.ptr,
            src_offset: 0,
            src_stride: 0,
            dst: out.ptr,
            dst_offset: 0,
            len: out.numel(),
        })?;
        Ok(Box::new(out))
    }

    fn stack(&self, rest: &[&dyn StorageBackend]) -> Result<Box<dyn StorageBackend>> {
        let mut parts = Vec::with_capacity(rest.len() + 1);
        parts.push(self);
        for part in rest {
            let part = self.peer(*part)?;
            if part.shape != self.shape {
                return Err(self.mismatch("stack", &part.shape));
            }
            parts.push(part);
        }
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&self.shape);

        let out = self.output(&shape)?;
        let chunk = self.numel();
        for (i, part) in parts.iter().enumerate() {
            self.runtime.launch(Launch::Copy {
                src: part.ptr,
                src_offset: 0,
                src_stride: 1,
                dst: out.ptr,
                dst_offset: i * chunk,
                len: chunk,
            })?;
        }
        Ok(Box::new(out))
    }

    fn select(&self, index: usize) -> Result<Box<dyn StorageBackend>> {
        let Some((&leading, inner)) = self.shape.split_first() else {
            return Err(self.mismatch("select", &[index]));
        };
        if index >= leading {
            return Err(self.mismatch("select", &[index]));
        }
        let out = self.output(inner)?;
        let chunk = out.numel();
        self.runtime.launch(Launch::Copy {
            src: self.ptr,
            src_offset: index * chunk,
            src_stride: 1,
            dst: out.ptr,
            dst_offset: 0,
            len: chunk,
        })?;
        Ok(Box::new(out))
    }

    fn axpy(&mut self, alpha: f32, x: &dyn StorageBackend) -> Result<()> {
        let x = self.peer(x)?;
        if x.shape != self.shape {
            return Err(self.mismatch("accumulate", &x.shape));
        }
        self.runtime.launch(Launch::Axpy {
            alpha,
            x: x.ptr,
            y: self.ptr,
            len: self.numel(),
        })
    }
}
