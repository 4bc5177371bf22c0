// src/backend/storage/host.rs
use super::StorageBackend;
use crate::backend::Backend;
use crate::backend::kernel::{BinaryOp, GradOp, UnaryOp};
use crate::error::{AutogradError, Result};
use crate::shape::Shape;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use std::any::Any;

/// Host-resident storage backed by an `ndarray` dynamic array.
#[derive(Debug, Clone)]
pub struct HostStorage {
    data: ArrayD<f32>,
}

impl HostStorage {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn from_vec(values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let found = values.len();
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(Self::new)
            .map_err(|_| AutogradError::ShapeMismatch {
                op: "from_vec",
                expected: Shape::from(shape),
                found: Shape::from([found]),
            })
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.data
    }

    fn scalar_value(&self) -> f32 {
        self.data.iter().next().copied().unwrap_or_default()
    }

    fn mismatch(&self, op: &'static str, other: &[usize]) -> AutogradError {
        AutogradError::ShapeMismatch {
            op,
            expected: Shape::from(self.shape()),
            found: Shape::from(other),
        }
    }
}

fn host(other: &dyn StorageBackend) -> Result<&HostStorage> {
    other
        .as_any()
        .downcast_ref::<HostStorage>()
        .ok_or(AutogradError::BackendMismatch {
            expected: Backend::Host,
            found: other.backend(),
        })
}

impl StorageBackend for HostStorage {
    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_storage(&self) -> Result<Box<dyn StorageBackend>> {
        Ok(Box::new(self.clone()))
    }

    fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.data.iter().copied().collect())
    }

    fn write(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.numel() {
            return Err(self.mismatch("write", &[values.len()]));
        }
        self.data
            .iter_mut()
            .zip(values.iter())
            .for_each(|(slot, &v)| *slot = v);
        Ok(())
    }

    fn fill(&mut self, value: f32) -> Result<()> {
        self.data.fill(value);
        Ok(())
    }

    fn binary(&self, op: BinaryOp, other: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>> {
        let rhs = host(other)?;
        let data = if self.shape() == rhs.shape() {
            Zip::from(&self.data)
                .and(&rhs.data)
                .map_collect(|&a, &b| op.apply(a, b))
        } else if rhs.data.ndim() == 0 {
            let b = rhs.scalar_value();
            self.data.mapv(|a| op.apply(a, b))
        } else if self.data.ndim() == 0 {
            let a = self.scalar_value();
            rhs.data.mapv(|b| op.apply(a, b))
        } else {
            return Err(self.mismatch("binary", rhs.shape()));
        };
        Ok(Box::new(HostStorage::new(data)))
    }

    fn unary(&self, op: UnaryOp) -> Result<Box<dyn StorageBackend>> {
        Ok(Box::new(HostStorage::new(self.data.mapv(|x| op.apply(x)))))
    }

    fn gradient(&self, op: GradOp, saved: &dyn StorageBackend) -> Result<Box<dyn StorageBackend>> {
        let saved = host(saved)?;
        if self.shape() != saved.shape() {
            return Err(self.mismatch("gradient", saved.shape()));
        }
        let data = Zip::from(&self.data)
            .and(&saved.data)
            .map_collect(|&g, &s| op.apply(g, s));
        Ok(Box::new(HostStorage::new(data)))
    }

    fn sum_all(&self) -> Result<Box<dyn StorageBackend>> {
        let total = self.data.sum();
        Ok(Box::new(HostStorage::new(ArrayD::from_elem(IxDyn(&[]), total))))
    }

    fn expand(&self, shape: &[usize]) -> Result<Box<dyn StorageBackend>> {
        if self.numel() != 1 {
            return Err(self.mismatch("expand", shape));
        }
        let value = self.scalar_value();
        Ok(Box::new(HostStorage::new(ArrayD::from_elem(IxDyn(shape), value))))
    }

    fn stack(&self, rest: &[&dyn StorageBackend]) -> Result<Box<dyn StorageBackend>> {
        let mut views: Vec<ArrayViewD<'_, f32>> = Vec::with_capacity(rest.len() + 1);
        views.push(self.data.view());
        for part in rest {
            let part = host(*part)?;
            if part.shape() != self.shape() {
                return Err(self.mismatch("stack", part.shape()));
            }
            views.push(part.data.view());
        }
        let data = ndarray::stack(Axis(0), &views).map_err(|_| self.mismatch("stack", &[]))?;
        Ok(Box::new(HostStorage::new(data)))
    }

    fn select(&self, index: usize) -> Result<Box<dyn StorageBackend>> {
        if self.data.ndim() == 0 || index >= self.shape()[0] {
            return Err(self.mismatch("select", &[index]));
        }
        let data = self.data.index_axis(Axis(0), index).to_owned();
        Ok(Box::new(HostStorage::new(data)))
    }

    fn axpy(&mut self, alpha: f32, x: &dyn StorageBackend) -> Result<()> {
        let x = host(x)?;
        if x.shape() != self.shape() {
            return Err(self.mismatch("accumulate", x.shape()));
        }
        self.data.scaled_add(alpha, &x.data);
        Ok(())
    }
}
