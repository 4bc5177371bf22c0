// src/backend/accelerator/mod.rs
// Accelerator runtime contract. Device memory is addressed through opaque
// handles; kernel launches may run asynchronously and only `synchronize` or
// `download` guarantee that earlier launches have completed.
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod reference;

#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;
pub use reference::ReferenceAccelerator;

use crate::backend::kernel::{BinaryOp, GradOp, UnaryOp};
use crate::error::Result;
use std::fmt::Debug;

/// Handle to a device allocation owned by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Input of an elementwise kernel. A stride of 0 reads element 0 for every
/// output position, which is how a rank-0 operand is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub ptr: DevicePtr,
    pub stride: usize,
}

impl Operand {
    pub fn dense(ptr: DevicePtr) -> Self {
        Self { ptr, stride: 1 }
    }

    pub fn broadcast(ptr: DevicePtr) -> Self {
        Self { ptr, stride: 0 }
    }
}

/// One kernel launch. `len` is always the number of output elements written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Launch {
    Binary {
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
        out: DevicePtr,
        len: usize,
    },
    Unary {
        op: UnaryOp,
        input: DevicePtr,
        out: DevicePtr,
        len: usize,
    },
    Gradient {
        op: GradOp,
        upstream: DevicePtr,
        saved: DevicePtr,
        out: DevicePtr,
        len: usize,
    },
    /// out[0] = sum(input[0..len]); `out` must be zeroed.
    SumAll {
        input: DevicePtr,
        out: DevicePtr,
        len: usize,
    },
    /// dst[dst_offset + i] = src[src_offset + i * src_stride]
    Copy {
        src: DevicePtr,
        src_offset: usize,
        src_stride: usize,
        dst: DevicePtr,
        dst_offset: usize,
        len: usize,
    },
    /// y += alpha * x
    Axpy {
        alpha: f32,
        x: DevicePtr,
        y: DevicePtr,
        len: usize,
    },
    Fill {
        dst: DevicePtr,
        value: f32,
        len: usize,
    },
}

/// Runtime for a discrete accelerator.
pub trait AcceleratorRuntime: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn alloc_zeros(&self, len: usize) -> Result<DevicePtr>;

    /// Copies host data into a fresh allocation.
    fn upload(&self, data: &[f32]) -> Result<DevicePtr>;

    /// Enqueues a kernel. Completion is only guaranteed after `synchronize`.
    fn launch(&self, launch: Launch) -> Result<()>;

    /// Blocks until every enqueued launch has completed.
    fn synchronize(&self) -> Result<()>;

    /// Waits for outstanding work, then copies `len` elements back to the host.
    fn download(&self, ptr: DevicePtr, len: usize) -> Result<Vec<f32>>;

    /// Releases an allocation once the work queued before it has finished.
    fn release(&self, ptr: DevicePtr);
}
