// src/backend/accelerator/cuda.rs
use super::{AcceleratorRuntime, DevicePtr, Launch};
use crate::backend::kernel::{BinaryOp, GradOp, UnaryOp};
use crate::error::{AutogradError, Result};
use cudarc::driver::{CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::compile_ptx;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const KERNEL_SOURCE: &str = include_str!("../../../kernels/autograd.cu");

const KERNEL_NAMES: &[&str] = &[
    "binary_add",
    "binary_sub",
    "binary_mul",
    "binary_div",
    "unary_neg",
    "unary_tanh",
    "unary_exp",
    "unary_relu",
    "grad_tanh",
    "grad_relu",
    "sum_all",
    "copy_range",
    "axpy",
    "fill",
];

// Generic kernel launch macro
macro_rules! launch_kernel {
    ($self:expr, $kernel_name:expr, $len:expr, $( $arg:expr ),* $(,)? ) => {{
        let kernel = $self.function($kernel_name)?;
        let elems = u32::try_from($len).map_err(|_| {
            AutogradError::Accelerator(format!("{} elements exceed the launch grid", $len))
        })?;
        let cfg = LaunchConfig::for_num_elems(elems);
        let mut builder = $self.stream.launch_builder(kernel);
        $( builder.arg($arg); )*
        unsafe {
            builder
                .launch(cfg)
                .map_err(|e| AutogradError::Accelerator(format!("failed to launch {}: {}", $kernel_name, e)))?;
        }
    }};
}

/// CUDA device driven through cudarc. All work is issued on the context's
/// default stream, so launches are ordered and `synchronize` waits for all of them.
pub struct CudaAccelerator {
    ordinal: usize,
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    functions: HashMap<&'static str, CudaFunction>,
    buffers: Mutex<HashMap<u64, CudaSlice<f32>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaAccelerator")
            .field("ordinal", &self.ordinal)
            .field("kernels", &self.functions.len())
            .finish()
    }
}

fn driver_error(context: &str, e: impl std::fmt::Display) -> AutogradError {
    AutogradError::Accelerator(format!("{}: {}", context, e))
}

impl CudaAccelerator {
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| driver_error("CUDA init", e))?;
        let stream = ctx.default_stream();

        let ptx = compile_ptx(KERNEL_SOURCE)
            .map_err(|e| AutogradError::Accelerator(format!("NVRTC compilation failed: {:?}", e)))?;
        let module = ctx.load_module(ptx).map_err(|e| driver_error("module load", e))?;

        let mut functions = HashMap::new();
        for &name in KERNEL_NAMES {
            let function = module
                .load_function(name)
                .map_err(|e| driver_error(name, e))?;
            functions.insert(name, function);
        }
        info!(ordinal, kernels = functions.len(), "CUDA accelerator ready");

        Ok(Self {
            ordinal,
            _ctx: ctx,
            stream,
            functions,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn function(&self, name: &str) -> Result<&CudaFunction> {
        self.functions
            .get(name)
            .ok_or_else(|| AutogradError::Accelerator(format!("{} kernel not found", name)))
    }

    fn buffers(&self) -> Result<MutexGuard<'_, HashMap<u64, CudaSlice<f32>>>> {
        self.buffers
            .lock()
            .map_err(|e| AutogradError::Accelerator(format!("buffer table poisoned: {}", e)))
    }

    fn register(&self, slice: CudaSlice<f32>) -> Result<DevicePtr> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers()?.insert(id, slice);
        Ok(DevicePtr(id))
    }

    fn binary(&self, op: BinaryOp, launch: &Launch) -> Result<()> {
        let Launch::Binary { lhs, rhs, out, len, .. } = *launch else {
            return Ok(());
        };
        let mut table = self.buffers()?;
        let mut dst = table.remove(&out.0).ok_or_else(|| missing(out))?;
        let result = (|| -> Result<()> {
            let a = table.get(&lhs.ptr.0).ok_or_else(|| missing(lhs.ptr))?;
            let b = table.get(&rhs.ptr.0).ok_or_else(|| missing(rhs.ptr))?;
            let (sa, sb, n) = (
                kernel_int(lhs.stride, "stride")?,
                kernel_int(rhs.stride, "stride")?,
                kernel_int(len, "length")?,
            );
            launch_kernel!(self, op.symbol(), len, a, &sa, b, &sb, &mut dst, &n);
            Ok(())
        })();
        table.insert(out.0, dst);
        result
    }

    fn unary(&self, op: UnaryOp, input: DevicePtr, out: DevicePtr, len: usize) -> Result<()> {
        let mut table = self.buffers()?;
        let mut dst = table.remove(&out.0).ok_or_else(|| missing(out))?;
        let result = (|| -> Result<()> {
            let x = table.get(&input.0).ok_or_else(|| missing(input))?;
            let n = kernel_int(len, "length")?;
            launch_kernel!(self, op.symbol(), len, x, &mut dst, &n);
            Ok(())
        })();
        table.insert(out.0, dst);
        result
    }

    fn gradient(
        &self,
        op: GradOp,
        upstream: DevicePtr,
        saved: DevicePtr,
        out: DevicePtr,
        len: usize,
    ) -> Result<()> {
        let mut table = self.buffers()?;
        let mut dst = table.remove(&out.0).ok_or_else(|| missing(out))?;
        let result = (|| -> Result<()> {
            let g = table.get(&upstream.0).ok_or_else(|| missing(upstream))?;
            let s = table.get(&saved.0).ok_or_else(|| missing(saved))?;
            let n = kernel_int(len, "length")?;
            launch_kernel!(self, op.symbol(), len, g, s, &mut dst, &n);
            Ok(())
        })();
        table.insert(out.0, dst);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn two_buffer(
        &self,
        name: &'static str,
        src: DevicePtr,
        dst_ptr: DevicePtr,
        len: usize,
        src_offset: i32,
        src_stride: i32,
        dst_offset: i32,
        alpha: f32,
    ) -> Result<()> {
        let mut table = self.buffers()?;
        if src == dst_ptr {
            return Err(AutogradError::Accelerator(format!(
                "{} cannot alias source and destination",
                name
            )));
        }
        let mut dst = table.remove(&dst_ptr.0).ok_or_else(|| missing(dst_ptr))?;
        let result = (|| -> Result<()> {
            let s = table.get(&src.0).ok_or_else(|| missing(src))?;
            let n = kernel_int(len, "length")?;
            match name {
                "sum_all" => launch_kernel!(self, name, len, s, &mut dst, &n),
                "copy_range" => {
                    launch_kernel!(
                    self,
                    name,
                    len,
                    s,
                    &src_offset,
                    &src_stride,
                    &mut dst,
                    &dst_offset,
                    &n
                )
                }
                _ => launch_kernel!(self, name, len, &alpha, s, &mut dst, &n),
            }
            Ok(())
        })();
        table.insert(dst_ptr.0, dst);
        result
    }
}

// Kernels index with `int`, so every extent must fit in an i32.
fn kernel_int(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        AutogradError::Accelerator(format!("{} {} does not fit a kernel index", what, value))
    })
}

fn missing(ptr: DevicePtr) -> AutogradError {
    AutogradError::Accelerator(format!("invalid device pointer {}", ptr))
}

impl AcceleratorRuntime for CudaAccelerator {
    fn name(&self) -> &str {
        "cuda"
    }

    fn alloc_zeros(&self, len: usize) -> Result<DevicePtr> {
        let slice = self
            .stream
            .alloc_zeros::<f32>(len.max(1))
            .map_err(|e| driver_error("allocation", e))?;
        self.register(slice)
    }

    fn upload(&self, data: &[f32]) -> Result<DevicePtr> {
        let slice = if data.is_empty() {
            self.stream.alloc_zeros::<f32>(1)
        } else {
            self.stream.memcpy_stod(data)
        }
        .map_err(|e| driver_error("host to device copy", e))?;
        self.register(slice)
    }

    fn launch(&self, launch: Launch) -> Result<()> {
        match launch {
            Launch::Binary { len: 0, .. }
            | Launch::Unary { len: 0, .. }
            | Launch::Gradient { len: 0, .. }
            | Launch::SumAll { len: 0, .. }
            | Launch::Copy { len: 0, .. }
            | Launch::Axpy { len: 0, .. }
            | Launch::Fill { len: 0, .. } => Ok(()),
            Launch::Binary { op, .. } => self.binary(op, &launch),
            Launch::Unary { op, input, out, len } => self.unary(op, input, out, len),
            Launch::Gradient { op, upstream, saved, out, len } => {
                self.gradient(op, upstream, saved, out, len)
            }
            Launch::SumAll { input, out, len } => {
                self.two_buffer("sum_all", input, out, len, 0, 1, 0, 0.0)
            }
            Launch::Copy { src, src_offset, src_stride, dst, dst_offset, len } => self.two_buffer(
                "copy_range",
                src,
                dst,
                len,
                kernel_int(src_offset, "offset")?,
                kernel_int(src_stride, "stride")?,
                kernel_int(dst_offset, "offset")?,
                0.0,
            ),
            Launch::Axpy { alpha, x, y, len } => self.two_buffer("axpy", x, y, len, 0, 1, 0, alpha),
            Launch::Fill { dst, value, len } => {
                let mut table = self.buffers()?;
                let target = table.get_mut(&dst.0).ok_or_else(|| missing(dst))?;
                let n = kernel_int(len, "length")?;
                launch_kernel!(self, "fill", len, target, &value, &n);
                Ok(())
            }
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| driver_error("stream synchronize", e))
    }

    fn download(&self, ptr: DevicePtr, len: usize) -> Result<Vec<f32>> {
        self.synchronize()?;
        let table = self.buffers()?;
        let slice = table.get(&ptr.0).ok_or_else(|| missing(ptr))?;
        let mut host = self
            .stream
            .memcpy_dtov(slice)
            .map_err(|e| driver_error("device to host copy", e))?;
        host.truncate(len);
        debug!(%ptr, len, "downloaded from CUDA device");
        Ok(host)
    }

    fn release(&self, ptr: DevicePtr) {
        if let Ok(mut table) = self.buffers.lock() {
            // Dropping the slice frees it in stream order.
            table.remove(&ptr.0);
        }
    }
}
