// src/backend/accelerator/reference.rs
// In-process accelerator. Device memory is a private allocation table that the
// host cannot address directly, and kernel launches are queued on a single
// stream that only drains on `synchronize` or `download`. It gives the same
// observable semantics as a discrete device without requiring hardware.
use super::{AcceleratorRuntime, DevicePtr, Launch};
use crate::error::{AutogradError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
enum Command {
    Launch(Launch),
    Release(DevicePtr),
}

#[derive(Debug, Default)]
struct DeviceState {
    next_id: u64,
    buffers: HashMap<u64, Vec<f32>>,
    // Handles whose release is queued; no new work may reference them.
    retired: HashSet<u64>,
    stream: VecDeque<Command>,
    completed_launches: u64,
}

impl DeviceState {
    fn resident(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    fn check(&self, ptr: DevicePtr, needed: usize) -> Result<()> {
        if self.retired.contains(&ptr.0) {
            return Err(AutogradError::Accelerator(format!("{} was released", ptr)));
        }
        match self.buffers.get(&ptr.0) {
            Some(buf) if buf.len() >= needed => Ok(()),
            Some(buf) => Err(AutogradError::Accelerator(format!(
                "{} holds {} elements, kernel needs {}",
                ptr,
                buf.len(),
                needed
            ))),
            None => Err(AutogradError::Accelerator(format!("invalid device pointer {}", ptr))),
        }
    }

    fn validate(&self, launch: &Launch) -> Result<()> {
        match *launch {
            Launch::Binary { lhs, rhs, out, len, .. } => {
                self.check(lhs.ptr, operand_extent(lhs.stride, len))?;
                self.check(rhs.ptr, operand_extent(rhs.stride, len))?;
                self.check(out, len)
            }
            Launch::Unary { input, out, len, .. } => {
                self.check(input, len)?;
                self.check(out, len)
            }
            Launch::Gradient { upstream, saved, out, len, .. } => {
                self.check(upstream, len)?;
                self.check(saved, len)?;
                self.check(out, len)
            }
            Launch::SumAll { input, out, len } => {
                self.check(input, len)?;
                self.check(out, 1)
            }
            Launch::Copy { src, src_offset, src_stride, dst, dst_offset, len } => {
                self.check(src, src_offset + operand_extent(src_stride, len))?;
                self.check(dst, dst_offset + len)
            }
            Launch::Axpy { x, y, len, .. } => {
                self.check(x, len)?;
                self.check(y, len)
            }
            Launch::Fill { dst, len, .. } => self.check(dst, len),
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(command) = self.stream.pop_front() {
            match command {
                Command::Launch(launch) => {
                    execute(&mut self.buffers, &launch)?;
                    self.completed_launches += 1;
                }
                Command::Release(ptr) => {
                    self.buffers.remove(&ptr.0);
                    self.retired.remove(&ptr.0);
                }
            }
        }
        Ok(())
    }
}

fn operand_extent(stride: usize, len: usize) -> usize {
    if stride == 0 { 1 } else { len }
}

fn missing(ptr: DevicePtr) -> AutogradError {
    AutogradError::Accelerator(format!("invalid device pointer {}", ptr))
}

fn execute(buffers: &mut HashMap<u64, Vec<f32>>, launch: &Launch) -> Result<()> {
    match *launch {
        Launch::Binary { op, lhs, rhs, out, len } => {
            let mut dst = buffers.remove(&out.0).ok_or_else(|| missing(out))?;
            let a = buffers.get(&lhs.ptr.0).ok_or_else(|| missing(lhs.ptr))?;
            let b = buffers.get(&rhs.ptr.0).ok_or_else(|| missing(rhs.ptr))?;
            for (i, slot) in dst.iter_mut().take(len).enumerate() {
                *slot = op.apply(a[i * lhs.stride], b[i * rhs.stride]);
            }
            buffers.insert(out.0, dst);
        }
        Launch::Unary { op, input, out, len } => {
            let mut dst = buffers.remove(&out.0).ok_or_else(|| missing(out))?;
            let x = buffers.get(&input.0).ok_or_else(|| missing(input))?;
            for (slot, &v) in dst.iter_mut().zip(x.iter()).take(len) {
                *slot = op.apply(v);
            }
            buffers.insert(out.0, dst);
        }
        Launch::Gradient { op, upstream, saved, out, len } => {
            let mut dst = buffers.remove(&out.0).ok_or_else(|| missing(out))?;
            let g = buffers.get(&upstream.0).ok_or_else(|| missing(upstream))?;
            let s = buffers.get(&saved.0).ok_or_else(|| missing(saved))?;
            for i in 0..len {
                dst[i] = op.apply(g[i], s[i]);
            }
            buffers.insert(out.0, dst);
        }
        Launch::SumAll { input, out, len } => {
            let total: f32 = buffers
                .get(&input.0)
                .ok_or_else(|| missing(input))?
                .iter()
                .take(len)
                .sum();
            let dst = buffers.get_mut(&out.0).ok_or_else(|| missing(out))?;
            dst[0] += total;
        }
        Launch::Copy { src, src_offset, src_stride, dst, dst_offset, len } => {
            let source = buffers.get(&src.0).ok_or_else(|| missing(src))?;
            let chunk: Vec<f32> = (0..len)
                .map(|i| source[src_offset + i * src_stride])
                .collect();
            let target = buffers.get_mut(&dst.0).ok_or_else(|| missing(dst))?;
            target[dst_offset..dst_offset + len].copy_from_slice(&chunk);
        }
        Launch::Axpy { alpha, x, y, len } => {
            if x == y {
                let target = buffers.get_mut(&y.0).ok_or_else(|| missing(y))?;
                target.iter_mut().take(len).for_each(|v| *v += alpha * *v);
            } else {
                let mut target = buffers.remove(&y.0).ok_or_else(|| missing(y))?;
                let source = buffers.get(&x.0).ok_or_else(|| missing(x))?;
                for (t, &s) in target.iter_mut().zip(source.iter()).take(len) {
                    *t += alpha * s;
                }
                buffers.insert(y.0, target);
            }
        }
        Launch::Fill { dst, value, len } => {
            let target = buffers.get_mut(&dst.0).ok_or_else(|| missing(dst))?;
            target.iter_mut().take(len).for_each(|v| *v = value);
        }
    }
    Ok(())
}

/// Reference accelerator runtime with deferred execution.
#[derive(Debug, Default)]
pub struct ReferenceAccelerator {
    state: Mutex<DeviceState>,
    capacity: Option<usize>,
}

impl ReferenceAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose device memory holds at most `elements` floats.
    pub fn with_capacity(elements: usize) -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            capacity: Some(elements),
        }
    }

    /// Launches queued but not yet executed.
    pub fn pending_launches(&self) -> usize {
        self.lock()
            .map(|s| {
                s.stream
                    .iter()
                    .filter(|c| matches!(c, Command::Launch(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn completed_launches(&self) -> u64 {
        self.lock().map(|s| s.completed_launches).unwrap_or(0)
    }

    /// Number of live allocations, including ones with a queued release.
    pub fn live_buffers(&self) -> usize {
        self.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|e| AutogradError::Accelerator(format!("device state poisoned: {}", e)))
    }

    fn allocate(&self, data: Vec<f32>) -> Result<DevicePtr> {
        let mut state = self.lock()?;
        if let Some(capacity) = self.capacity {
            if state.resident() + data.len() > capacity {
                // Queued releases may free enough memory.
                state.drain()?;
                if state.resident() + data.len() > capacity {
                    return Err(AutogradError::Accelerator(format!(
                        "out of device memory: {} elements requested, {} of {} in use",
                        data.len(),
                        state.resident(),
                        capacity
                    )));
                }
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state.buffers.insert(id, data);
        Ok(DevicePtr(id))
    }
}

impl AcceleratorRuntime for ReferenceAccelerator {
    fn name(&self) -> &str {
        "reference"
    }

    fn alloc_zeros(&self, len: usize) -> Result<DevicePtr> {
        self.allocate(vec![0.0; len])
    }

    fn upload(&self, data: &[f32]) -> Result<DevicePtr> {
        self.allocate(data.to_vec())
    }

    fn launch(&self, launch: Launch) -> Result<()> {
        let mut state = self.lock()?;
        state.validate(&launch)?;
        state.stream.push_back(Command::Launch(launch));
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.lock()?;
        let queued = state.stream.len();
        state.drain()?;
        if queued > 0 {
            debug!(queued, "reference stream synchronized");
        }
        Ok(())
    }

    fn download(&self, ptr: DevicePtr, len: usize) -> Result<Vec<f32>> {
        let mut state = self.lock()?;
        state.check(ptr, len)?;
        state.drain()?;
        let buf = state.buffers.get(&ptr.0).ok_or_else(|| missing(ptr))?;
        Ok(buf[..len].to_vec())
    }

    fn release(&self, ptr: DevicePtr) {
        if let Ok(mut state) = self.lock() {
            if state.buffers.contains_key(&ptr.0) && state.retired.insert(ptr.0) {
                state.stream.push_back(Command::Release(ptr));
            }
        }
    }
}
