pub mod accelerator;
pub mod device;
pub mod kernel;
pub mod storage;

mod tests;

pub use accelerator::{AcceleratorRuntime, DevicePtr, Launch, Operand, ReferenceAccelerator};
#[cfg(feature = "cuda")]
pub use accelerator::CudaAccelerator;
pub use device::{Backend, DeviceRegistry};
pub use kernel::{BinaryOp, GradOp, UnaryOp};
pub use storage::{AcceleratorStorage, HostStorage, StorageBackend, StorageBuffer};
