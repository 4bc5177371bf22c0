pub mod engine;
pub mod node;
pub mod op;
mod tests;

pub use engine::{Checkpoint, Graph};
pub use node::{TensorId, TensorNode};
pub use op::{OpKind, Operation};
