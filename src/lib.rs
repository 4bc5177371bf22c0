//! # Ferrograd
//!
//! Ferrograd is a small tensor autodiff engine written in Rust. Graphs are
//! built eagerly as operations are applied and differentiated in reverse mode
//! from any tensor.
//!
//! ## Features
//!
//! - Reverse-mode automatic differentiation over a define-by-run graph
//! - Elementwise arithmetic, tanh, exp, relu, sum-reduce and stack
//! - Rank-0 tensors broadcast against any shape
//! - Host storage via `ndarray`
//! - Accelerator storage with asynchronous kernel launches, either an
//!   in-process reference device or CUDA (`cuda` feature)
//! - Explicit, atomic transfer of tensors between backends
//! - Small neural network layer and SGD optimizer on top of the parameter API
//!
//! ```rust
//! use ferrograd::Graph;
//!
//! let mut graph = Graph::new();
//! let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
//! let b = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
//! let c = graph.mul(a, b).unwrap();
//! let loss = graph.sum(c).unwrap();
//! graph.backward(loss).unwrap();
//! assert_eq!(graph.grad(a).unwrap(), vec![3.0, 4.0]);
//! ```
pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod nn;
pub mod shape;

pub use backend::{Backend, DeviceRegistry, ReferenceAccelerator, StorageBuffer};
pub use config::{AcceleratorChoice, EngineConfig};
pub use error::{AutogradError, Result};
pub use graph::{Checkpoint, Graph, OpKind, Operation, TensorId};
pub use shape::Shape;
