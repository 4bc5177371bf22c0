use crate::error::Result;
use crate::graph::Graph;

pub mod sgd;

pub use sgd::Sgd;

/// Trait that all optimizers implement.
///
/// An optimizer holds the parameter ids it updates; values and gradients are
/// read from and written to the graph passed to each call.
pub trait Optimizer {
    /// Applies one update from the currently accumulated gradients.
    fn step(&mut self, graph: &mut Graph) -> Result<()>;

    /// Resets the gradients of every registered parameter.
    fn zero_grad(&mut self, graph: &mut Graph) -> Result<()>;
}
