use crate::error::Result;
use crate::graph::{Graph, TensorId};

/// The base trait for neural network components built on a [`Graph`].
///
/// A module owns the ids of its parameter leaves; the tensors themselves live
/// in the graph passed to every call.
///
/// ```rust
/// use ferrograd::graph::{Graph, TensorId};
/// use ferrograd::nn::Module;
/// use ferrograd::Result;
///
/// struct Scale {
///     factor: TensorId,
/// }
///
/// impl Module for Scale {
///     fn forward(&self, graph: &mut Graph, input: TensorId) -> Result<TensorId> {
///         graph.mul(input, self.factor)
///     }
///
///     fn parameters(&self) -> Vec<TensorId> {
///         vec![self.factor]
///     }
/// }
/// ```
pub trait Module {
    /// Records the forward computation on `graph` and returns its output.
    fn forward(&self, graph: &mut Graph, input: TensorId) -> Result<TensorId>;

    /// Parameter leaves of this module and its submodules, in a stable order.
    fn parameters(&self) -> Vec<TensorId> {
        Vec::new()
    }

    fn zero_grad(&self, graph: &mut Graph) -> Result<()> {
        for param in self.parameters() {
            graph.zero_grad_tensor(param)?;
        }
        Ok(())
    }

    fn num_parameters(&self, graph: &Graph) -> Result<usize> {
        self.parameters()
            .into_iter()
            .map(|p| graph.shape(p).map(|s| s.numel()))
            .sum()
    }
}
