use crate::error::Result;
use crate::graph::{Graph, TensorId};

/// Mean squared error between `prediction` and `target` as a rank-0 tensor.
/// Shapes must be equal or one side rank-0.
pub fn mse_loss(graph: &mut Graph, prediction: TensorId, target: TensorId) -> Result<TensorId> {
    let diff = graph.sub(prediction, target)?;
    let numel = graph.shape(diff)?.numel().max(1);
    let squared = graph.mul(diff, diff)?;
    let total = graph.sum(squared)?;
    graph.div_scalar(total, numel as f32)
}
