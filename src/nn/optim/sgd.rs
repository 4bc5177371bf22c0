use super::Optimizer;
use crate::error::Result;
use crate::graph::{Graph, TensorId};
use tracing::debug;

/// Plain stochastic gradient descent: `value -= lr * grad`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    params: Vec<TensorId>,
}

impl Sgd {
    pub fn new(params: Vec<TensorId>, lr: f32) -> Self {
        Self { lr, params }
    }

    /// Optimizer over every parameter currently registered in `graph`.
    pub fn from_graph(graph: &Graph, lr: f32) -> Self {
        Self::new(graph.parameters(), lr)
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn params(&self) -> &[TensorId] {
        &self.params
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        for &param in &self.params {
            // Runs on the parameter's own backend.
            graph.apply_gradient(param, -self.lr)?;
        }
        debug!(params = self.params.len(), lr = self.lr, "sgd step");
        Ok(())
    }

    fn zero_grad(&mut self, graph: &mut Graph) -> Result<()> {
        for &param in &self.params {
            graph.zero_grad_tensor(param)?;
        }
        Ok(())
    }
}
