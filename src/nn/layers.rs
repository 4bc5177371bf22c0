// src/nn/layers.rs
// Fully connected building blocks. A neuron reduces a rank-1 input to a
// rank-0 activation, a layer stacks neurons back into a rank-1 output.
use crate::error::{AutogradError, Result};
use crate::graph::{Graph, TensorId};
use crate::nn::Module;
use crate::shape::Shape;
use rand::Rng;
use rand_distr::{Distribution, Uniform};

/// Samples `n` values uniformly from [-1, 1).
pub fn uniform_init<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Vec<f32>> {
    let uniform =
        Uniform::new(-1.0f32, 1.0).map_err(|e| AutogradError::Config(e.to_string()))?;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(uniform.sample(rng));
    }
    Ok(values)
}

/// `tanh?(w . x + b)` for a rank-1 input of length `in_features`.
#[derive(Debug, Clone)]
pub struct Neuron {
    pub weight: TensorId,
    pub bias: TensorId,
    pub nonlinear: bool,
}

impl Neuron {
    pub fn new<R: Rng + ?Sized>(
        graph: &mut Graph,
        in_features: usize,
        nonlinear: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = graph.parameter_from_vec(uniform_init(in_features, rng)?, [in_features])?;
        let bias = graph.parameter_from_vec(uniform_init(1, rng)?, Shape::scalar())?;
        graph.set_label(weight, "w")?;
        graph.set_label(bias, "b")?;
        Ok(Self {
            weight,
            bias,
            nonlinear,
        })
    }
}

impl Module for Neuron {
    fn forward(&self, graph: &mut Graph, input: TensorId) -> Result<TensorId> {
        let weighted = graph.mul(self.weight, input)?;
        let dot = graph.sum(weighted)?;
        let out = graph.add(dot, self.bias)?;
        if self.nonlinear {
            graph.tanh(out)
        } else {
            Ok(out)
        }
    }

    fn parameters(&self) -> Vec<TensorId> {
        vec![self.weight, self.bias]
    }
}

/// Dense layer mapping `[in_features]` to `[out_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    neurons: Vec<Neuron>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        graph: &mut Graph,
        in_features: usize,
        out_features: usize,
        nonlinear: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let neurons = (0..out_features)
            .map(|_| Neuron::new(graph, in_features, nonlinear, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            neurons,
            in_features,
            out_features,
        })
    }

    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }
}

impl Module for Linear {
    fn forward(&self, graph: &mut Graph, input: TensorId) -> Result<TensorId> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(graph, input))
            .collect::<Result<Vec<_>>>()?;
        graph.stack(&outputs)
    }

    fn parameters(&self) -> Vec<TensorId> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }
}

/// Multi-layer perceptron with tanh on every hidden layer and a linear output.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// `sizes` lists the width of each layer after the input.
    pub fn new<R: Rng + ?Sized>(
        graph: &mut Graph,
        in_features: usize,
        sizes: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(sizes.len());
        let mut fan_in = in_features;
        for (i, &width) in sizes.iter().enumerate() {
            let hidden = i + 1 < sizes.len();
            layers.push(Linear::new(graph, fan_in, width, hidden, rng)?);
            fan_in = width;
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Module for Mlp {
    fn forward(&self, graph: &mut Graph, input: TensorId) -> Result<TensorId> {
        self.layers
            .iter()
            .try_fold(input, |x, layer| layer.forward(graph, x))
    }

    fn parameters(&self) -> Vec<TensorId> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }
}
