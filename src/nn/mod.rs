// Neural network building blocks on top of the graph engine. These only use
// the public parameter and gradient contract of `Graph`.

pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use layers::{Linear, Mlp, Neuron, uniform_init};
pub use loss::mse_loss;
pub use module::Module;
pub use optim::{Optimizer, Sgd};
