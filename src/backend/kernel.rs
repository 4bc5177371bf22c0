// src/backend/kernel.rs
// Backend-neutral kernel contract. Every backend implements these element rules;
// the scalar functions here are the reference semantics both the host and the
// in-process accelerator execute.

/// Elementwise binary kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    /// Kernel symbol in the CUDA module.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "binary_add",
            BinaryOp::Sub => "binary_sub",
            BinaryOp::Mul => "binary_mul",
            BinaryOp::Div => "binary_div",
        }
    }
}

/// Elementwise unary kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Tanh,
    Exp,
    Relu,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Relu => x.max(0.0),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "unary_neg",
            UnaryOp::Tanh => "unary_tanh",
            UnaryOp::Exp => "unary_exp",
            UnaryOp::Relu => "unary_relu",
        }
    }
}

/// Fused local-derivative kernels: `upstream * f'(saved)`.
///
/// `Tanh` takes the forward output as `saved`, `Relu` takes the forward input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradOp {
    Tanh,
    Relu,
}

impl GradOp {
    #[inline]
    pub fn apply(self, upstream: f32, saved: f32) -> f32 {
        match self {
            GradOp::Tanh => upstream * (1.0 - saved * saved),
            GradOp::Relu => {
                if saved > 0.0 {
                    upstream
                } else {
                    0.0
                }
            }
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            GradOp::Tanh => "grad_tanh",
            GradOp::Relu => "grad_relu",
        }
    }
}
