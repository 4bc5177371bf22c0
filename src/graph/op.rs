// op.rs
// Primitive differentiable operations. The set of kinds is closed: each variant
// carries its own shape rule, forward kernel and backward rule, and every rule
// runs on whatever backend its input buffers live on.
use super::node::TensorId;
use crate::backend::{BinaryOp, GradOp, StorageBuffer, UnaryOp};
use crate::error::{AutogradError, Result};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Tanh,
    Exp,
    Relu,
    /// Collapses every element into a rank-0 value.
    Sum,
    /// Joins inputs of one shape along a new leading axis.
    Stack,
}

/// One recorded computation: its kind and the ordered tensors it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
}

impl Operation {
    pub fn new(kind: OpKind, inputs: Vec<TensorId>) -> Self {
        Self { kind, inputs }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Tanh => "tanh",
            OpKind::Exp => "exp",
            OpKind::Relu => "relu",
            OpKind::Sum => "sum",
            OpKind::Stack => "stack",
        }
    }

    /// Number of inputs, or `None` for variadic kinds.
    pub fn arity(self) -> Option<usize> {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => Some(2),
            OpKind::Neg | OpKind::Tanh | OpKind::Exp | OpKind::Relu | OpKind::Sum => Some(1),
            OpKind::Stack => None,
        }
    }

    fn binary_op(self) -> Option<BinaryOp> {
        match self {
            OpKind::Add => Some(BinaryOp::Add),
            OpKind::Sub => Some(BinaryOp::Sub),
            OpKind::Mul => Some(BinaryOp::Mul),
            OpKind::Div => Some(BinaryOp::Div),
            _ => None,
        }
    }

    fn unary_op(self) -> Option<UnaryOp> {
        match self {
            OpKind::Neg => Some(UnaryOp::Neg),
            OpKind::Tanh => Some(UnaryOp::Tanh),
            OpKind::Exp => Some(UnaryOp::Exp),
            OpKind::Relu => Some(UnaryOp::Relu),
            _ => None,
        }
    }

    /// Shape of the output given the input shapes, or `ShapeMismatch`.
    pub fn output_shape(self, inputs: &[&Shape]) -> Result<Shape> {
        if let Some(arity) = self.arity() {
            if inputs.len() != arity {
                return Err(AutogradError::ShapeMismatch {
                    op: self.name(),
                    expected: Shape::from([arity]),
                    found: Shape::from([inputs.len()]),
                });
            }
        }
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let (a, b) = (inputs[0], inputs[1]);
                a.broadcast(b).ok_or_else(|| AutogradError::ShapeMismatch {
                    op: self.name(),
                    expected: a.clone(),
                    found: b.clone(),
                })
            }
            OpKind::Neg | OpKind::Tanh | OpKind::Exp | OpKind::Relu => Ok(inputs[0].clone()),
            OpKind::Sum => Ok(Shape::scalar()),
            OpKind::Stack => {
                let (first, rest) = inputs.split_first().ok_or(AutogradError::ShapeMismatch {
                    op: self.name(),
                    expected: Shape::from([1]),
                    found: Shape::from([0]),
                })?;
                if let Some(bad) = rest.iter().find(|s| **s != *first) {
                    return Err(AutogradError::ShapeMismatch {
                        op: self.name(),
                        expected: (*first).clone(),
                        found: (*bad).clone(),
                    });
                }
                Ok(first.stacked(inputs.len()))
            }
        }
    }

    /// Runs the forward kernel on the input values.
    pub fn forward(self, inputs: &[&StorageBuffer]) -> Result<StorageBuffer> {
        if let Some(op) = self.binary_op() {
            return inputs[0].binary(op, inputs[1]);
        }
        if let Some(op) = self.unary_op() {
            return inputs[0].unary(op);
        }
        match self {
            OpKind::Sum => inputs[0].sum_all(),
            _ => StorageBuffer::stack(inputs),
        }
    }

    /// Gradient contribution for each input, already reduced to that input's
    /// shape. `upstream` has the output's shape.
    pub fn backward(
        self,
        upstream: &StorageBuffer,
        inputs: &[&StorageBuffer],
        output: &StorageBuffer,
    ) -> Result<Vec<StorageBuffer>> {
        let grads = match self {
            OpKind::Add => vec![upstream.try_clone()?, upstream.try_clone()?],
            OpKind::Sub => vec![upstream.try_clone()?, upstream.unary(UnaryOp::Neg)?],
            OpKind::Mul => vec![
                upstream.binary(BinaryOp::Mul, inputs[1])?,
                upstream.binary(BinaryOp::Mul, inputs[0])?,
            ],
            OpKind::Div => {
                let (a, b) = (inputs[0], inputs[1]);
                let grad_a = upstream.binary(BinaryOp::Div, b)?;
                // -g * a / b^2
                let b_sq = b.binary(BinaryOp::Mul, b)?;
                let grad_b = upstream
                    .binary(BinaryOp::Mul, a)?
                    .binary(BinaryOp::Div, &b_sq)?
                    .unary(UnaryOp::Neg)?;
                vec![grad_a, grad_b]
            }
            OpKind::Neg => vec![upstream.unary(UnaryOp::Neg)?],
            OpKind::Tanh => vec![upstream.gradient(GradOp::Tanh, output)?],
            OpKind::Exp => vec![upstream.binary(BinaryOp::Mul, output)?],
            OpKind::Relu => vec![upstream.gradient(GradOp::Relu, inputs[0])?],
            OpKind::Sum => vec![upstream.expand(&inputs[0].shape())?],
            OpKind::Stack => (0..inputs.len())
                .map(|i| upstream.select(i))
                .collect::<Result<Vec<_>>>()?,
        };

        grads
            .into_iter()
            .zip(inputs.iter())
            .map(|(grad, input)| reduce_to(grad, &input.shape()))
            .collect()
    }
}

// Sums a broadcast gradient back down to a rank-0 input.
fn reduce_to(grad: StorageBuffer, shape: &Shape) -> Result<StorageBuffer> {
    if grad.shape() == *shape {
        Ok(grad)
    } else if shape.is_scalar() {
        grad.sum_all()
    } else {
        Err(AutogradError::ShapeMismatch {
            op: "reduce_to",
            expected: shape.clone(),
            found: grad.shape(),
        })
    }
}
