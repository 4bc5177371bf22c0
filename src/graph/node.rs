use super::op::Operation;
use crate::backend::StorageBuffer;
use crate::shape::Shape;

/// Handle to a tensor in a [`Graph`](super::Graph) arena.
///
/// Ids are assigned in creation order, so every operation output has a larger
/// id than each of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub usize);

impl TensorId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TensorId({})", self.0)
    }
}

// A value in the computational graph together with its accumulated gradient.
// Leaves have no producing operation.
#[derive(Debug)]
pub struct TensorNode {
    pub id: TensorId,
    pub shape: Shape,
    pub value: StorageBuffer,
    pub grad: StorageBuffer,
    pub op: Option<Operation>,
    pub is_parameter: bool,
    pub label: Option<String>,
}

impl TensorNode {
    pub fn leaf(id: TensorId, value: StorageBuffer, grad: StorageBuffer) -> Self {
        Self {
            id,
            shape: value.shape(),
            value,
            grad,
            op: None,
            is_parameter: false,
            label: None,
        }
    }

    pub fn from_op(id: TensorId, op: Operation, value: StorageBuffer, grad: StorageBuffer) -> Self {
        Self {
            op: Some(op),
            ..Self::leaf(id, value, grad)
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }

    pub fn inputs(&self) -> &[TensorId] {
        self.op.as_ref().map(|op| op.inputs.as_slice()).unwrap_or(&[])
    }
}
