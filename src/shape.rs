// src/shape.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimensions of a tensor. The empty shape is a rank-0 scalar holding one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of elements. A rank-0 shape holds exactly one.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Output shape of an elementwise binary op, or `None` when incompatible.
    ///
    /// Only equal shapes or a rank-0 operand on either side combine. Nothing is
    /// padded or truncated, so `[2, 2]` against `[2, 1]` is rejected.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        if self == other {
            Some(self.clone())
        } else if other.is_scalar() {
            Some(self.clone())
        } else if self.is_scalar() {
            Some(other.clone())
        } else {
            None
        }
    }

    /// Shape with a new leading axis of size `n`.
    pub fn stacked(&self, n: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.rank() + 1);
        dims.push(n);
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn test_scalar_shape_holds_one_element() {
        let s = Shape::scalar();
        assert!(s.is_scalar());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.numel(), 1);
        assert_eq!(format!("{}", s), "[]");
    }

    #[test]
    fn test_broadcast_rules() {
        let a = Shape::from([2, 2]);
        let b = Shape::from([2, 1]);
        let s = Shape::scalar();

        assert_eq!(a.broadcast(&a), Some(a.clone()));
        assert_eq!(a.broadcast(&s), Some(a.clone()));
        assert_eq!(s.broadcast(&a), Some(a.clone()));
        assert_eq!(a.broadcast(&b), None);
        // A single-element rank-1 tensor is not a scalar.
        assert_eq!(Shape::from([1]).broadcast(&Shape::from([3])), None);
    }

    #[test]
    fn test_stacked_adds_leading_axis() {
        assert_eq!(Shape::from([2, 3]).stacked(4), Shape::from([4, 2, 3]));
        assert_eq!(Shape::scalar().stacked(3), Shape::from([3]));
    }
}
