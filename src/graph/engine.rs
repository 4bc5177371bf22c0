use super::node::{TensorId, TensorNode};
use super::op::{OpKind, Operation};
use crate::backend::{AcceleratorRuntime, Backend, DeviceRegistry, StorageBuffer};
use crate::config::EngineConfig;
use crate::error::{AutogradError, Result};
use crate::shape::Shape;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, info};

/// Arena position returned by [`Graph::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

/// Define-by-run computational graph.
///
/// Tensors live in an arena owned by the graph and are addressed by
/// [`TensorId`]. Every operation runs its forward kernel immediately and
/// records itself on the output tensor, so the graph is always acyclic and
/// ids respect the dependency order.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<TensorNode>,
    devices: DeviceRegistry,
}

impl Graph {
    /// Host-only graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: DeviceRegistry) -> Self {
        Self {
            nodes: Vec::new(),
            devices,
        }
    }

    pub fn with_accelerator(runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        Self::with_devices(DeviceRegistry::with_accelerator(runtime))
    }

    /// Builds the device context described by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let devices = config.build_registry()?;
        info!(backend = %devices.active_backend(), accelerator = devices.has_accelerator(), "graph created");
        Ok(Self::with_devices(devices))
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn active_backend(&self) -> Backend {
        self.devices.active_backend()
    }

    /// Backend used for tensors created from now on. Existing tensors stay put.
    pub fn set_active_backend(&mut self, backend: Backend) -> Result<()> {
        self.devices.set_active_backend(backend)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Marks the current end of the arena. Everything created afterwards can
    /// be released with [`Graph::truncate`].
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.nodes.len())
    }

    /// Drops every tensor created after `checkpoint` together with its
    /// buffers, and returns how many were released. Ids before the
    /// checkpoint stay valid; later ids become unknown.
    ///
    /// A training loop takes a checkpoint once its parameters and inputs
    /// exist and truncates after each optimizer step.
    pub fn truncate(&mut self, checkpoint: Checkpoint) -> usize {
        let released = self.nodes.len().saturating_sub(checkpoint.0);
        self.nodes.truncate(checkpoint.0);
        if released > 0 {
            debug!(released, remaining = self.nodes.len(), "graph truncated");
        }
        released
    }

    fn node(&self, id: TensorId) -> Result<&TensorNode> {
        self.nodes
            .get(id.index())
            .ok_or(AutogradError::UnknownTensor(id))
    }

    fn node_mut(&mut self, id: TensorId) -> Result<&mut TensorNode> {
        self.nodes
            .get_mut(id.index())
            .ok_or(AutogradError::UnknownTensor(id))
    }

    fn next_id(&self) -> TensorId {
        TensorId(self.nodes.len())
    }

    fn push_leaf(&mut self, value: StorageBuffer) -> Result<TensorId> {
        let grad = StorageBuffer::zeros(&value.shape(), value.backend(), &self.devices)?;
        let id = self.next_id();
        self.nodes.push(TensorNode::leaf(id, value, grad));
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Leaf construction
    // ---------------------------------------------------------------------

    /// Zero-filled leaf on the active backend.
    pub fn zeros(&mut self, shape: impl Into<Shape>) -> Result<TensorId> {
        let value = StorageBuffer::zeros(&shape.into(), self.active_backend(), &self.devices)?;
        self.push_leaf(value)
    }

    /// Leaf holding `values` in row-major order on the active backend.
    pub fn tensor_from_vec(&mut self, values: Vec<f32>, shape: impl Into<Shape>) -> Result<TensorId> {
        let value =
            StorageBuffer::from_vec(values, &shape.into(), self.active_backend(), &self.devices)?;
        self.push_leaf(value)
    }

    /// Rank-1 leaf whose length is inferred from `values`.
    pub fn tensor_from_slice(&mut self, values: &[f32]) -> Result<TensorId> {
        self.tensor_from_vec(values.to_vec(), [values.len()])
    }

    /// Rank-0 leaf.
    pub fn scalar(&mut self, value: f32) -> Result<TensorId> {
        self.tensor_from_vec(vec![value], Shape::scalar())
    }

    /// Trainable leaf.
    pub fn parameter_from_vec(
        &mut self,
        values: Vec<f32>,
        shape: impl Into<Shape>,
    ) -> Result<TensorId> {
        let id = self.tensor_from_vec(values, shape)?;
        self.mark_parameter(id, true)?;
        Ok(id)
    }

    /// Flags a leaf as trainable. Operation outputs cannot be parameters.
    pub fn mark_parameter(&mut self, id: TensorId, is_parameter: bool) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(AutogradError::NotALeaf(id));
        }
        node.is_parameter = is_parameter;
        Ok(())
    }

    pub fn is_parameter(&self, id: TensorId) -> Result<bool> {
        Ok(self.node(id)?.is_parameter)
    }

    /// Parameters in creation order.
    pub fn parameters(&self) -> Vec<TensorId> {
        self.nodes
            .iter()
            .filter(|n| n.is_parameter)
            .map(|n| n.id)
            .collect()
    }

    pub fn set_label(&mut self, id: TensorId, label: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.label = Some(label.into());
        Ok(())
    }

    pub fn label(&self, id: TensorId) -> Result<Option<&str>> {
        Ok(self.node(id)?.label.as_deref())
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Validates shapes and backends, runs the forward kernel and records
    /// the operation. On error nothing is added to the graph.
    pub fn apply(&mut self, kind: OpKind, inputs: Vec<TensorId>) -> Result<TensorId> {
        let (value, shape) = {
            let nodes = inputs
                .iter()
                .map(|&id| self.node(id))
                .collect::<Result<Vec<_>>>()?;
            let shapes: Vec<&Shape> = nodes.iter().map(|n| &n.shape).collect();
            let shape = kind.output_shape(&shapes)?;

            let backend = nodes[0].value.backend();
            if let Some(other) = nodes.iter().find(|n| n.value.backend() != backend) {
                return Err(AutogradError::BackendMismatch {
                    expected: backend,
                    found: other.value.backend(),
                });
            }

            let values: Vec<&StorageBuffer> = nodes.iter().map(|n| &n.value).collect();
            (kind.forward(&values)?, shape)
        };
        debug_assert_eq!(value.shape(), shape);

        let grad = StorageBuffer::zeros(&shape, value.backend(), &self.devices)?;
        let id = self.next_id();
        debug!(op = %kind, %id, shape = %shape, backend = %value.backend(), "forward");
        self.nodes
            .push(TensorNode::from_op(id, Operation::new(kind, inputs), value, grad));
        Ok(id)
    }

    // Rank-0 constant on the same backend as `like`.
    fn constant_like(&mut self, like: TensorId, value: f32) -> Result<TensorId> {
        let backend = self.node(like)?.value.backend();
        let buffer = StorageBuffer::from_vec(vec![value], &Shape::scalar(), backend, &self.devices)?;
        self.push_leaf(buffer)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Add, vec![a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Sub, vec![a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Mul, vec![a, b])
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Div, vec![a, b])
    }

    pub fn neg(&mut self, a: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Neg, vec![a])
    }

    pub fn tanh(&mut self, a: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Tanh, vec![a])
    }

    pub fn exp(&mut self, a: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Exp, vec![a])
    }

    pub fn relu(&mut self, a: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Relu, vec![a])
    }

    /// Sum of every element as a rank-0 tensor.
    pub fn sum(&mut self, a: TensorId) -> Result<TensorId> {
        self.apply(OpKind::Sum, vec![a])
    }

    pub fn stack(&mut self, inputs: &[TensorId]) -> Result<TensorId> {
        self.apply(OpKind::Stack, inputs.to_vec())
    }

    // Scalar variants go through a rank-0 constant leaf so they share the
    // broadcast path of the binary kinds.
    pub fn add_scalar(&mut self, a: TensorId, scalar: f32) -> Result<TensorId> {
        let s = self.constant_like(a, scalar)?;
        self.add(a, s)
    }

    pub fn sub_scalar(&mut self, a: TensorId, scalar: f32) -> Result<TensorId> {
        let s = self.constant_like(a, scalar)?;
        self.sub(a, s)
    }

    pub fn mul_scalar(&mut self, a: TensorId, scalar: f32) -> Result<TensorId> {
        let s = self.constant_like(a, scalar)?;
        self.mul(a, s)
    }

    pub fn div_scalar(&mut self, a: TensorId, scalar: f32) -> Result<TensorId> {
        let s = self.constant_like(a, scalar)?;
        self.div(a, s)
    }

    // ---------------------------------------------------------------------
    // Backward pass
    // ---------------------------------------------------------------------

    /// Every tensor reachable from `root`, ordered so each one comes after
    /// all of its consumers. Unrelated tensors are ordered newest first.
    pub fn topological_order(&self, root: TensorId) -> Result<Vec<TensorId>> {
        self.node(root)?;
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        let mut reachable = Vec::new();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            reachable.push(id);
            stack.extend(self.nodes[id.index()].inputs().iter().copied());
        }
        // Inputs always precede their outputs in the arena, so descending
        // ids finalize a node only after every consumer has run.
        reachable.sort_unstable_by(|a, b| b.cmp(a));
        Ok(reachable)
    }

    /// Reverse-mode pass from `root`.
    ///
    /// If the root gradient is all zero it is seeded with ones of the root's
    /// shape; otherwise its current contents are used as the seed, which lets
    /// callers chain passes through [`Graph::seed_grad`].
    ///
    /// Each node propagates only the gradient that reached it during this
    /// pass, and the totals are added into the stored gradients once the
    /// whole pass has succeeded. On error no gradient buffer is touched.
    /// Gradients are never reset here.
    pub fn backward(&mut self, root: TensorId) -> Result<()> {
        let node = self.node(root)?;
        if node.shape.numel() == 0 {
            return Err(AutogradError::InvalidRoot {
                id: root,
                reason: format!("shape {} has no elements", node.shape),
            });
        }

        let order = self.topological_order(root)?;
        self.check_backends(root, &order)?;

        let node = self.node(root)?;
        let fresh_seed = node.grad.is_all_zero()?;
        let seed = if fresh_seed {
            let mut ones = StorageBuffer::zeros(&node.shape, node.grad.backend(), &self.devices)?;
            ones.fill(1.0)?;
            ones
        } else {
            node.grad.try_clone()?
        };

        debug!(%root, nodes = order.len(), "backward pass");
        let mut pending = HashMap::with_capacity(order.len());
        pending.insert(root, seed);
        for &id in &order {
            self.backward_node(id, &mut pending)?;
        }

        // Build every new buffer before swapping any of them in.
        let mut updated = Vec::with_capacity(pending.len());
        for (id, delta) in pending {
            if id == root {
                if fresh_seed {
                    updated.push((id, delta));
                }
                continue;
            }
            let mut grad = self.node(id)?.grad.try_clone()?;
            grad.accumulate(&delta)?;
            updated.push((id, grad));
        }
        for (id, grad) in updated {
            self.node_mut(id)?.grad = grad;
        }
        Ok(())
    }

    // Every reachable value and gradient must live where the root lives.
    fn check_backends(&self, root: TensorId, order: &[TensorId]) -> Result<()> {
        let expected = self.node(root)?.value.backend();
        for &id in order {
            let node = self.node(id)?;
            for found in [node.value.backend(), node.grad.backend()] {
                if found != expected {
                    return Err(AutogradError::BackendMismatch { expected, found });
                }
            }
        }
        Ok(())
    }

    fn backward_node(
        &self,
        id: TensorId,
        pending: &mut HashMap<TensorId, StorageBuffer>,
    ) -> Result<()> {
        let node = self.node(id)?;
        let Some(op) = &node.op else {
            return Ok(());
        };
        let Some(upstream) = pending.get(&id) else {
            return Ok(());
        };
        let inputs: Vec<&StorageBuffer> = op
            .inputs
            .iter()
            .map(|&input| self.node(input).map(|n| &n.value))
            .collect::<Result<_>>()?;
        let contributions = op.kind.backward(upstream, &inputs, &node.value)?;

        debug!(%id, inputs = op.inputs.len(), "backward step");
        for (&input, contribution) in op.inputs.iter().zip(contributions) {
            match pending.entry(input) {
                Entry::Occupied(mut slot) => slot.get_mut().accumulate(&contribution)?,
                Entry::Vacant(slot) => {
                    slot.insert(contribution);
                }
            }
        }
        Ok(())
    }

    /// Overwrites a gradient buffer, e.g. to seed a chained backward pass.
    pub fn seed_grad(&mut self, id: TensorId, values: &[f32]) -> Result<()> {
        let node = self.node_mut(id)?;
        let backend = node.grad.backend();
        node.grad.write(backend, values)
    }

    pub fn zero_grad_tensor(&mut self, id: TensorId) -> Result<()> {
        self.node_mut(id)?.grad.zero()
    }

    /// Resets the gradient of every parameter.
    pub fn zero_grad(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.is_parameter) {
            node.grad.zero()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Device placement and access
    // ---------------------------------------------------------------------

    /// Moves value and gradient to `target`. Either both move or neither
    /// does.
    pub fn to_device(&mut self, id: TensorId, target: Backend) -> Result<()> {
        let node = self.node(id)?;
        if node.value.backend() == target && node.grad.backend() == target {
            return Ok(());
        }
        let value = node.value.transferred(target, &self.devices)?;
        let grad = node.grad.transferred(target, &self.devices)?;
        let node = self.node_mut(id)?;
        node.value = value;
        node.grad = grad;
        info!(%id, %target, "tensor moved");
        Ok(())
    }

    pub fn backend(&self, id: TensorId) -> Result<Backend> {
        Ok(self.node(id)?.value.backend())
    }

    pub fn shape(&self, id: TensorId) -> Result<&Shape> {
        Ok(&self.node(id)?.shape)
    }

    pub fn operation(&self, id: TensorId) -> Result<Option<&Operation>> {
        Ok(self.node(id)?.op.as_ref())
    }

    /// Host read of the value. Fails with `BackendMismatch` for tensors
    /// resident elsewhere.
    pub fn value(&self, id: TensorId) -> Result<Vec<f32>> {
        self.read_value(id, Backend::Host)
    }

    /// Host read of the gradient.
    pub fn grad(&self, id: TensorId) -> Result<Vec<f32>> {
        self.read_grad(id, Backend::Host)
    }

    pub fn read_value(&self, id: TensorId, declared: Backend) -> Result<Vec<f32>> {
        self.node(id)?.value.read(declared)
    }

    pub fn read_grad(&self, id: TensorId, declared: Backend) -> Result<Vec<f32>> {
        self.node(id)?.grad.read(declared)
    }

    /// Host write of a leaf value.
    pub fn set_value(&mut self, id: TensorId, values: &[f32]) -> Result<()> {
        self.write_value(id, Backend::Host, values)
    }

    pub fn write_value(&mut self, id: TensorId, declared: Backend, values: &[f32]) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(AutogradError::NotALeaf(id));
        }
        node.value.write(declared, values)
    }

    /// value += alpha * grad on the tensor's own backend.
    pub fn apply_gradient(&mut self, id: TensorId, alpha: f32) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(AutogradError::NotALeaf(id));
        }
        node.value.axpy(alpha, &node.grad)
    }

    /// Human-readable summary of a tensor's value and gradient.
    pub fn describe(&self, id: TensorId) -> Result<String> {
        let node = self.node(id)?;
        let op = node
            .op
            .as_ref()
            .map(|op| op.kind.name())
            .unwrap_or(if node.is_parameter { "parameter" } else { "leaf" });
        let label = node
            .label
            .as_deref()
            .map(|l| format!(" '{}'", l))
            .unwrap_or_default();
        Ok(format!(
            "{}{} [{}] shape={} backend={} value={:?} grad={:?}",
            id,
            label,
            op,
            node.shape,
            node.value.backend(),
            node.value.snapshot()?,
            node.grad.snapshot()?,
        ))
    }
}
