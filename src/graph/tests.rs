#[cfg(test)]
mod tests {
    use crate::backend::{AcceleratorRuntime, Backend, ReferenceAccelerator};
    use crate::error::AutogradError;
    use crate::graph::{Graph, OpKind, TensorId};
    use crate::shape::Shape;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    /// Elementwise comparison with a small absolute tolerance
    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_add_backward_gives_ones() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_vec(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let b = graph.tensor_from_vec(vec![5.0, 6.0, 7.0, 8.0], [2, 2]).unwrap();
        let c = graph.add(a, b).unwrap();

        assert_eq!(graph.value(c).unwrap(), vec![6.0, 8.0, 10.0, 12.0]);
        graph.backward(c).unwrap();

        assert_eq!(graph.grad(a).unwrap(), vec![1.0; 4]);
        assert_eq!(graph.grad(b).unwrap(), vec![1.0; 4]);
        assert_eq!(graph.grad(c).unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_mul_backward_swaps_operands() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0, 3.0]).unwrap();
        let b = graph.tensor_from_slice(&[4.0, 5.0, 6.0]).unwrap();
        let c = graph.mul(a, b).unwrap();
        graph.backward(c).unwrap();

        assert_eq!(graph.grad(a).unwrap(), graph.value(b).unwrap());
        assert_eq!(graph.grad(b).unwrap(), graph.value(a).unwrap());
    }

    #[test]
    fn test_sub_and_neg_gradients() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[5.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0]).unwrap();
        let c = graph.sub(a, b).unwrap();
        let d = graph.neg(c).unwrap();

        assert_eq!(graph.value(d).unwrap(), vec![-2.0]);
        graph.backward(d).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![-1.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_div_gradient() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[6.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0]).unwrap();
        let c = graph.div(a, b).unwrap();

        assert_eq!(graph.value(c).unwrap(), vec![2.0]);
        graph.backward(c).unwrap();
        // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
        assert_close(&graph.grad(a).unwrap(), &[1.0 / 3.0]);
        assert_close(&graph.grad(b).unwrap(), &[-6.0 / 9.0]);
    }

    #[test]
    fn test_tanh_gradient() {
        let mut graph = Graph::new();
        let x = graph.scalar(0.75).unwrap();
        let y = graph.tanh(x).unwrap();
        graph.backward(y).unwrap();

        let t = 0.75f32.tanh();
        assert_close(&graph.value(y).unwrap(), &[t]);
        assert_close(&graph.grad(x).unwrap(), &[1.0 - t * t]);
    }

    #[test]
    fn test_exp_gradient() {
        let mut graph = Graph::new();
        let x = graph.tensor_from_slice(&[0.0, 1.0]).unwrap();
        let y = graph.exp(x).unwrap();
        graph.backward(y).unwrap();

        let expected = [1.0, 1.0f32.exp()];
        assert_close(&graph.value(y).unwrap(), &expected);
        assert_close(&graph.grad(x).unwrap(), &expected);
    }

    #[test]
    fn test_relu_gradient() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_vec(vec![-1.0, 2.0, -3.0, 4.0], [2, 2]).unwrap();
        let b = graph.relu(a).unwrap();
        let loss = graph.sum(b).unwrap();

        assert_eq!(graph.value(b).unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
        graph.backward(loss).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_sum_reduces_to_rank_zero() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0, 3.0]).unwrap();
        let s = graph.sum(a).unwrap();

        assert!(graph.shape(s).unwrap().is_scalar());
        assert_eq!(graph.value(s).unwrap(), vec![6.0]);

        graph.seed_grad(s, &[1.0]).unwrap();
        graph.backward(s).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_stack_forward_backward() {
        let mut graph = Graph::new();
        let parts: Vec<TensorId> = [1.0, 2.0, 3.0]
            .iter()
            .map(|&v| graph.tensor_from_slice(&[v]).unwrap())
            .collect();
        let stacked = graph.stack(&parts).unwrap();

        assert_eq!(graph.shape(stacked).unwrap(), &Shape::from([3, 1]));
        assert_eq!(graph.value(stacked).unwrap(), vec![1.0, 2.0, 3.0]);

        graph.backward(stacked).unwrap();
        for part in parts {
            assert_eq!(graph.grad(part).unwrap(), vec![1.0]);
        }
    }

    #[test]
    fn test_stack_routes_each_slice_back() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
        let s = graph.stack(&[a, b]).unwrap();
        graph.seed_grad(s, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        graph.backward(s).unwrap();

        assert_eq!(graph.grad(a).unwrap(), vec![1.0, 2.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_scalar_operand_broadcast_and_reduction() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0, 3.0]).unwrap();
        let s = graph.scalar(2.0).unwrap();
        let c = graph.mul(a, s).unwrap();
        let loss = graph.sum(c).unwrap();

        assert_eq!(graph.value(c).unwrap(), vec![2.0, 4.0, 6.0]);
        graph.backward(loss).unwrap();

        assert_eq!(graph.grad(a).unwrap(), vec![2.0, 2.0, 2.0]);
        // The rank-0 operand collects the sum of its broadcast contributions.
        assert_eq!(graph.grad(s).unwrap(), vec![6.0]);
        assert!(graph.shape(s).unwrap().is_scalar());
    }

    #[test]
    fn test_scalar_convenience_ops() {
        let mut graph = Graph::new();
        let x = graph.tensor_from_slice(&[2.0]).unwrap();
        let y = graph.add_scalar(x, 3.0).unwrap();
        let z = graph.mul_scalar(y, 2.0).unwrap();
        assert_eq!(graph.value(z).unwrap(), vec![10.0]);

        graph.backward(z).unwrap();
        assert_eq!(graph.grad(x).unwrap(), vec![2.0]);

        let mut graph = Graph::new();
        let x = graph.tensor_from_slice(&[2.0]).unwrap();
        let y = graph.sub_scalar(x, 1.0).unwrap();
        let z = graph.div_scalar(y, 4.0).unwrap();
        assert_eq!(graph.value(z).unwrap(), vec![0.25]);

        graph.backward(z).unwrap();
        assert_eq!(graph.grad(x).unwrap(), vec![0.25]);
    }

    #[test]
    fn test_diamond_gradients_are_summed() {
        let mut graph = Graph::new();
        let x = graph.tensor_from_slice(&[3.0]).unwrap();
        let a = graph.mul_scalar(x, 2.0).unwrap();
        let b = graph.mul(x, x).unwrap();
        let c = graph.add(a, b).unwrap();
        graph.backward(c).unwrap();

        // dc/dx = 2 + 2x
        assert_eq!(graph.grad(x).unwrap(), vec![8.0]);
    }

    #[test]
    fn test_shared_intermediate_is_finalized_after_all_consumers() {
        let mut graph = Graph::new();
        let x = graph.scalar(0.5).unwrap();
        let h = graph.tanh(x).unwrap();
        let a = graph.mul(h, h).unwrap();
        let b = graph.add(h, a).unwrap();
        let d = graph.add(a, b).unwrap();
        graph.backward(d).unwrap();

        // d = 2h^2 + h, so dd/dh = 4h + 1
        let t = 0.5f32.tanh();
        assert_close(&graph.grad(h).unwrap(), &[4.0 * t + 1.0]);
        assert_close(&graph.grad(x).unwrap(), &[(4.0 * t + 1.0) * (1.0 - t * t)]);
    }

    #[test]
    fn test_shape_mismatch_leaves_graph_untouched() {
        let mut graph = Graph::new();
        let a = graph.zeros([2, 2]).unwrap();
        let b = graph.zeros([2, 1]).unwrap();
        let before = graph.len();

        let err = graph.add(a, b).unwrap_err();
        assert!(matches!(err, AutogradError::ShapeMismatch { op: "add", .. }));
        assert_eq!(graph.len(), before);
        assert_eq!(graph.value(a).unwrap(), vec![0.0; 4]);
        assert_eq!(graph.value(b).unwrap(), vec![0.0; 2]);
        assert!(graph.operation(a).unwrap().is_none());
    }

    #[test]
    fn test_stack_shape_errors() {
        let mut graph = Graph::new();
        let a = graph.zeros([2]).unwrap();
        let b = graph.zeros([3]).unwrap();
        assert!(matches!(
            graph.stack(&[a, b]),
            Err(AutogradError::ShapeMismatch { op: "stack", .. })
        ));
        assert!(matches!(
            graph.stack(&[]),
            Err(AutogradError::ShapeMismatch { op: "stack", .. })
        ));
    }

    #[test]
    fn test_construction_length_mismatch() {
        let mut graph = Graph::new();
        let err = graph.tensor_from_vec(vec![1.0, 2.0, 3.0], [2, 2]).unwrap_err();
        assert!(matches!(err, AutogradError::ShapeMismatch { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_gradients_accumulate_across_passes() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
        let c = graph.add(a, b).unwrap();

        graph.backward(c).unwrap();
        graph.backward(c).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![2.0, 2.0]);

        graph.zero_grad_tensor(a).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![0.0, 0.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_repeated_passes_add_one_pass_through_intermediates() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
        let ab = graph.mul(a, b).unwrap();
        let loss = graph.sum(ab).unwrap();

        graph.backward(loss).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![3.0, 4.0]);

        // The intermediate already holds [1, 1]; only this pass's share flows on.
        graph.backward(loss).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![6.0, 8.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![2.0, 4.0]);
        assert_eq!(graph.grad(ab).unwrap(), vec![2.0, 2.0]);
        assert_eq!(graph.grad(loss).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_failed_backward_leaves_gradients_untouched() {
        let mut graph = Graph::with_accelerator(Arc::new(ReferenceAccelerator::new()));
        let a = graph.tensor_from_slice(&[0.5, -1.0]).unwrap();
        let b = graph.tensor_from_slice(&[2.0, 0.25]).unwrap();
        let c = graph.mul(a, b).unwrap();
        let d = graph.tanh(c).unwrap();
        let root = graph.sum(d).unwrap();

        graph.to_device(c, Backend::Accelerator).unwrap();
        assert_eq!(
            graph.backward(root).unwrap_err(),
            AutogradError::BackendMismatch {
                expected: Backend::Host,
                found: Backend::Accelerator,
            }
        );
        assert_eq!(graph.grad(root).unwrap(), vec![0.0]);
        assert_eq!(graph.grad(d).unwrap(), vec![0.0, 0.0]);
        assert_eq!(graph.grad(a).unwrap(), vec![0.0, 0.0]);
        assert_eq!(graph.read_grad(c, Backend::Accelerator).unwrap(), vec![0.0, 0.0]);

        // A retry after fixing placement counts the pass exactly once.
        graph.to_device(c, Backend::Host).unwrap();
        graph.backward(root).unwrap();
        let expected: Vec<f32> = [(0.5f32, 2.0f32), (-1.0, 0.25)]
            .iter()
            .map(|&(x, y)| y * (1.0 - (x * y).tanh().powi(2)))
            .collect();
        assert_close(&graph.grad(a).unwrap(), &expected);
        assert_eq!(graph.grad(root).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_truncate_releases_tensors_after_checkpoint() {
        let mut graph = Graph::new();
        let w = graph.parameter_from_vec(vec![1.0, 2.0], [2]).unwrap();
        let checkpoint = graph.checkpoint();

        let y = graph.mul_scalar(w, 3.0).unwrap();
        let loss = graph.sum(y).unwrap();
        graph.backward(loss).unwrap();
        assert_eq!(graph.len(), 4);

        assert_eq!(graph.truncate(checkpoint), 3);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.truncate(checkpoint), 0);
        assert_eq!(graph.value(w).unwrap(), vec![1.0, 2.0]);
        assert_eq!(graph.grad(w).unwrap(), vec![3.0, 3.0]);
        assert_eq!(graph.parameters(), vec![w]);
        assert_eq!(graph.value(loss).unwrap_err(), AutogradError::UnknownTensor(loss));

        // New tensors reuse the released ids.
        let z = graph.neg(w).unwrap();
        assert_eq!(z, TensorId(1));
    }

    #[test]
    fn test_truncate_frees_device_memory() {
        let runtime = Arc::new(ReferenceAccelerator::new());
        let mut graph = Graph::with_accelerator(runtime.clone());
        graph.set_active_backend(Backend::Accelerator).unwrap();
        let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
        let checkpoint = graph.checkpoint();

        let b = graph.exp(a).unwrap();
        let c = graph.sum(b).unwrap();
        graph.backward(c).unwrap();
        runtime.synchronize().unwrap();
        assert_eq!(runtime.live_buffers(), 6);

        graph.truncate(checkpoint);
        runtime.synchronize().unwrap();
        assert_eq!(runtime.live_buffers(), 2);
        assert_close(
            &graph.read_grad(a, Backend::Accelerator).unwrap(),
            &[1.0f32.exp(), 2.0f32.exp()],
        );
    }

    #[test]
    fn test_preseeded_root_is_used_as_is() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0, 2.0]).unwrap();
        let b = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
        let c = graph.mul(a, b).unwrap();

        graph.seed_grad(c, &[2.0, 0.0]).unwrap();
        graph.backward(c).unwrap();
        assert_eq!(graph.grad(a).unwrap(), vec![6.0, 0.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![2.0, 0.0]);
    }

    #[test]
    fn test_backward_rejects_empty_root() {
        let mut graph = Graph::new();
        let empty = graph.zeros([0]).unwrap();
        assert!(matches!(
            graph.backward(empty),
            Err(AutogradError::InvalidRoot { .. })
        ));
    }

    #[test]
    fn test_unknown_tensor() {
        let mut graph = Graph::new();
        let ghost = TensorId(42);
        assert_eq!(
            graph.backward(ghost).unwrap_err(),
            AutogradError::UnknownTensor(ghost)
        );
        assert!(graph.value(ghost).is_err());
    }

    #[test]
    fn test_only_leaves_are_writable() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0]).unwrap();
        let b = graph.exp(a).unwrap();

        graph.set_value(a, &[0.0]).unwrap();
        assert_eq!(graph.value(a).unwrap(), vec![0.0]);

        assert_eq!(graph.set_value(b, &[0.0]).unwrap_err(), AutogradError::NotALeaf(b));
        assert_eq!(
            graph.mark_parameter(b, true).unwrap_err(),
            AutogradError::NotALeaf(b)
        );
    }

    #[test]
    fn test_parameters_and_zero_grad() {
        let mut graph = Graph::new();
        let w = graph.parameter_from_vec(vec![1.0, 2.0], [2]).unwrap();
        let x = graph.tensor_from_slice(&[3.0, 4.0]).unwrap();
        let b = graph.parameter_from_vec(vec![0.5], Shape::scalar()).unwrap();
        let wx = graph.mul(w, x).unwrap();
        let dot = graph.sum(wx).unwrap();
        let out = graph.add(dot, b).unwrap();

        assert_eq!(graph.parameters(), vec![w, b]);
        assert!(graph.is_parameter(w).unwrap());
        assert!(!graph.is_parameter(x).unwrap());

        graph.backward(out).unwrap();
        assert_eq!(graph.grad(w).unwrap(), vec![3.0, 4.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![1.0]);

        graph.zero_grad().unwrap();
        assert_eq!(graph.grad(w).unwrap(), vec![0.0, 0.0]);
        assert_eq!(graph.grad(b).unwrap(), vec![0.0]);
        // Non-parameters are left alone.
        assert_eq!(graph.grad(x).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_topological_order() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0]).unwrap();
        let b = graph.tensor_from_slice(&[2.0]).unwrap();
        let c = graph.add(a, b).unwrap();
        let d = graph.mul(c, a).unwrap();
        let unrelated = graph.tensor_from_slice(&[9.0]).unwrap();

        let order = graph.topological_order(d).unwrap();
        assert_eq!(order, vec![d, c, b, a]);
        assert!(!order.contains(&unrelated));
    }

    #[test]
    fn test_operation_introspection() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.0]).unwrap();
        let b = graph.tensor_from_slice(&[2.0]).unwrap();
        let c = graph.sub(a, b).unwrap();

        let op = graph.operation(c).unwrap().unwrap();
        assert_eq!(op.kind, OpKind::Sub);
        assert_eq!(op.inputs, vec![a, b]);
        assert!(graph.operation(a).unwrap().is_none());
        assert_eq!(graph.backend(c).unwrap(), Backend::Host);
    }

    #[test]
    fn test_labels_and_describe() {
        let mut graph = Graph::new();
        let a = graph.tensor_from_slice(&[1.5, -2.0]).unwrap();
        graph.set_label(a, "input").unwrap();
        let b = graph.tanh(a).unwrap();
        graph.backward(b).unwrap();

        assert_eq!(graph.label(a).unwrap(), Some("input"));
        assert_eq!(graph.label(b).unwrap(), None);

        let text = graph.describe(a).unwrap();
        assert!(text.contains("input"));
        assert!(text.contains("value=[1.5, -2.0]"));
        assert!(text.contains("grad="));
        assert!(graph.describe(b).unwrap().contains("[tanh]"));
    }

    #[test]
    fn test_accelerator_backend_requires_runtime() {
        let mut graph = Graph::new();
        assert_eq!(
            graph.set_active_backend(Backend::Accelerator).unwrap_err(),
            AutogradError::BackendUnavailable(Backend::Accelerator)
        );
        assert_eq!(graph.active_backend(), Backend::Host);

        let a = graph.tensor_from_slice(&[1.0]).unwrap();
        assert!(matches!(
            graph.to_device(a, Backend::Accelerator),
            Err(AutogradError::TransferFailure { .. })
        ));
        assert_eq!(graph.backend(a).unwrap(), Backend::Host);
    }
}
