#[cfg(test)]
mod tests {
    use crate::backend::{
        AcceleratorRuntime, Backend, BinaryOp, DevicePtr, DeviceRegistry, GradOp, Launch, Operand,
        ReferenceAccelerator, StorageBuffer, UnaryOp,
    };
    use crate::error::AutogradError;
    use crate::shape::Shape;
    use std::sync::Arc;

    fn reference_devices() -> (Arc<ReferenceAccelerator>, DeviceRegistry) {
        let runtime = Arc::new(ReferenceAccelerator::new());
        let devices = DeviceRegistry::with_accelerator(runtime.clone());
        (runtime, devices)
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("host".parse::<Backend>().unwrap(), Backend::Host);
        assert_eq!("CUDA".parse::<Backend>().unwrap(), Backend::Accelerator);
        assert!(matches!("tpu".parse::<Backend>(), Err(AutogradError::Config(_))));
        assert_eq!(Backend::Accelerator.to_string(), "accelerator");
    }

    #[test]
    fn test_registry_does_not_relocate_existing_buffers() {
        let (_, mut devices) = reference_devices();
        let shape = Shape::from([2]);
        let host = StorageBuffer::zeros(&shape, devices.active_backend(), &devices).unwrap();

        devices.set_active_backend(Backend::Accelerator).unwrap();
        let device = StorageBuffer::zeros(&shape, devices.active_backend(), &devices).unwrap();

        assert_eq!(host.backend(), Backend::Host);
        assert_eq!(device.backend(), Backend::Accelerator);
    }

    #[test]
    fn test_declared_backend_must_match() {
        let (_, devices) = reference_devices();
        let shape = Shape::from([3]);
        let mut buffer =
            StorageBuffer::from_vec(vec![1.0, 2.0, 3.0], &shape, Backend::Accelerator, &devices)
                .unwrap();

        assert_eq!(
            buffer.read(Backend::Host).unwrap_err(),
            AutogradError::BackendMismatch {
                expected: Backend::Host,
                found: Backend::Accelerator,
            }
        );
        assert!(buffer.write(Backend::Host, &[0.0; 3]).is_err());

        assert_eq!(buffer.read(Backend::Accelerator).unwrap(), vec![1.0, 2.0, 3.0]);
        buffer.write(Backend::Accelerator, &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(buffer.read(Backend::Accelerator).unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_transfer_round_trip() {
        let (_, devices) = reference_devices();
        let shape = Shape::from([2, 2]);
        let values = vec![0.1, -0.2, 0.3, -0.4];
        let mut buffer =
            StorageBuffer::from_vec(values.clone(), &shape, Backend::Host, &devices).unwrap();

        buffer.transfer(Backend::Accelerator, &devices).unwrap();
        assert_eq!(buffer.backend(), Backend::Accelerator);
        assert_eq!(buffer.shape(), shape);

        buffer.transfer(Backend::Host, &devices).unwrap();
        assert_eq!(buffer.backend(), Backend::Host);
        assert_eq!(buffer.read(Backend::Host).unwrap(), values);
    }

    #[test]
    fn test_failed_transfer_keeps_buffer() {
        let runtime = Arc::new(ReferenceAccelerator::with_capacity(4));
        let devices = DeviceRegistry::with_accelerator(runtime.clone());
        let shape = Shape::from([8]);
        let values: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut buffer =
            StorageBuffer::from_vec(values.clone(), &shape, Backend::Host, &devices).unwrap();

        let err = buffer.transfer(Backend::Accelerator, &devices).unwrap_err();
        assert!(matches!(
            err,
            AutogradError::TransferFailure {
                target: Backend::Accelerator,
                ..
            }
        ));
        assert_eq!(buffer.backend(), Backend::Host);
        assert_eq!(buffer.read(Backend::Host).unwrap(), values);
        assert_eq!(runtime.live_buffers(), 0);
    }

    #[test]
    fn test_transfer_without_accelerator() {
        let devices = DeviceRegistry::new();
        let mut buffer =
            StorageBuffer::from_vec(vec![1.0], &Shape::from([1]), Backend::Host, &devices).unwrap();
        assert!(matches!(
            buffer.transfer(Backend::Accelerator, &devices),
            Err(AutogradError::TransferFailure { .. })
        ));
        assert!(matches!(
            StorageBuffer::zeros(&Shape::from([1]), Backend::Accelerator, &devices),
            Err(AutogradError::BackendUnavailable(Backend::Accelerator))
        ));
    }

    #[test]
    fn test_launches_are_deferred_until_read() {
        let (runtime, devices) = reference_devices();
        let shape = Shape::from([3]);
        let x = StorageBuffer::from_vec(vec![-1.0, 0.0, 2.0], &shape, Backend::Accelerator, &devices)
            .unwrap();

        let y = x.unary(UnaryOp::Relu).unwrap();
        let z = y.binary(BinaryOp::Mul, &x).unwrap();
        assert_eq!(runtime.pending_launches(), 2);
        let completed = runtime.completed_launches();

        assert_eq!(z.read(Backend::Accelerator).unwrap(), vec![0.0, 0.0, 4.0]);
        assert_eq!(runtime.pending_launches(), 0);
        assert_eq!(runtime.completed_launches(), completed + 2);
    }

    #[test]
    fn test_accelerator_kernels_match_host() {
        let (_, devices) = reference_devices();
        let shape = Shape::from([2, 2]);
        let a_vals = vec![0.5, -1.0, 1.5, 2.0];
        let b_vals = vec![2.0, 4.0, -0.5, 1.0];

        for backend in [Backend::Host, Backend::Accelerator] {
            let a = StorageBuffer::from_vec(a_vals.clone(), &shape, backend, &devices).unwrap();
            let b = StorageBuffer::from_vec(b_vals.clone(), &shape, backend, &devices).unwrap();
            let s = StorageBuffer::from_vec(vec![3.0], &Shape::scalar(), backend, &devices).unwrap();

            let div = a.binary(BinaryOp::Div, &b).unwrap();
            assert_eq!(div.read(backend).unwrap(), vec![0.25, -0.25, -3.0, 2.0]);

            let scaled = s.binary(BinaryOp::Sub, &a).unwrap();
            assert_eq!(scaled.shape(), shape);
            assert_eq!(scaled.read(backend).unwrap(), vec![2.5, 4.0, 1.5, 1.0]);

            let grad = b.gradient(GradOp::Relu, &a).unwrap();
            assert_eq!(grad.read(backend).unwrap(), vec![2.0, 0.0, -0.5, 1.0]);

            let total = a.sum_all().unwrap();
            assert!(total.shape().is_scalar());
            assert_eq!(total.read(backend).unwrap(), vec![3.0]);

            let expanded = total.expand(&shape).unwrap();
            assert_eq!(expanded.read(backend).unwrap(), vec![3.0; 4]);

            let stacked = StorageBuffer::stack(&[&a, &b]).unwrap();
            assert_eq!(stacked.shape(), Shape::from([2, 2, 2]));
            let second = stacked.select(1).unwrap();
            assert_eq!(second.read(backend).unwrap(), b_vals);
            assert!(stacked.select(2).is_err());

            let mut acc = a.try_clone().unwrap();
            acc.axpy(-2.0, &b).unwrap();
            assert_eq!(acc.read(backend).unwrap(), vec![-3.5, -9.0, 2.5, 0.0]);
            acc.zero().unwrap();
            assert!(acc.is_all_zero().unwrap());
            // The clone is independent of its source.
            assert_eq!(a.read(backend).unwrap(), a_vals);
        }
    }

    #[test]
    fn test_mixed_backends_are_rejected() {
        let (_, devices) = reference_devices();
        let shape = Shape::from([2]);
        let host = StorageBuffer::from_vec(vec![1.0, 2.0], &shape, Backend::Host, &devices).unwrap();
        let device =
            StorageBuffer::from_vec(vec![1.0, 2.0], &shape, Backend::Accelerator, &devices).unwrap();

        assert_eq!(
            host.binary(BinaryOp::Add, &device).unwrap_err(),
            AutogradError::BackendMismatch {
                expected: Backend::Host,
                found: Backend::Accelerator,
            }
        );
        assert!(StorageBuffer::stack(&[&device, &host]).is_err());
    }

    #[test]
    fn test_dropped_buffers_are_released_in_order() {
        let (runtime, devices) = reference_devices();
        let shape = Shape::from([4]);
        let a = StorageBuffer::from_vec(vec![1.0; 4], &shape, Backend::Accelerator, &devices).unwrap();
        let b = a.unary(UnaryOp::Exp).unwrap();
        assert_eq!(runtime.live_buffers(), 2);

        // `a` is still read by the queued exp launch.
        drop(a);
        assert_eq!(runtime.live_buffers(), 2);
        assert_eq!(b.read(Backend::Accelerator).unwrap(), vec![1.0f32.exp(); 4]);
        assert_eq!(runtime.live_buffers(), 1);
    }

    #[test]
    fn test_runtime_rejects_bad_launches() {
        let runtime = ReferenceAccelerator::new();
        let small = runtime.alloc_zeros(2).unwrap();
        let out = runtime.alloc_zeros(4).unwrap();

        let overrun = Launch::Binary {
            op: BinaryOp::Add,
            lhs: Operand::dense(small),
            rhs: Operand::dense(small),
            out,
            len: 4,
        };
        assert!(matches!(runtime.launch(overrun), Err(AutogradError::Accelerator(_))));

        let broadcast = Launch::Binary {
            op: BinaryOp::Add,
            lhs: Operand::broadcast(small),
            rhs: Operand::broadcast(small),
            out,
            len: 4,
        };
        runtime.launch(broadcast).unwrap();

        let dangling = Launch::Fill {
            dst: DevicePtr(999),
            value: 1.0,
            len: 1,
        };
        assert!(runtime.launch(dangling).is_err());

        runtime.release(small);
        let after_release = Launch::Unary {
            op: UnaryOp::Neg,
            input: small,
            out,
            len: 1,
        };
        assert!(runtime.launch(after_release).is_err());
        runtime.synchronize().unwrap();
        assert_eq!(runtime.download(out, 4).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_capacity_counts_queued_releases() {
        let runtime = ReferenceAccelerator::with_capacity(4);
        let a = runtime.alloc_zeros(4).unwrap();
        assert!(runtime.alloc_zeros(1).is_err());

        runtime.release(a);
        // Allocation drains the stream, which frees `a`.
        let b = runtime.alloc_zeros(4).unwrap();
        assert_ne!(a, b);
        assert_eq!(runtime.live_buffers(), 1);
    }
}
