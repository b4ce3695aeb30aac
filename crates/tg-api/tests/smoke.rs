use tg_api::{
    BinaryKind, CompareKind, DType, DeviceBuffer, DispatchStatus, ExecutionMode, LogicalKind,
    Operand, QueueConfig, QueueMode, RawTensorDescriptor, ReduceKind, Scalar, TensorArg,
    TensorDescriptor, TensorGridSession, UnaryKind,
};

fn session(mode: QueueMode) -> TensorGridSession {
    TensorGridSession::with_config(ExecutionMode::Strict, QueueConfig::with_mode(mode))
        .expect("session starts")
}

#[test]
fn async_pipeline_generates_transforms_and_reduces() {
    let mut session = session(QueueMode::Async);
    let grid = TensorDescriptor::dense(DType::F32, vec![4, 8]);
    let noise = DeviceBuffer::zeros(DType::F32, 32).expect("zeros");
    let squared = DeviceBuffer::zeros(DType::F32, 32).expect("zeros");

    session
        .fill_random_uniform(TensorArg::new(&grid, &noise), -1.0, 1.0, 7)
        .expect("uniform fill");
    session
        .unary(
            UnaryKind::Squared,
            TensorArg::new(&grid, &noise),
            TensorArg::new(&grid, &squared),
        )
        .expect("square");

    let column_desc = TensorDescriptor::dense(DType::F32, vec![4, 1]);
    let row_sums = DeviceBuffer::zeros(DType::F32, 4).expect("zeros");
    let decision = session
        .reduce(
            ReduceKind::Sum,
            TensorArg::new(&grid, &squared),
            &[1],
            TensorArg::new(&column_desc, &row_sums),
        )
        .expect("row sums");
    assert!(!decision.flat);
    session.synchronize().expect("pipeline completes");

    let noise = noise.to_vec::<f32>().expect("read noise");
    assert!(noise.iter().all(|value| (-1.0..=1.0).contains(value)));
    let sums = row_sums.to_vec::<f32>().expect("read sums");
    for (row, sum) in sums.iter().enumerate() {
        let expected: f32 = noise[row * 8..(row + 1) * 8].iter().map(|v| v * v).sum();
        assert!((sum - expected).abs() < 1e-4, "row {row}: {sum} vs {expected}");
    }
}

#[test]
fn rejected_calls_leave_outputs_alone_and_enqueue_nothing() {
    let mut session = session(QueueMode::Sync);
    let flags = TensorDescriptor::dense(DType::Bool, vec![3]);
    let input = DeviceBuffer::from_vec(vec![true, false, true]);
    let out = DeviceBuffer::from_vec(vec![false; 3]);

    let err = session
        .unary(
            UnaryKind::Tanh,
            TensorArg::new(&flags, &input),
            TensorArg::new(&flags, &out),
        )
        .expect_err("tanh over bool");
    assert_eq!(err.status(), DispatchStatus::UnsupportedType);

    let deep = TensorDescriptor::dense(DType::Bool, vec![1, 1, 1, 3]);
    let err = session
        .logical(
            LogicalKind::And,
            TensorArg::new(&deep, &input),
            TensorArg::new(&deep, &input),
            TensorArg::new(&deep, &out),
        )
        .expect_err("rank 4");
    assert_eq!(err.status(), DispatchStatus::UnsupportedRank);

    assert_eq!(session.queue().pending(), 0);
    assert_eq!(out.to_vec::<bool>().expect("read"), vec![false; 3]);
    session.synchronize().expect("nothing failed on the queue");
}

#[test]
fn wire_descriptors_drive_broadcast_dispatch() {
    let mut session = session(QueueMode::Sync);
    let matrix = TensorDescriptor::dense(DType::I32, vec![2, 3]);
    let row = TensorDescriptor::from_shape_and_strides(DType::I32, vec![2, 3], vec![0, 1], 0)
        .expect("broadcast row view");

    let decoded = session
        .descriptor_from_raw(&RawTensorDescriptor::of(&row))
        .expect("consistent wire descriptor");
    assert_eq!(decoded, row);

    let lhs = DeviceBuffer::from_vec(vec![1i32, 2, 3, 4, 5, 6]);
    let rhs = DeviceBuffer::from_vec(vec![10i32, 20, 30]);
    let sum = DeviceBuffer::zeros(DType::I32, 6).expect("zeros");
    session
        .binary(
            BinaryKind::Add,
            TensorArg::new(&matrix, &lhs).into(),
            TensorArg::new(&decoded, &rhs).into(),
            TensorArg::new(&matrix, &sum),
        )
        .expect("broadcast add");

    let mask_desc = TensorDescriptor::dense(DType::Bool, vec![2, 3]);
    let mask = DeviceBuffer::zeros(DType::Bool, 6).expect("zeros");
    session
        .compare(
            CompareKind::GreaterOrEqual,
            TensorArg::new(&matrix, &sum),
            Operand::Element(Scalar::Int(25)),
            TensorArg::new(&mask_desc, &mask),
        )
        .expect("threshold");
    session.synchronize().expect("work completes");

    assert_eq!(
        sum.to_vec::<i32>().expect("read"),
        vec![11, 22, 33, 14, 25, 36]
    );
    assert_eq!(
        mask.to_vec::<bool>().expect("read"),
        vec![false, false, true, false, true, true]
    );
}

#[test]
fn events_order_two_sessions() {
    let mut producer = session(QueueMode::Async);
    let mut consumer = session(QueueMode::Async);
    let desc = TensorDescriptor::dense(DType::F64, vec![16]);
    let staged = DeviceBuffer::zeros(DType::F64, 16).expect("zeros");
    let copied = DeviceBuffer::zeros(DType::F64, 16).expect("zeros");

    producer
        .delay(std::time::Duration::from_millis(10))
        .expect("delay");
    producer
        .fill_range(
            TensorArg::new(&desc, &staged),
            Scalar::Float(0.0),
            Scalar::Float(100.0),
            Scalar::Float(0.5),
        )
        .expect("range");
    let ready = producer.record_event().expect("event");

    consumer.wait_event(&ready).expect("wait");
    consumer
        .copy(TensorArg::new(&desc, &staged), TensorArg::new(&desc, &copied))
        .expect("copy");
    consumer.synchronize().expect("consumer done");

    let expected = (0..16).map(|i| f64::from(i) * 0.5).collect::<Vec<_>>();
    assert_eq!(copied.to_vec::<f64>().expect("read"), expected);
}

#[test]
fn reduced_statistics_feed_a_normal_fill_without_a_host_round_trip() {
    let mut session = session(QueueMode::Async);
    let samples_desc = TensorDescriptor::dense(DType::F32, vec![4]);
    let samples = DeviceBuffer::from_vec(vec![4.0f32, 6.0, 5.0, 5.0]);
    let one = TensorDescriptor::dense(DType::F32, vec![1]);
    let mean = DeviceBuffer::zeros(DType::F32, 1).expect("zeros");
    let spread = DeviceBuffer::from_vec(vec![0.125f32]);

    session
        .reduce(
            ReduceKind::Mean,
            TensorArg::new(&samples_desc, &samples),
            &[],
            TensorArg::new(&one, &mean),
        )
        .expect("mean");
    let grid = TensorDescriptor::dense(DType::F32, vec![3, 3]);
    let drawn = DeviceBuffer::zeros(DType::F32, 9).expect("zeros");
    session
        .fill_random_truncated_normal_from(
            TensorArg::new(&grid, &drawn),
            TensorArg::new(&one, &mean),
            TensorArg::new(&one, &spread),
            21,
        )
        .expect("truncated fill");
    session.synchronize().expect("pipeline completes");

    let drawn = drawn.to_vec::<f32>().expect("read");
    assert!(drawn.iter().all(|value| (4.75..=5.25).contains(value)));
    assert!(session.evidence_len() >= 3);
}
