#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use tg_runtime::{ConfigError, EvidenceEntry, EvidenceKind, RuntimeContext};

pub use tg_core::{
    DType, DescriptorError, ExecutionMode, RawTensorDescriptor, Scalar, StorageOrder,
    TensorDescriptor,
};
pub use tg_dispatch::{
    BinaryKind, CompareKind, DispatchDecision, DispatchError, DispatchStatus, LogicalKind, OpKey,
    Operand, ReduceKind, TensorArg, UnaryKind, is_supported,
};
pub use tg_runtime::{DeviceBuffer, DeviceQueue, QueueConfig, QueueError, QueueEvent, QueueMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Config(ConfigError),
    Queue(QueueError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "session config: {error}"),
            Self::Queue(error) => write!(f, "session queue: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<QueueError> for SessionError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

/// One queue plus the runtime context that records what ran on it.
#[derive(Debug)]
pub struct TensorGridSession {
    queue: DeviceQueue,
    runtime: RuntimeContext,
}

impl TensorGridSession {
    pub fn new(mode: ExecutionMode) -> Result<Self, SessionError> {
        Self::with_config(mode, QueueConfig::default())
    }

    pub fn with_config(mode: ExecutionMode, config: QueueConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let mut runtime = RuntimeContext::new(mode);
        runtime.ledger_mut().record(
            EvidenceKind::Queue,
            format!(
                "queue={} mode={:?} tile={:?}",
                config.name, config.mode, config.tile
            ),
        );
        let queue = DeviceQueue::new(config)?;
        Ok(Self { queue, runtime })
    }

    pub fn from_json_config(mode: ExecutionMode, text: &str) -> Result<Self, SessionError> {
        Self::with_config(mode, QueueConfig::from_json(text)?)
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn queue(&self) -> &DeviceQueue {
        &self.queue
    }

    /// Decodes a boundary descriptor under the session's mode.
    pub fn descriptor_from_raw(
        &mut self,
        raw: &RawTensorDescriptor<'_>,
    ) -> Result<TensorDescriptor, DescriptorError> {
        match TensorDescriptor::from_raw(raw, self.mode()) {
            Ok(decode) => {
                if !decode.repaired.is_empty() {
                    self.runtime
                        .record_descriptor_repair(decode.descriptor.fingerprint64(), &decode.repaired);
                }
                Ok(decode.descriptor)
            }
            Err(error) => {
                self.runtime.record_failure("descriptor_from_raw", &error);
                Err(error)
            }
        }
    }

    pub fn unary(
        &mut self,
        op: UnaryKind,
        a: TensorArg<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::unary(&self.queue, op, a, out);
        self.record_dispatch(result)
    }

    pub fn binary(
        &mut self,
        op: BinaryKind,
        lhs: Operand<'_>,
        rhs: Operand<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::binary(&self.queue, op, lhs, rhs, out);
        self.record_dispatch(result)
    }

    pub fn compare(
        &mut self,
        op: CompareKind,
        lhs: TensorArg<'_>,
        rhs: Operand<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::compare(&self.queue, op, lhs, rhs, out);
        self.record_dispatch(result)
    }

    pub fn logical(
        &mut self,
        op: LogicalKind,
        lhs: TensorArg<'_>,
        rhs: TensorArg<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::logical(&self.queue, op, lhs, rhs, out);
        self.record_dispatch(result)
    }

    pub fn elements_almost_equal(
        &mut self,
        a: TensorArg<'_>,
        b: TensorArg<'_>,
        tolerance: f64,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::elements_almost_equal(&self.queue, a, b, tolerance, out);
        self.record_dispatch(result)
    }

    pub fn replace(
        &mut self,
        x: TensorArg<'_>,
        y: Operand<'_>,
        condition: TensorArg<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::replace(&self.queue, x, y, condition, out);
        self.record_dispatch(result)
    }

    pub fn multiply_add(
        &mut self,
        a: TensorArg<'_>,
        b: TensorArg<'_>,
        c: Operand<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::multiply_add(&self.queue, a, b, c, out);
        self.record_dispatch(result)
    }

    pub fn copy(
        &mut self,
        src: TensorArg<'_>,
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::copy(&self.queue, src, out);
        self.record_dispatch(result)
    }

    pub fn fill(
        &mut self,
        out: TensorArg<'_>,
        value: Scalar,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill(&self.queue, out, value);
        self.record_dispatch(result)
    }

    pub fn fill_range(
        &mut self,
        out: TensorArg<'_>,
        first: Scalar,
        last: Scalar,
        step: Scalar,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill_range(&self.queue, out, first, last, step);
        self.record_dispatch(result)
    }

    pub fn eye(&mut self, out: TensorArg<'_>, offset: i64) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::eye(&self.queue, out, offset);
        self.record_dispatch(result)
    }

    pub fn fill_random_uniform(
        &mut self,
        out: TensorArg<'_>,
        lower: f64,
        upper: f64,
        seed: u64,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill_random_uniform(&self.queue, out, lower, upper, seed);
        self.record_dispatch(result)
    }

    pub fn fill_random_normal(
        &mut self,
        out: TensorArg<'_>,
        mean: f64,
        std: f64,
        seed: u64,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill_random_normal(&self.queue, out, mean, std, seed);
        self.record_dispatch(result)
    }

    pub fn fill_random_truncated_normal(
        &mut self,
        out: TensorArg<'_>,
        mean: f64,
        std: f64,
        seed: u64,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill_random_truncated_normal(&self.queue, out, mean, std, seed);
        self.record_dispatch(result)
    }

    /// Normal fill with `mean` and `std` taken from one-element tensors at
    /// launch time.
    pub fn fill_random_normal_from(
        &mut self,
        out: TensorArg<'_>,
        mean: TensorArg<'_>,
        std: TensorArg<'_>,
        seed: u64,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::fill_random_normal_from(&self.queue, out, mean, std, seed);
        self.record_dispatch(result)
    }

    pub fn fill_random_truncated_normal_from(
        &mut self,
        out: TensorArg<'_>,
        mean: TensorArg<'_>,
        std: TensorArg<'_>,
        seed: u64,
    ) -> Result<DispatchDecision, DispatchError> {
        let result =
            tg_dispatch::fill_random_truncated_normal_from(&self.queue, out, mean, std, seed);
        self.record_dispatch(result)
    }

    pub fn reduce(
        &mut self,
        op: ReduceKind,
        input: TensorArg<'_>,
        axes: &[usize],
        out: TensorArg<'_>,
    ) -> Result<DispatchDecision, DispatchError> {
        let result = tg_dispatch::reduce(&self.queue, op, input, axes, out);
        self.record_dispatch(result)
    }

    /// Waits for all submitted work and reports the first failure since
    /// the previous synchronization.
    pub fn synchronize(&mut self) -> Result<(), QueueError> {
        let result = self.queue.synchronize();
        match &result {
            Ok(()) => self.runtime.ledger_mut().record(
                EvidenceKind::Queue,
                format!("queue={} synchronized", self.queue.name()),
            ),
            Err(error) => self.runtime.record_failure("synchronize", error),
        }
        result
    }

    pub fn record_event(&mut self) -> Result<QueueEvent, QueueError> {
        self.queue.record_event()
    }

    pub fn wait_event(&mut self, event: &QueueEvent) -> Result<(), QueueError> {
        self.queue.wait_event(event)
    }

    pub fn delay(&mut self, duration: Duration) -> Result<(), QueueError> {
        self.queue.delay(duration)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    pub fn evidence_json_lines(&self) -> Result<String, serde_json::Error> {
        self.runtime.ledger().to_json_lines()
    }

    fn record_dispatch(
        &mut self,
        result: Result<DispatchDecision, DispatchError>,
    ) -> Result<DispatchDecision, DispatchError> {
        match &result {
            Ok(decision) => {
                let mode = self.mode();
                self.runtime.ledger_mut().record(
                    EvidenceKind::Dispatch,
                    format!("{decision} mode={mode:?}"),
                )
            }
            Err(error) => self.runtime.record_failure(&error.op().to_string(), error),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use tg_runtime::EvidenceKind;

    use super::{
        DType, DeviceBuffer, DispatchStatus, ExecutionMode, QueueConfig, QueueMode,
        RawTensorDescriptor, SessionError, TensorArg, TensorDescriptor, TensorGridSession,
        UnaryKind,
    };

    fn sync_session(mode: ExecutionMode) -> TensorGridSession {
        TensorGridSession::with_config(mode, QueueConfig::with_mode(QueueMode::Sync))
            .expect("session starts")
    }

    #[test]
    fn dispatches_and_rejections_are_both_recorded() {
        let mut session = sync_session(ExecutionMode::Strict);
        let desc = TensorDescriptor::dense(DType::F32, vec![2, 2]);
        let input = DeviceBuffer::from_vec(vec![-1.0f32, 2.0, -3.0, 4.0]);
        let out = DeviceBuffer::zeros(DType::F32, 4).expect("zeros");

        session
            .unary(
                UnaryKind::Abs,
                TensorArg::new(&desc, &input),
                TensorArg::new(&desc, &out),
            )
            .expect("abs dispatches");
        session.synchronize().expect("abs runs");

        let ints = TensorDescriptor::dense(DType::I32, vec![4]);
        let int_buffer = DeviceBuffer::zeros(DType::I32, 4).expect("zeros");
        let err = session
            .unary(
                UnaryKind::Exp,
                TensorArg::new(&ints, &int_buffer),
                TensorArg::new(&ints, &int_buffer),
            )
            .expect_err("exp is floating only");
        assert_eq!(err.status(), DispatchStatus::UnsupportedType);

        let ledger = session.evidence();
        let dispatch = ledger
            .iter()
            .find(|entry| entry.kind == EvidenceKind::Dispatch)
            .expect("dispatch entry");
        assert!(
            dispatch.summary.starts_with("op=abs dtype=f32 kernel=map_a<f32>"),
            "unexpected summary: {}",
            dispatch.summary
        );
        assert!(dispatch.summary.contains("flat=true"));
        assert!(ledger.iter().any(|entry| entry.kind == EvidenceKind::Queue
            && entry.summary.ends_with("synchronized")));
        let failure = ledger
            .iter()
            .find(|entry| entry.kind == EvidenceKind::Failure)
            .expect("failure entry");
        assert!(failure.summary.starts_with("op=exp rejected"));
        assert_eq!(out.to_vec::<f32>().expect("read"), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn hardened_decode_records_repairs_and_strict_rejects() {
        let desc = TensorDescriptor::dense(DType::F64, vec![2, 3]);
        let mut raw = RawTensorDescriptor::of(&desc);
        raw.count = 7;

        let mut strict = sync_session(ExecutionMode::Strict);
        strict
            .descriptor_from_raw(&raw)
            .expect_err("strict mode keeps the mismatch");
        assert_eq!(
            strict
                .evidence()
                .iter()
                .filter(|entry| entry.kind == EvidenceKind::Failure)
                .count(),
            1
        );

        let mut hardened = sync_session(ExecutionMode::Hardened);
        let repaired = hardened.descriptor_from_raw(&raw).expect("repaired");
        assert_eq!(repaired, desc);
        let policy = hardened
            .evidence()
            .iter()
            .filter(|entry| entry.kind == EvidenceKind::Policy)
            .last()
            .expect("repair entry");
        assert!(policy.summary.contains("fields=count"));
    }

    #[test]
    fn json_config_is_validated_before_the_queue_starts() {
        let session = TensorGridSession::from_json_config(
            ExecutionMode::Strict,
            r#"{"name": "compute", "mode": "sync", "tile": {"flat_block": 256}}"#,
        )
        .expect("valid config");
        assert_eq!(session.queue().name(), "compute");
        assert_eq!(session.queue().tile().flat_block, 256);

        let err = TensorGridSession::from_json_config(ExecutionMode::Strict, r#"{"name": ""}"#)
            .expect_err("empty name");
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn mode_switch_is_policy_evidence() {
        let mut session = sync_session(ExecutionMode::Strict);
        session.set_mode(ExecutionMode::Hardened);
        assert_eq!(session.mode(), ExecutionMode::Hardened);

        let text = session.evidence_json_lines().expect("ledger serializes");
        let last: serde_json::Value =
            serde_json::from_str(text.lines().last().expect("entries")).expect("json line");
        assert_eq!(last["kind"], "policy");
    }
}
