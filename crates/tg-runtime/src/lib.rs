#![forbid(unsafe_code)]

mod buffer;
mod config;
mod queue;

use std::fmt;

use serde::Serialize;
use tg_core::ExecutionMode;

pub use buffer::{BufferError, DeviceBuffer};
pub use config::{ConfigError, QueueConfig, QueueMode};
pub use queue::{DeviceQueue, QueueError, QueueEvent, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Dispatch,
    Queue,
    Policy,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> + '_ {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON object per line, oldest first.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_descriptor_repair(&mut self, fingerprint: u64, repaired: &[&str]) {
        self.ledger.record(
            EvidenceKind::Policy,
            format!(
                "descriptor repaired mode={:?} fingerprint=0x{fingerprint:016x} fields={}",
                self.mode,
                repaired.join(",")
            ),
        );
    }

    pub fn record_failure<E>(&mut self, op: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger
            .record(EvidenceKind::Failure, format!("op={op} rejected: {error}"));
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use tg_core::ExecutionMode;

    use super::{EvidenceKind, RuntimeContext};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Dispatch, "dispatch decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Dispatch);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 2);
    }

    #[test]
    fn repairs_and_failures_are_distinguishable() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
        ctx.record_descriptor_repair(0xabc, &["count", "span_count"]);
        ctx.record_failure("sqrt", "unsupported element type bool");

        let repair = ctx
            .ledger()
            .entries_of(EvidenceKind::Policy)
            .last()
            .expect("repair entry");
        assert!(
            repair.summary.contains("fields=count,span_count"),
            "unexpected repair summary: {}",
            repair.summary
        );
        let failure = ctx
            .ledger()
            .entries_of(EvidenceKind::Failure)
            .next()
            .expect("failure entry");
        assert!(failure.summary.starts_with("op=sqrt rejected"));
    }

    #[test]
    fn ledger_exports_json_lines() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut().record(EvidenceKind::Queue, "synchronized");

        let text = ctx.ledger().to_json_lines().expect("entries serialize");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let last: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        assert_eq!(last["kind"], "queue");
        assert_eq!(last["summary"], "synchronized");
        assert!(last["ts_unix_ms"].is_u64());
    }
}
