use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tg_index::TileConfig;

use crate::config::{QueueConfig, QueueMode};

type Task = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

struct Job {
    label: String,
    task: Task,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub label: String,
    pub message: String,
}

impl TaskError {
    #[must_use]
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {}", self.label, self.message)
    }
}

impl std::error::Error for TaskError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    TaskFailed(TaskError),
    Disconnected { queue: String },
    Spawn { queue: String, reason: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskFailed(error) => write!(f, "queued work failed: {error}"),
            Self::Disconnected { queue } => write!(f, "queue {queue} worker is gone"),
            Self::Spawn { queue, reason } => {
                write!(f, "queue {queue} worker could not start: {reason}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    first_error: Option<TaskError>,
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    settled: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn execute(&self, job: Job) {
        let Job { label, task } = job;
        let outcome = panic::catch_unwind(AssertUnwindSafe(task))
            .unwrap_or_else(|_| Err(TaskError::new(label.as_str(), "task panicked")));

        let mut progress = lock(&self.progress);
        progress.completed += 1;
        if let Err(error) = outcome {
            progress.first_error.get_or_insert(error);
        }
        drop(progress);
        self.settled.notify_all();
    }
}

/// An in-order stream of device work.
///
/// Work is started in submission order and runs to completion; failures
/// after submission are held until the next [`DeviceQueue::synchronize`].
pub struct DeviceQueue {
    name: String,
    mode: QueueMode,
    tile: TileConfig,
    shared: Arc<Shared>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("pending", &self.pending())
            .finish()
    }
}

impl DeviceQueue {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let QueueConfig { name, mode, tile } = config;
        let shared = Arc::new(Shared::default());
        let (sender, worker) = match mode {
            QueueMode::Sync => (None, None),
            QueueMode::Async => {
                let (sender, receiver) = mpsc::channel::<Job>();
                let worker_shared = Arc::clone(&shared);
                let worker = thread::Builder::new()
                    .name(format!("tg-queue-{name}"))
                    .spawn(move || {
                        for job in receiver {
                            worker_shared.execute(job);
                        }
                    })
                    .map_err(|err| QueueError::Spawn {
                        queue: name.clone(),
                        reason: err.to_string(),
                    })?;
                (Some(sender), Some(worker))
            }
        };
        Ok(Self {
            name,
            mode,
            tile,
            shared,
            sender,
            worker,
        })
    }

    pub fn with_mode(mode: QueueMode) -> Result<Self, QueueError> {
        Self::new(QueueConfig::with_mode(mode))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    #[must_use]
    pub fn tile(&self) -> &TileConfig {
        &self.tile
    }

    /// Tasks submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> u64 {
        let progress = lock(&self.shared.progress);
        progress.submitted - progress.completed
    }

    pub fn enqueue<F>(&self, label: impl Into<String>, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let job = Job {
            label: label.into(),
            task: Box::new(task),
        };
        lock(&self.shared.progress).submitted += 1;

        match &self.sender {
            None => {
                self.shared.execute(job);
                Ok(())
            }
            Some(sender) => sender.send(job).map_err(|_| {
                let mut progress = lock(&self.shared.progress);
                progress.submitted -= 1;
                QueueError::Disconnected {
                    queue: self.name.clone(),
                }
            }),
        }
    }

    /// Blocks until everything submitted so far has finished, then reports
    /// and clears the first failure among them.
    pub fn synchronize(&self) -> Result<(), QueueError> {
        let mut progress = lock(&self.shared.progress);
        let target = progress.submitted;
        while progress.completed < target {
            progress = self
                .shared
                .settled
                .wait(progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match progress.first_error.take() {
            Some(error) => Err(QueueError::TaskFailed(error)),
            None => Ok(()),
        }
    }

    /// Marker that completes once all earlier work on this queue is done.
    pub fn record_event(&self) -> Result<QueueEvent, QueueError> {
        let event = QueueEvent::new();
        let signal = event.clone();
        self.enqueue("record_event", move || {
            signal.complete();
            Ok(())
        })?;
        Ok(event)
    }

    /// Later work on this queue waits for `event`, which may belong to
    /// another queue. Events only come from [`DeviceQueue::record_event`],
    /// so the wait ends once the recording queue reaches that point; a
    /// sync queue blocks the caller until then.
    pub fn wait_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let event = event.clone();
        self.enqueue("wait_event", move || {
            event.wait();
            Ok(())
        })
    }

    pub fn delay(&self, duration: Duration) -> Result<(), QueueError> {
        self.enqueue("delay", move || {
            thread::sleep(duration);
            Ok(())
        })
    }

    /// Drains outstanding work, stops the worker and reports the first
    /// failure not yet seen by [`DeviceQueue::synchronize`].
    pub fn close(mut self) -> Result<(), QueueError> {
        self.stop_worker();
        let first_error = lock(&self.shared.progress).first_error.take();
        match first_error {
            Some(error) => Err(QueueError::TaskFailed(error)),
            None => Ok(()),
        }
    }

    fn stop_worker(&mut self) {
        self.sender.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.join().is_err() {
            lock(&self.shared.progress)
                .first_error
                .get_or_insert(TaskError::new(
                    format!("tg-queue-{}", self.name),
                    "queue worker panicked",
                ));
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[derive(Debug, Default)]
struct EventState {
    done: Mutex<bool>,
    signal: Condvar,
}

/// Completion marker handed out by [`DeviceQueue::record_event`].
#[derive(Debug, Clone)]
pub struct QueueEvent {
    state: Arc<EventState>,
}

impl QueueEvent {
    fn new() -> Self {
        Self {
            state: Arc::new(EventState::default()),
        }
    }

    fn complete(&self) {
        *lock(&self.state.done) = true;
        self.state.signal.notify_all();
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *lock(&self.state.done)
    }

    pub fn wait(&self) {
        let mut done = lock(&self.state.done);
        while !*done {
            done = self
                .state
                .signal
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns whether the event completed within `timeout`.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let done = lock(&self.state.done);
        let (done, _) = self
            .state
            .signal
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{DeviceQueue, QueueError, TaskError};
    use crate::config::QueueMode;

    #[test]
    fn async_queue_runs_tasks_in_submission_order() {
        let queue = DeviceQueue::with_mode(QueueMode::Async).expect("worker starts");
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.delay(Duration::from_millis(5)).expect("delay");
        for step in 0..16 {
            let order = Arc::clone(&order);
            queue
                .enqueue(format!("step-{step}"), move || {
                    order.lock().expect("order lock").push(step);
                    Ok(())
                })
                .expect("enqueue");
        }
        queue.synchronize().expect("no failures");
        assert_eq!(queue.pending(), 0);
        assert_eq!(*order.lock().expect("order lock"), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_is_sticky_until_synchronize() {
        let queue = DeviceQueue::with_mode(QueueMode::Async).expect("worker starts");
        queue
            .enqueue("first", || Err(TaskError::new("first", "bad launch")))
            .expect("enqueue");
        queue
            .enqueue("second", || Err(TaskError::new("second", "also bad")))
            .expect("enqueue");

        let err = queue.synchronize().expect_err("failure is reported");
        assert_eq!(
            err,
            QueueError::TaskFailed(TaskError::new("first", "bad launch"))
        );
        queue.synchronize().expect("error was cleared");
    }

    #[test]
    fn sync_queue_runs_inline_and_captures_panics() {
        let queue = DeviceQueue::with_mode(QueueMode::Sync).expect("sync queue");
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        queue
            .enqueue("count", move || {
                *counter.lock().expect("counter lock") += 1;
                Ok(())
            })
            .expect("enqueue");
        assert_eq!(*hits.lock().expect("counter lock"), 1);

        queue
            .enqueue("explode", || panic!("kernel bug"))
            .expect("enqueue");
        let err = queue.synchronize().expect_err("panic becomes a failure");
        assert!(matches!(err, QueueError::TaskFailed(TaskError { ref label, .. }) if label == "explode"));
    }

    #[test]
    fn events_order_work_across_queues() {
        let producer = DeviceQueue::with_mode(QueueMode::Async).expect("producer");
        let consumer = DeviceQueue::with_mode(QueueMode::Async).expect("consumer");
        let log = Arc::new(Mutex::new(Vec::new()));

        producer.delay(Duration::from_millis(20)).expect("delay");
        let produced = Arc::clone(&log);
        producer
            .enqueue("produce", move || {
                produced.lock().expect("log lock").push("produce");
                Ok(())
            })
            .expect("enqueue");
        let ready = producer.record_event().expect("event");

        consumer.wait_event(&ready).expect("wait");
        let consumed = Arc::clone(&log);
        consumer
            .enqueue("consume", move || {
                consumed.lock().expect("log lock").push("consume");
                Ok(())
            })
            .expect("enqueue");

        consumer.synchronize().expect("consumer done");
        assert!(ready.is_complete());
        assert!(ready.wait_timeout(Duration::from_millis(1)));
        assert_eq!(*log.lock().expect("log lock"), vec!["produce", "consume"]);
    }

    #[test]
    fn sync_queue_waits_on_an_event_from_a_busy_queue() {
        let producer = DeviceQueue::with_mode(QueueMode::Async).expect("producer");
        let consumer = DeviceQueue::with_mode(QueueMode::Sync).expect("consumer");
        producer.delay(Duration::from_millis(20)).expect("delay");
        let ready = producer.record_event().expect("event");
        assert!(!ready.is_complete());

        consumer.wait_event(&ready).expect("wait");
        assert!(ready.is_complete());

        let own = consumer.record_event().expect("sync event");
        assert!(own.is_complete());
        consumer.wait_event(&own).expect("already complete");
        assert_eq!(consumer.pending(), 0);
    }

    #[test]
    fn close_drains_and_reports_unseen_failures() {
        let queue = DeviceQueue::with_mode(QueueMode::Async).expect("worker starts");
        let done = Arc::new(Mutex::new(false));
        queue.delay(Duration::from_millis(5)).expect("delay");
        queue
            .enqueue("broken", || Err(TaskError::new("broken", "bad launch")))
            .expect("enqueue");
        let flag = Arc::clone(&done);
        queue
            .enqueue("last", move || {
                *flag.lock().expect("flag lock") = true;
                Ok(())
            })
            .expect("enqueue");

        let err = queue.close().expect_err("failure survives shutdown");
        assert_eq!(
            err,
            QueueError::TaskFailed(TaskError::new("broken", "bad launch"))
        );
        assert!(*done.lock().expect("flag lock"));

        let clean = DeviceQueue::with_mode(QueueMode::Sync).expect("sync queue");
        clean.close().expect("nothing failed");
    }

    #[test]
    fn dropping_a_queue_drains_submitted_work() {
        let done = Arc::new(Mutex::new(false));
        {
            let queue = DeviceQueue::with_mode(QueueMode::Async).expect("worker starts");
            queue.delay(Duration::from_millis(5)).expect("delay");
            let flag = Arc::clone(&done);
            queue
                .enqueue("last", move || {
                    *flag.lock().expect("flag lock") = true;
                    Ok(())
                })
                .expect("enqueue");
        }
        assert!(*done.lock().expect("flag lock"));
    }
}
