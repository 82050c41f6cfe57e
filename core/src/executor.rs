//! Task execution.
//!
//! The driver hands task descriptors to a [`TaskExecutor`] and gets back a
//! [`TaskSet`], a handle over the pending results it can wait on partially
//! or fully. Invocation, retries and the concurrency limit belong to the
//! executor; the driver never re-runs a task itself.
//!
//! [`LocalExecutor`] runs tasks as tokio tasks in this process. Submitted
//! tasks queue in FIFO order behind one dispatcher, so a task only starts
//! once every task submitted before it has started.

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use terasort_common::{Diagnose, Storage};

use crate::error::{SortError, SortResult};
use crate::types::{TaskId, unix_seconds};

/// What a task sees of the worker running it.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub runtime_memory_mb: u32,
}

/// A unit of work the executor can run, retry and ship elsewhere.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Output: Send + 'static;

    fn task_id(&self) -> TaskId;

    async fn run(&self, ctx: &WorkerContext) -> SortResult<Self::Output>;
}

/// Dispatches tasks and exposes their results as a [`TaskSet`].
pub trait TaskExecutor: Send + Sync {
    fn submit<T: Task>(&self, tasks: Vec<T>) -> TaskSet<T::Output>;
}

/// Per-invocation statistics, the inputs of the billing model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationStats {
    pub task_id: TaskId,
    pub attempts: u32,
    /// Billed seconds summed over every attempt.
    pub worker_exec_time: f64,
    /// Unix timestamps in seconds.
    pub worker_start_tstamp: f64,
    pub worker_end_tstamp: f64,
    /// Completion checks the driver made while waiting on this task.
    pub status_query_count: u64,
    /// Result fetches the driver made for this task.
    pub result_query_count: u64,
    pub runtime_memory_mb: u32,
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Tasks allowed to run at once.
    pub max_concurrency: usize,
    /// Extra attempts granted to a task failing with a retryable error.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Memory billed per worker.
    pub runtime_memory_mb: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(2),
            max_retries: 2,
            retry_backoff_ms: 200,
            runtime_memory_mb: 1769,
        }
    }
}

type TaskOutcome<O> = SortResult<(O, InvocationStats)>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_with_retries<T: Task>(
    task: T,
    ctx: WorkerContext,
    config: ExecutorConfig,
) -> TaskOutcome<T::Output> {
    let task_id = task.task_id();
    let start = unix_seconds();
    let mut billed = Duration::ZERO;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let attempt_ctx = WorkerContext {
            attempt,
            ..ctx.clone()
        };
        let clock = Instant::now();
        let result = task.run(&attempt_ctx).await;
        billed += clock.elapsed();

        match result {
            Ok(output) => {
                debug!(task = %task_id, attempt, "Task finished");
                let stats = InvocationStats {
                    task_id,
                    attempts: attempt,
                    worker_exec_time: billed.as_secs_f64(),
                    worker_start_tstamp: start,
                    worker_end_tstamp: unix_seconds(),
                    status_query_count: 0,
                    result_query_count: 0,
                    runtime_memory_mb: ctx.runtime_memory_mb,
                };
                return Ok((output, stats));
            }
            Err(error) if error.is_retryable() && attempt <= config.max_retries => {
                warn!(
                    task = %task_id,
                    attempt,
                    max_retries = config.max_retries,
                    error = %error,
                    "Retrying task after retryable failure"
                );
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
            }
            Err(error) => {
                if let Some(store) = error.store_source() {
                    warn!(
                        task = %task_id,
                        attempt,
                        severity = ?store.severity(),
                        category = ?store.category(),
                        "Task gave up on a store error"
                    );
                }
                return Err(SortError::TaskFailed {
                    task_id,
                    source: Box::new(error),
                });
            }
        }
    }
}

struct QueuedTask {
    task_id: TaskId,
    abort: AbortHandle,
    work: BoxFuture<'static, ()>,
}

/// Runs tasks as tokio tasks with a concurrency limit and retries.
///
/// Must be created inside a tokio runtime.
pub struct LocalExecutor {
    storage: Arc<dyn Storage>,
    config: ExecutorConfig,
    queue: mpsc::UnboundedSender<QueuedTask>,
}

impl LocalExecutor {
    pub fn new(storage: Arc<dyn Storage>, config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let (queue, mut receiver) = mpsc::unbounded_channel::<QueuedTask>();

        tokio::spawn(async move {
            while let Some(queued) = receiver.recv().await {
                if queued.abort.is_aborted() {
                    debug!(task = %queued.task_id, "Skipping aborted task");
                    continue;
                }
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    queued.work.await;
                });
            }
        });

        Self {
            storage,
            config,
            queue,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

impl TaskExecutor for LocalExecutor {
    fn submit<T: Task>(&self, tasks: Vec<T>) -> TaskSet<T::Output> {
        let mut slots = Vec::with_capacity(tasks.len());
        let pending = FuturesUnordered::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let task_id = task.task_id();
            let (sender, receiver) = oneshot::channel();
            let (abort, registration) = AbortHandle::new_pair();
            let ctx = WorkerContext {
                storage: self.storage.clone(),
                attempt: 0,
                runtime_memory_mb: self.config.runtime_memory_mb,
            };
            let config = self.config.clone();
            let panic_id = task_id.clone();

            let work = Abortable::new(
                async move {
                    let outcome = AssertUnwindSafe(run_with_retries(task, ctx, config))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(SortError::TaskPanicked {
                                task_id: panic_id,
                                message: panic_message(payload.as_ref()),
                            })
                        });
                    let _ = sender.send(outcome);
                },
                registration,
            )
            .map(|_| ())
            .boxed();

            let queued = QueuedTask {
                task_id: task_id.clone(),
                abort: abort.clone(),
                work,
            };
            if self.queue.send(queued).is_err() {
                warn!(task = %task_id, "Executor dispatcher is gone");
            }

            pending.push(async move { (index, receiver.await) }.boxed());
            slots.push(TaskSlot {
                task_id,
                abort,
                state: SlotState::Pending,
                status_queries: 0,
            });
        }

        TaskSet { slots, pending }
    }
}

enum SlotState<O> {
    Pending,
    Succeeded(O, InvocationStats),
    Failed(String),
}

struct TaskSlot<O> {
    task_id: TaskId,
    abort: AbortHandle,
    state: SlotState<O>,
    status_queries: u64,
}

type Delivery<O> = (usize, Result<TaskOutcome<O>, oneshot::error::RecvError>);

/// Pending results of one `submit` call.
///
/// A failure is fatal to the set: the wait that observes it returns the
/// task's error, later waits report the task as aborted.
pub struct TaskSet<O> {
    slots: Vec<TaskSlot<O>>,
    pending: FuturesUnordered<BoxFuture<'static, Delivery<O>>>,
}

impl<O: Send + 'static> TaskSet<O> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of tasks that have finished successfully.
    pub fn completed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Succeeded(..)))
            .count()
    }

    fn reported_failure(&self) -> SortResult<()> {
        match self.slots.iter().find_map(|slot| match &slot.state {
            SlotState::Failed(message) => Some((slot.task_id.clone(), message.clone())),
            _ => None,
        }) {
            Some((task_id, message)) => Err(SortError::TaskAborted {
                task_id,
                reason: format!("failure already reported: {}", message),
            }),
            None => Ok(()),
        }
    }

    fn record(
        &mut self,
        index: usize,
        received: Result<TaskOutcome<O>, oneshot::error::RecvError>,
    ) -> SortResult<()> {
        let slot = &mut self.slots[index];
        match received {
            Ok(Ok((output, stats))) => {
                slot.state = SlotState::Succeeded(output, stats);
                Ok(())
            }
            Ok(Err(error)) => {
                slot.state = SlotState::Failed(error.to_string());
                Err(error)
            }
            Err(_) => {
                let reason = "task was dropped before completing".to_string();
                slot.state = SlotState::Failed(reason.clone());
                Err(SortError::TaskAborted {
                    task_id: slot.task_id.clone(),
                    reason,
                })
            }
        }
    }

    /// Wait until at least `threshold` tasks have succeeded, returning how
    /// many have. Fails as soon as any task fails.
    pub async fn wait_for(&mut self, threshold: usize) -> SortResult<usize> {
        self.reported_failure()?;
        let target = threshold.min(self.slots.len());

        while self.completed() < target {
            let Some((index, received)) = self.pending.next().await else {
                break;
            };
            for slot in &mut self.slots {
                if matches!(slot.state, SlotState::Pending) {
                    slot.status_queries += 1;
                }
            }
            self.record(index, received)?;
        }
        Ok(self.completed())
    }

    /// Wait until every task has succeeded.
    pub async fn wait_all(&mut self) -> SortResult<()> {
        let total = self.slots.len();
        self.wait_for(total).await?;
        Ok(())
    }

    /// Cancel every task that has not finished. Queued tasks never start.
    pub fn abort(&self) {
        for slot in &self.slots {
            if matches!(slot.state, SlotState::Pending) {
                slot.abort.abort();
            }
        }
    }

    /// Outputs and statistics in submission order.
    pub fn into_results(self) -> SortResult<Vec<(O, InvocationStats)>> {
        self.slots
            .into_iter()
            .map(|slot| match slot.state {
                SlotState::Succeeded(output, mut stats) => {
                    stats.status_query_count = slot.status_queries;
                    stats.result_query_count = 1;
                    Ok((output, stats))
                }
                SlotState::Pending => Err(SortError::TaskAborted {
                    task_id: slot.task_id,
                    reason: "result requested before completion".to_string(),
                }),
                SlotState::Failed(message) => Err(SortError::TaskAborted {
                    task_id: slot.task_id,
                    reason: format!("failure already reported: {}", message),
                }),
            })
            .collect()
    }
}
