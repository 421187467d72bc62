use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use error_stack::{Report, Result, ResultExt};
use evm_sync_observability::KeyValue;
use futures::{future::try_join_all, stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    interval::{interval_sum, split_interval, IntervalCache},
    provider::{BlockTag, DispatchErrorExt, Dispatcher},
    source::SharedSource,
    store::CacheStore,
};

use super::{
    block_fetch::{BlockFetchCoordinator, BlockTicket},
    error::IngestionError,
    events::{EventEmitter, SyncEvent},
    logs::{fetch_factory_events, fetch_source_logs, group_logs_by_block},
    metrics::IngestionMetrics,
};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Number of log tasks running at the same time.
    pub max_concurrent_tasks: usize,
    /// Attempts before a task is moved to the dead letters.
    pub max_task_attempts: u32,
    /// Block range of a task for sources without `max_block_range`.
    pub default_max_block_range: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Fetching,
    AwaitingBlocks,
    Requeued,
    Complete,
}

/// What a backfill task fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// The source's logs. For factory sources, the logs of the children.
    Logs,
    /// The events announcing a factory's children.
    FactoryEvents,
}

/// Fetch the logs of one source over one block range.
#[derive(Debug, Clone)]
pub struct BackfillTask {
    pub source: SharedSource,
    pub kind: TaskKind,
    pub from_block: u64,
    pub to_block: u64,
    /// Number of failed attempts so far.
    pub attempt: u32,
    pub state: TaskState,
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub completed_tasks: usize,
    pub failed_attempts: usize,
    pub logs: usize,
    pub dropped_pending_logs: usize,
    /// Tasks given up on after `max_task_attempts`.
    pub dead_letters: Vec<BackfillTask>,
}

#[derive(Debug)]
struct TaskOutcome {
    logs: usize,
    dropped_pending: usize,
}

/// Factory event ranges not stored yet, by source name.
///
/// The children logs of `[from, to]` are fetched only after the factory
/// events of `[start_block, to]` are stored, otherwise the children
/// announced in that range would be missed.
#[derive(Debug, Default)]
struct PendingFactoryEvents(HashMap<String, Vec<(u64, u64)>>);

/// Syncs the historical logs of a set of sources on one network.
pub struct LogBackfillPipeline {
    network: Arc<str>,
    dispatcher: Dispatcher,
    store: Arc<dyn CacheStore>,
    intervals: IntervalCache,
    coordinator: BlockFetchCoordinator,
    events: EventEmitter,
    metrics: IngestionMetrics,
    options: BackfillOptions,
}

impl LogBackfillPipeline {
    pub fn new(
        network: impl Into<String>,
        dispatcher: Dispatcher,
        store: Arc<dyn CacheStore>,
        coordinator: BlockFetchCoordinator,
        events: EventEmitter,
    ) -> Self {
        Self {
            network: network.into().into(),
            dispatcher,
            intervals: IntervalCache::new(store.clone()),
            store,
            coordinator,
            events,
            metrics: IngestionMetrics::default(),
            options: BackfillOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BackfillOptions) -> Self {
        self.options = options;
        self
    }

    /// Tasks covering the blocks of `source` not synced yet, up to `target_block`.
    pub async fn plan(
        &self,
        source: &SharedSource,
        target_block: u64,
    ) -> Result<Vec<BackfillTask>, IngestionError> {
        let Some(range) = source.clamp(source.start_block, target_block) else {
            debug!(source = %source.name, target_block, "nothing to backfill");
            return Ok(Vec::new());
        };

        let keys = source.interval_keys();
        let gaps = self
            .intervals
            .gaps(&keys, range)
            .await
            .change_context(IngestionError::Store)
            .attach_printable("failed to read cached intervals")?;

        let total_blocks = range.1 - range.0 + 1;
        let cached_blocks = total_blocks - interval_sum(&gaps);

        info!(
            network = %self.network,
            source = %source.name,
            from_block = range.0,
            to_block = range.1,
            total_blocks,
            cached_blocks,
            "starting backfill"
        );

        self.events.emit(SyncEvent::BackfillStarted {
            source: source.name.clone(),
            total_blocks,
            cached_blocks,
        });

        let max_block_range = source
            .max_block_range
            .unwrap_or(self.options.default_max_block_range);

        let mut tasks = Vec::new();

        if let Some(factory_key) = source.factory_interval_key() {
            let factory_gaps = self
                .intervals
                .gaps(&[factory_key], range)
                .await
                .change_context(IngestionError::Store)
                .attach_printable("failed to read factory cached intervals")?;

            tasks.extend(
                factory_gaps
                    .into_iter()
                    .flat_map(|gap| split_interval(gap, max_block_range))
                    .map(|(from_block, to_block)| {
                        BackfillTask::factory_events(source.clone(), from_block, to_block)
                    }),
            );
        }

        tasks.extend(
            gaps.into_iter()
                .flat_map(|gap| split_interval(gap, max_block_range))
                .map(|(from_block, to_block)| {
                    BackfillTask::new(source.clone(), from_block, to_block)
                }),
        );

        Ok(tasks)
    }

    /// Backfill all sources up to `target_block`.
    ///
    /// Failed tasks are retried first. Returns once every task completed or
    /// was given up on, or the token is cancelled.
    pub async fn run(
        &self,
        sources: &[SharedSource],
        target_block: u64,
        ct: &CancellationToken,
    ) -> Result<BackfillReport, IngestionError> {
        let mut queue = VecDeque::new();
        for source in sources {
            queue.extend(self.plan(source, target_block).await?);
        }

        info!(network = %self.network, tasks = queue.len(), "backfill planned");

        let mut factory_events = PendingFactoryEvents::default();
        for task in queue.iter().filter(|task| task.kind == TaskKind::FactoryEvents) {
            factory_events.insert(task);
        }

        let mut report = BackfillReport::default();
        let mut in_flight = FuturesUnordered::new();
        let mut blocked = Vec::new();

        loop {
            while in_flight.len() < self.options.max_concurrent_tasks && !ct.is_cancelled() {
                let Some(task) = queue.pop_front() else {
                    break;
                };

                if !factory_events.is_ready(&task) {
                    blocked.push(task);
                    continue;
                }

                in_flight.push(self.execute(task));
            }

            let Some((task, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(outcome) => {
                    report.completed_tasks += 1;
                    report.logs += outcome.logs;
                    report.dropped_pending_logs += outcome.dropped_pending;

                    if task.kind == TaskKind::FactoryEvents {
                        factory_events.remove(&task);
                        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut blocked)
                            .into_iter()
                            .partition(|task| factory_events.is_ready(task));
                        blocked = waiting;
                        queue.extend(ready);
                    }
                }
                Err(err) => self.handle_failure(
                    task,
                    err,
                    &mut queue,
                    &mut factory_events,
                    &mut report,
                    ct,
                ),
            }
        }

        if ct.is_cancelled() {
            if !queue.is_empty() || !blocked.is_empty() {
                info!(
                    network = %self.network,
                    remaining = queue.len() + blocked.len(),
                    "backfill interrupted"
                );
            }
        } else {
            // Their factory events were given up on.
            for task in blocked {
                error!(
                    source = %task.source.name,
                    from_block = task.from_block,
                    to_block = task.to_block,
                    "factory events missing, giving up on children logs"
                );
                self.events.emit(SyncEvent::LogTaskFailed {
                    source: task.source.name.clone(),
                    error: "factory events missing".to_string(),
                    dead_letter: true,
                });
                report.dead_letters.push(task);
            }
        }

        info!(
            network = %self.network,
            completed = report.completed_tasks,
            logs = report.logs,
            dead_letters = report.dead_letters.len(),
            "backfill finished"
        );

        Ok(report)
    }

    async fn execute(
        &self,
        mut task: BackfillTask,
    ) -> (BackfillTask, Result<TaskOutcome, IngestionError>) {
        let result = self.run_task(&mut task).await;
        (task, result)
    }

    #[instrument(
        skip_all,
        fields(
            source = %task.source.name,
            kind = ?task.kind,
            from_block = task.from_block,
            to_block = task.to_block
        )
    )]
    async fn run_task(&self, task: &mut BackfillTask) -> Result<TaskOutcome, IngestionError> {
        task.state = TaskState::Fetching;
        let source = task.source.clone();
        let (from_block, to_block) = (task.from_block, task.to_block);

        let end_block = async {
            self.dispatcher
                .get_block_by_number(BlockTag::Number(to_block), false)
                .await
                .change_context(IngestionError::RpcRequest)
                .attach_printable("failed to get task end block")
        };

        let logs = async {
            match task.kind {
                TaskKind::Logs => {
                    fetch_source_logs(
                        &self.dispatcher,
                        self.store.as_ref(),
                        &source,
                        from_block,
                        to_block,
                    )
                    .await
                }
                TaskKind::FactoryEvents => {
                    fetch_factory_events(
                        &self.dispatcher,
                        self.store.as_ref(),
                        &source,
                        from_block,
                        to_block,
                    )
                    .await
                }
            }
        };

        let (batch, end_block) = tokio::try_join!(logs, end_block)?;

        let tickets = group_logs_by_block(&batch.logs)
            .into_iter()
            .map(|(block_hash, transactions)| self.coordinator.require(block_hash, transactions))
            .collect::<Vec<_>>();

        if !tickets.is_empty() {
            self.events.emit(SyncEvent::BlockTasksAdded {
                source: source.name.clone(),
                count: tickets.len(),
            });
        }

        self.events.emit(SyncEvent::LogTaskCompleted {
            source: source.name.clone(),
        });

        task.state = TaskState::AwaitingBlocks;
        debug!(blocks = tickets.len(), logs = batch.logs.len(), "waiting for blocks");

        try_join_all(tickets.into_iter().map(BlockTicket::wait)).await?;

        for key in task.interval_keys() {
            self.intervals
                .record_complete(&key, (from_block, to_block), end_block.timestamp)
                .await
                .change_context(IngestionError::Store)
                .attach_printable("failed to record cached interval")?;
        }

        if !batch.logs.is_empty() {
            self.events.emit(SyncEvent::NewEventsAdded {
                network: self.network.to_string(),
                count: batch.logs.len(),
            });
        }

        task.state = TaskState::Complete;

        let attributes = [
            KeyValue::new("network", self.network.to_string()),
            KeyValue::new("source", source.name.clone()),
        ];
        self.metrics.log_tasks_completed.add(1, &attributes);
        self.metrics
            .logs_inserted
            .add(batch.logs.len() as u64, &attributes);

        debug!(logs = batch.logs.len(), "log task complete");

        Ok(TaskOutcome {
            logs: batch.logs.len(),
            dropped_pending: batch.dropped_pending,
        })
    }

    fn handle_failure(
        &self,
        mut task: BackfillTask,
        err: Report<IngestionError>,
        queue: &mut VecDeque<BackfillTask>,
        factory_events: &mut PendingFactoryEvents,
        report: &mut BackfillReport,
        ct: &CancellationToken,
    ) {
        if ct.is_cancelled() {
            debug!(
                source = %task.source.name,
                error = ?err,
                "dropping task failed during shutdown"
            );
            return;
        }

        if err.is_range_too_large() {
            if let Some((left, right)) = task.split(err.suggested_range()) {
                info!(
                    source = %task.source.name,
                    from_block = task.from_block,
                    to_block = task.to_block,
                    split_at = left.to_block,
                    "block range too large, splitting task"
                );
                if task.kind == TaskKind::FactoryEvents {
                    factory_events.remove(&task);
                    factory_events.insert(&left);
                    factory_events.insert(&right);
                }
                queue.push_front(right);
                queue.push_front(left);
                return;
            }
        }

        task.attempt += 1;
        report.failed_attempts += 1;

        let attributes = [
            KeyValue::new("network", self.network.to_string()),
            KeyValue::new("source", task.source.name.clone()),
        ];
        self.metrics.log_tasks_failed.add(1, &attributes);

        let dead_letter = task.attempt >= self.options.max_task_attempts;

        self.events.emit(SyncEvent::LogTaskFailed {
            source: task.source.name.clone(),
            error: err.current_context().to_string(),
            dead_letter,
        });

        if dead_letter {
            error!(
                source = %task.source.name,
                from_block = task.from_block,
                to_block = task.to_block,
                attempts = task.attempt,
                error = ?err,
                "log task failed too many times, giving up"
            );
            self.metrics.log_tasks_dead_letter.add(1, &attributes);
            report.dead_letters.push(task);
            return;
        }

        warn!(
            source = %task.source.name,
            from_block = task.from_block,
            to_block = task.to_block,
            attempt = task.attempt,
            error = ?err,
            "log task failed, retrying"
        );

        task.state = TaskState::Requeued;
        queue.push_front(task);
    }
}

impl BackfillTask {
    pub fn new(source: SharedSource, from_block: u64, to_block: u64) -> Self {
        Self {
            source,
            kind: TaskKind::Logs,
            from_block,
            to_block,
            attempt: 0,
            state: TaskState::Pending,
        }
    }

    pub fn factory_events(source: SharedSource, from_block: u64, to_block: u64) -> Self {
        Self {
            kind: TaskKind::FactoryEvents,
            ..Self::new(source, from_block, to_block)
        }
    }

    /// Cache keys completed by this task.
    pub fn interval_keys(&self) -> Vec<String> {
        match self.kind {
            TaskKind::Logs => self.source.interval_keys(),
            TaskKind::FactoryEvents => self.source.factory_interval_key().into_iter().collect(),
        }
    }

    /// Splits the task in two, at the end of `suggested` when it is a
    /// prefix of the task range, in the middle otherwise.
    pub fn split(&self, suggested: Option<(u64, u64)>) -> Option<(BackfillTask, BackfillTask)> {
        if self.from_block >= self.to_block {
            return None;
        }

        let split_at = match suggested {
            Some((start, end))
                if start == self.from_block && end >= start && end < self.to_block =>
            {
                end
            }
            _ => self.from_block + (self.to_block - self.from_block) / 2,
        };

        let left = BackfillTask {
            to_block: split_at,
            state: TaskState::Requeued,
            ..self.clone()
        };
        let right = BackfillTask {
            from_block: split_at + 1,
            state: TaskState::Requeued,
            ..self.clone()
        };

        Some((left, right))
    }
}

impl PendingFactoryEvents {
    fn insert(&mut self, task: &BackfillTask) {
        self.0
            .entry(task.source.name.clone())
            .or_default()
            .push((task.from_block, task.to_block));
    }

    fn remove(&mut self, task: &BackfillTask) {
        if let Some(ranges) = self.0.get_mut(&task.source.name) {
            ranges.retain(|range| *range != (task.from_block, task.to_block));
        }
    }

    /// Returns true if the factory events needed by `task` are stored.
    fn is_ready(&self, task: &BackfillTask) -> bool {
        if task.kind != TaskKind::Logs {
            return true;
        }

        self.0
            .get(&task.source.name)
            .map_or(true, |ranges| ranges.iter().all(|(from, _)| *from > task.to_block))
    }
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_task_attempts: 25,
            default_max_block_range: 2_000,
        }
    }
}

impl BackfillOptions {
    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks.max(1);
        self
    }

    pub fn with_max_task_attempts(mut self, max_task_attempts: u32) -> Self {
        self.max_task_attempts = max_task_attempts.max(1);
        self
    }

    pub fn with_default_max_block_range(mut self, default_max_block_range: u64) -> Self {
        self.default_max_block_range = default_max_block_range;
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::source::{LogFilterCriteria, Source, SourceCriteria, Topics};

    use super::*;

    fn new_test_task(from_block: u64, to_block: u64) -> BackfillTask {
        let source = Source {
            name: "test".to_string(),
            network: "mainnet".to_string(),
            chain_id: 1,
            criteria: SourceCriteria::LogFilter(LogFilterCriteria {
                address: None,
                topics: Topics::default(),
            }),
            start_block: 0,
            end_block: None,
            max_block_range: None,
        };
        BackfillTask::new(Arc::new(source), from_block, to_block)
    }

    #[test]
    fn test_split_in_the_middle() {
        let task = new_test_task(100, 200);
        let (left, right) = task.split(None).unwrap();
        assert_eq!((left.from_block, left.to_block), (100, 150));
        assert_eq!((right.from_block, right.to_block), (151, 200));
        assert_eq!(left.state, TaskState::Requeued);
    }

    #[test]
    fn test_split_at_suggested_range() {
        let task = new_test_task(100, 200);
        let (left, right) = task.split(Some((100, 120))).unwrap();
        assert_eq!((left.from_block, left.to_block), (100, 120));
        assert_eq!((right.from_block, right.to_block), (121, 200));

        // A suggestion that doesn't start at the task start is ignored.
        let (left, _) = task.split(Some((50, 120))).unwrap();
        assert_eq!(left.to_block, 150);
    }

    #[test]
    fn test_children_wait_for_factory_events() {
        let events = BackfillTask::factory_events(new_test_task(0, 0).source, 100, 150);
        let mut pending = PendingFactoryEvents::default();
        pending.insert(&events);

        // Later ranges need the earlier factory events too.
        assert!(!pending.is_ready(&new_test_task(100, 150)));
        assert!(!pending.is_ready(&new_test_task(151, 200)));
        assert!(pending.is_ready(&new_test_task(50, 99)));
        assert!(pending.is_ready(&events));

        let (left, right) = events.split(None).unwrap();
        assert_eq!(left.kind, TaskKind::FactoryEvents);
        pending.remove(&events);
        pending.insert(&left);
        pending.insert(&right);

        pending.remove(&left);
        assert!(pending.is_ready(&new_test_task(100, 125)));
        assert!(!pending.is_ready(&new_test_task(126, 200)));

        pending.remove(&right);
        assert!(pending.is_ready(&new_test_task(151, 200)));
    }

    #[test]
    fn test_split_single_block() {
        assert!(new_test_task(100, 100).split(None).is_none());

        let (left, right) = new_test_task(100, 101).split(None).unwrap();
        assert_eq!((left.from_block, left.to_block), (100, 100));
        assert_eq!((right.from_block, right.to_block), (101, 101));
    }
}
