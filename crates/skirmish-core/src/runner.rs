//! Pipeline runner: owns every store and task for the process lifetime.
//!
//! [`Pipeline::open`] builds the topology and opens the stores.
//! [`Pipeline::start`] spawns one blocking worker per task plus one async
//! router per input topic, and returns a [`RunningPipeline`] handle:
//!
//! - **Partitioning**: a router hashes each record key (or the payload
//!   when there is none) onto the partition tasks of its sub-topology.
//! - **Batching**: a worker takes up to `batch_size` queued records,
//!   processes them in arrival order, then commits.
//! - **Fault recovery**: a storage fault abandons the task without
//!   committing, rebuilds it from durable state and replays the whole
//!   batch, up to `max_restarts` times. Sink output of a batch is held
//!   back until its commit succeeds.
//! - **Graceful stop**: routers close their inputs and route everything
//!   already accepted, workers drain what is queued, commit, close their
//!   processors, and the state directory is optionally removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use skirmish_store::{StoreError, remove_state_dir};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SkirmishConfig;
use crate::feed::{ARENAS_TOPIC, InboundRecord, OutboundRecord, ROUNDS_TOPIC};
use crate::partition::partition_for;
use crate::pipeline::combat_topology;
use crate::processor::ProcessError;
use crate::query::VictoryQueryService;
use crate::stores::{ARENA_STORE, ArenaReader, StateStores, VICTORY_STORE};
use crate::task::{StreamTask, TaskId, TaskMetrics};
use crate::topology::{Instancing, Topology, TopologyError};

/// Errors that can occur while running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The topology is invalid or could not be instantiated.
    #[error("topology error: {source}")]
    Topology {
        /// The underlying topology error.
        #[from]
        source: TopologyError,
    },

    /// A store could not be opened.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },

    /// A task kept failing and was given up.
    #[error("task {task} failed after {restarts} restarts: {source}")]
    PartitionFailed {
        /// The failed task.
        task: TaskId,
        /// Restarts attempted.
        restarts: u32,
        /// The last fatal error.
        source: ProcessError,
    },

    /// A task failed to close cleanly.
    #[error("task {task} failed to close: {source}")]
    Close {
        /// The task.
        task: TaskId,
        /// The close failure.
        source: ProcessError,
    },

    /// A worker thread panicked or was cancelled.
    #[error("worker join failed: {message}")]
    Join {
        /// Description of the failure.
        message: String,
    },
}

/// An input record on its way to a task.
#[derive(Debug)]
struct TaskInput {
    topic: Arc<str>,
    record: InboundRecord,
}

/// Channels connecting the pipeline to the outside world.
#[derive(Debug)]
pub struct PipelineFeeds {
    /// Input channel per logical topic.
    pub inputs: BTreeMap<String, mpsc::Receiver<InboundRecord>>,
    /// Where sink output goes.
    pub results: mpsc::Sender<OutboundRecord>,
}

/// The producer and consumer ends matching a [`PipelineFeeds`].
#[derive(Debug)]
pub struct FeedHandles {
    /// Send arena upserts and tombstones here.
    pub arenas: mpsc::Sender<InboundRecord>,
    /// Send round events here.
    pub rounds: mpsc::Sender<InboundRecord>,
    /// Victory decisions come out here.
    pub results: mpsc::Receiver<OutboundRecord>,
}

impl PipelineFeeds {
    /// Bounded arena, round, and result channels of `capacity` each.
    pub fn channels(capacity: usize) -> (FeedHandles, Self) {
        let (arenas_tx, arenas_rx) = mpsc::channel(capacity);
        let (rounds_tx, rounds_rx) = mpsc::channel(capacity);
        let (results_tx, results_rx) = mpsc::channel(capacity);
        let handles = FeedHandles {
            arenas: arenas_tx,
            rounds: rounds_tx,
            results: results_rx,
        };
        let feeds = Self {
            inputs: BTreeMap::from([
                (ARENAS_TOPIC.to_owned(), arenas_rx),
                (ROUNDS_TOPIC.to_owned(), rounds_rx),
            ]),
            results: results_tx,
        };
        (handles, feeds)
    }
}

/// Counters of every task after the pipeline stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Final counters per task.
    pub tasks: BTreeMap<TaskId, TaskMetrics>,
}

impl PipelineReport {
    /// Counters summed over all tasks.
    pub fn totals(&self) -> TaskMetrics {
        self.tasks.values().fold(TaskMetrics::default(), |acc, m| TaskMetrics {
            processed: acc.processed.saturating_add(m.processed),
            emitted: acc.emitted.saturating_add(m.emitted),
            suppressed: acc.suppressed.saturating_add(m.suppressed),
            abandoned: acc.abandoned.saturating_add(m.abandoned),
            poison: acc.poison.saturating_add(m.poison),
            unresolved: acc.unresolved.saturating_add(m.unresolved),
            time_faults: acc.time_faults.saturating_add(m.time_faults),
            commits: acc.commits.saturating_add(m.commits),
            restarts: acc.restarts.saturating_add(m.restarts),
        })
    }
}

/// A configured, not yet running pipeline.
#[derive(Debug)]
pub struct Pipeline {
    config: SkirmishConfig,
    topology: Arc<Topology>,
    stores: Arc<StateStores>,
}

impl Pipeline {
    /// Build the combat topology and open every store.
    pub fn open(config: SkirmishConfig) -> Result<Self, RunnerError> {
        let topology = combat_topology(&config)?;
        Self::with_topology(config, topology)
    }

    /// Open stores for a custom `topology`. Only the arena and victory
    /// stores can be provided.
    pub fn with_topology(config: SkirmishConfig, topology: Topology) -> Result<Self, RunnerError> {
        if let Some(store) = topology
            .store_names()
            .find(|name| *name != ARENA_STORE && *name != VICTORY_STORE)
        {
            return Err(TopologyError::UnknownStore {
                store: store.to_owned(),
            }
            .into());
        }
        info!(topology = %topology.describe(), "Topology built");

        let stores = StateStores::open(&config.stores, config.pipeline.partitions)?;
        Ok(Self {
            config,
            topology: Arc::new(topology),
            stores: Arc::new(stores),
        })
    }

    /// The processing graph.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Read-only queries over every partition's victory window.
    pub fn query_service(&self) -> VictoryQueryService {
        VictoryQueryService::new(self.stores.victory_readers().to_vec(), self.stores.window())
    }

    /// Read-only handle on the arena registry.
    pub fn arena_reader(&self) -> ArenaReader {
        self.stores.arena_reader()
    }

    /// Spawn every task and router. Must be called within a Tokio runtime.
    pub fn start(self, mut feeds: PipelineFeeds) -> RunningPipeline {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pipeline = &self.config.pipeline;
        let mut routers = Vec::new();
        let mut tasks = Vec::new();

        for sub in self.topology.subtopologies() {
            let count = match sub.instancing() {
                Instancing::Single => 1,
                Instancing::Partitioned => pipeline.partitions,
            };
            let mut senders = Vec::new();
            for partition in 0..count {
                let (tx, rx) = mpsc::channel(pipeline.channel_capacity);
                senders.push(tx);
                let worker = Worker {
                    id: TaskId {
                        subtopology: sub.id(),
                        partition,
                    },
                    topology: Arc::clone(&self.topology),
                    stores: Arc::clone(&self.stores),
                    with_victories: sub.uses_store(VICTORY_STORE),
                    batch_size: pipeline.batch_size.max(1),
                    max_restarts: pipeline.max_restarts,
                    results: feeds.results.clone(),
                };
                tasks.push((worker.id, tokio::task::spawn_blocking(move || worker.run(rx))));
            }

            for topic in sub.source_topics() {
                let Some(input) = feeds.inputs.remove(topic) else {
                    warn!(topic, "No input feed for topic");
                    continue;
                };
                routers.push(tokio::spawn(route(
                    Arc::from(topic),
                    input,
                    senders.clone(),
                    shutdown_rx.clone(),
                )));
            }
        }

        info!(
            tasks = tasks.len(),
            partitions = pipeline.partitions,
            batch_size = pipeline.batch_size,
            "Pipeline started"
        );
        RunningPipeline {
            shutdown,
            routers,
            tasks,
            stores: self.stores,
            cleanup: self.config.stores.cleanup_on_shutdown,
        }
    }
}

/// Handle on a started pipeline.
#[derive(Debug)]
pub struct RunningPipeline {
    shutdown: watch::Sender<bool>,
    routers: Vec<JoinHandle<()>>,
    tasks: Vec<(TaskId, JoinHandle<Result<TaskMetrics, RunnerError>>)>,
    stores: Arc<StateStores>,
    cleanup: bool,
}

impl RunningPipeline {
    /// A receiver that flips to `true` once the pipeline is stopping.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop reading inputs, then drain and close every task.
    pub async fn shutdown(self) -> Result<PipelineReport, RunnerError> {
        info!("Pipeline shutdown requested");
        self.shutdown.send_replace(true);
        self.wait().await
    }

    /// Wait until every input closes and every task has drained.
    pub async fn wait(self) -> Result<PipelineReport, RunnerError> {
        for router in self.routers {
            if let Err(e) = router.await {
                warn!(error = %e, "Router ended abnormally");
            }
        }

        let mut report = PipelineReport::default();
        let mut first_error = None;
        for (id, handle) in self.tasks {
            match handle.await {
                Ok(Ok(metrics)) => {
                    report.tasks.insert(id, metrics);
                }
                Ok(Err(e)) => {
                    error!(task = %id, error = %e, "Task ended with error");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(task = %id, error = %e, "Task join failed");
                    first_error.get_or_insert(RunnerError::Join {
                        message: e.to_string(),
                    });
                }
            }
        }
        self.shutdown.send_replace(true);

        if self.cleanup
            && let Some(dir) = self.stores.state_dir()
        {
            remove_state_dir(dir)?;
            info!(dir = %dir.display(), "Local state removed");
        }

        let totals = report.totals();
        info!(
            processed = totals.processed,
            emitted = totals.emitted,
            suppressed = totals.suppressed,
            poison = totals.poison,
            restarts = totals.restarts,
            "Pipeline stopped"
        );
        first_error.map_or(Ok(report), Err)
    }
}

/// Forward one input topic to the tasks of its sub-topology.
///
/// On shutdown the input is closed to producers and whatever it already
/// accepted is still routed before the task senders are dropped.
async fn route(
    topic: Arc<str>,
    mut input: mpsc::Receiver<InboundRecord>,
    senders: Vec<mpsc::Sender<TaskInput>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let partitions = u32::try_from(senders.len()).unwrap_or(u32::MAX);
    let mut routed = 0_u64;
    let mut draining = false;
    loop {
        let record = if draining {
            input.recv().await
        } else {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    input.close();
                    draining = true;
                    debug!(topic = %topic, "Router draining");
                    continue;
                }
                record = input.recv() => record,
            }
        };
        let Some(record) = record else {
            break;
        };
        let key = record
            .key
            .as_deref()
            .map_or(record.payload.as_slice(), str::as_bytes);
        let partition = partition_for(key, partitions);
        let Some(sender) = usize::try_from(partition).ok().and_then(|p| senders.get(p)) else {
            continue;
        };
        let input = TaskInput {
            topic: Arc::clone(&topic),
            record,
        };
        if sender.send(input).await.is_err() {
            warn!(topic = %topic, partition, "Task is gone, dropping record");
            continue;
        }
        routed = routed.saturating_add(1);
    }
    info!(topic = %topic, routed, drained = draining, "Router stopped");
}

/// Everything a blocking worker needs to (re)build and drive its task.
struct Worker {
    id: TaskId,
    topology: Arc<Topology>,
    stores: Arc<StateStores>,
    with_victories: bool,
    batch_size: usize,
    max_restarts: u32,
    results: mpsc::Sender<OutboundRecord>,
}

impl Worker {
    fn build(&self, metrics: TaskMetrics) -> Result<StreamTask, RunnerError> {
        let stores = self.stores.task_stores(self.id.partition, self.with_victories)?;
        let mut task = StreamTask::new(&self.topology, self.id.subtopology, self.id.partition, stores)?;
        task.restore_metrics(metrics);
        Ok(task)
    }

    fn run(self, mut rx: mpsc::Receiver<TaskInput>) -> Result<TaskMetrics, RunnerError> {
        let mut committed = TaskMetrics::default();
        let mut task = self.build(committed)?;
        info!(task = %self.id, "Stream task started");

        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(first) = rx.blocking_recv() {
            batch.push(first);
            while batch.len() < self.batch_size {
                match rx.try_recv() {
                    Ok(input) => batch.push(input),
                    Err(_) => break,
                }
            }

            // A failed batch is replayed in full on the rebuilt task.
            let outputs = loop {
                match Self::process_batch(&mut task, &batch) {
                    Ok(outputs) => break outputs,
                    Err(source) => {
                        task.abandon();
                        committed.restarts = committed.restarts.saturating_add(1);
                        if committed.restarts > self.max_restarts {
                            error!(task = %self.id, error = %source, restarts = committed.restarts, "Giving up on task");
                            return Err(RunnerError::PartitionFailed {
                                task: self.id,
                                restarts: self.max_restarts,
                                source,
                            });
                        }
                        error!(
                            task = %self.id,
                            error = %source,
                            restarts = committed.restarts,
                            batch = batch.len(),
                            "Storage fault, rebuilding task"
                        );
                        task = self.build(committed)?;
                    }
                }
            };
            batch.clear();
            committed = *task.metrics();

            for output in outputs {
                if self.results.blocking_send(output).is_err() {
                    warn!(task = %self.id, "Result feed closed, dropping output");
                }
            }
        }

        task.close().map_err(|source| RunnerError::Close {
            task: self.id,
            source,
        })?;
        Ok(*task.metrics())
    }

    /// Process and commit one batch. Sink output is only released once
    /// the commit succeeded.
    fn process_batch(task: &mut StreamTask, batch: &[TaskInput]) -> Result<Vec<OutboundRecord>, ProcessError> {
        let mut outputs = Vec::new();
        for input in batch {
            outputs.extend(task.process(&input.topic, input.record.clone())?);
        }
        task.commit()?;
        Ok(outputs)
    }
}
