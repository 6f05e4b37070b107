//! One running instance of a sub-topology.
//!
//! A [`StreamTask`] builds its processors from their factories, hands them
//! their stores, and pushes each input record depth-first through the
//! graph. Sink output is collected and returned to the caller. Record
//! level failures are counted and skipped here; storage faults are
//! returned so the runner can rebuild the task.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::feed::{InboundRecord, OutboundRecord};
use crate::processor::{InitContext, ProcessContext, ProcessError, Processor, Record};
use crate::stores::TaskStores;
use crate::topology::{NodeKind, Topology, TopologyError};

/// Identifies a task: sub-topology and partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    /// Sub-topology the task instantiates.
    pub subtopology: usize,
    /// Partition it processes.
    pub partition: u32,
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.subtopology, self.partition)
    }
}

/// Per-task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskMetrics {
    /// Input records received.
    pub processed: u64,
    /// Records written by sinks.
    pub emitted: u64,
    /// Emissions suppressed by deduplication.
    pub suppressed: u64,
    /// Pending state dropped without output.
    pub abandoned: u64,
    /// Malformed records skipped.
    pub poison: u64,
    /// Records dropped for an unknown arena.
    pub unresolved: u64,
    /// Records rejected for lacking an event time.
    pub time_faults: u64,
    /// Completed commits.
    pub commits: u64,
    /// Times the task was rebuilt after a storage fault.
    pub restarts: u32,
}

impl TaskMetrics {
    fn record_skip(&mut self, error: &ProcessError) {
        let counter = match error {
            ProcessError::UnresolvedArena { .. } => &mut self.unresolved,
            ProcessError::TimeExtraction { .. } => &mut self.time_faults,
            ProcessError::Poison { .. }
            | ProcessError::UnexpectedPayload { .. }
            | ProcessError::NotInitialized { .. }
            | ProcessError::Encode { .. }
            | ProcessError::Storage { .. } => &mut self.poison,
        };
        *counter = counter.saturating_add(1);
    }
}

enum TaskNodeKind {
    Source,
    Processor(Box<dyn Processor>),
    Sink { topic: String },
}

struct TaskNode {
    name: String,
    kind: TaskNodeKind,
    children: Vec<usize>,
}

/// A sub-topology instantiated for one partition.
pub struct StreamTask {
    id: TaskId,
    nodes: Vec<TaskNode>,
    sources: BTreeMap<String, usize>,
    metrics: TaskMetrics,
    closed: bool,
}

impl StreamTask {
    /// Instantiate sub-topology `subtopology` for `partition` and
    /// initialize every processor.
    pub fn new(
        topology: &Topology,
        subtopology: usize,
        partition: u32,
        mut stores: TaskStores,
    ) -> Result<Self, TopologyError> {
        let id = TaskId {
            subtopology,
            partition,
        };
        let Some(sub) = topology.subtopologies().get(subtopology) else {
            return Ok(Self {
                id,
                nodes: Vec::new(),
                sources: BTreeMap::new(),
                metrics: TaskMetrics::default(),
                closed: false,
            });
        };

        let position: HashMap<usize, usize> = sub
            .node_indices()
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        let mut nodes = Vec::with_capacity(sub.node_indices().len());
        for &idx in sub.node_indices() {
            let Some(node) = topology.node(idx) else {
                continue;
            };
            let kind = match &node.kind {
                NodeKind::Source { .. } => TaskNodeKind::Source,
                NodeKind::Sink { topic } => TaskNodeKind::Sink {
                    topic: topic.clone(),
                },
                NodeKind::Processor { factory } => {
                    let mut processor = factory();
                    let mut context = InitContext::new(&node.name, partition, &node.stores, &mut stores);
                    processor.init(&mut context)?;
                    TaskNodeKind::Processor(processor)
                }
            };
            nodes.push(TaskNode {
                name: node.name.clone(),
                kind,
                children: node
                    .children
                    .iter()
                    .filter_map(|child| position.get(child).copied())
                    .collect(),
            });
        }

        let sources = sub
            .source_nodes()
            .iter()
            .filter_map(|(topic, idx)| position.get(idx).map(|&pos| (topic.clone(), pos)))
            .collect();

        debug!(task = %id, nodes = nodes.len(), "Stream task initialized");
        Ok(Self {
            id,
            nodes,
            sources,
            metrics: TaskMetrics::default(),
            closed: false,
        })
    }

    /// The task identity.
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Counters so far.
    pub const fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    /// Carry the counters of a previous instance over, as of its last
    /// successful commit.
    pub const fn restore_metrics(&mut self, metrics: TaskMetrics) {
        self.metrics = metrics;
    }

    /// Push one input record from `topic` through the graph.
    ///
    /// Returns what the sinks produced. Record level failures are logged,
    /// counted, and swallowed.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`ProcessError`] (storage fault). The task must not
    /// be used afterwards.
    pub fn process(&mut self, topic: &str, input: InboundRecord) -> Result<Vec<OutboundRecord>, ProcessError> {
        self.metrics.processed = self.metrics.processed.saturating_add(1);
        let Some(&source) = self.sources.get(topic) else {
            warn!(task = %self.id, topic, "No source for topic, dropping record");
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        self.dispatch(source, Record::from_inbound(input), &mut out)?;
        let emitted = u64::try_from(out.len()).unwrap_or(u64::MAX);
        self.metrics.emitted = self.metrics.emitted.saturating_add(emitted);
        Ok(out)
    }

    /// Commit every processor's state.
    ///
    /// # Errors
    ///
    /// Returns the first processor failure.
    pub fn commit(&mut self) -> Result<(), ProcessError> {
        for node in &mut self.nodes {
            if let TaskNodeKind::Processor(processor) = &mut node.kind {
                processor.commit()?;
            }
        }
        self.metrics.commits = self.metrics.commits.saturating_add(1);
        Ok(())
    }

    /// Give the task up after a fatal error without committing or closing
    /// its processors, so nothing from the failed batch becomes durable.
    pub fn abandon(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!(
            task = %self.id,
            processed = self.metrics.processed,
            commits = self.metrics.commits,
            "Stream task abandoned"
        );
    }

    /// Close every processor and log the task's counters. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first processor failure; the remaining processors are
    /// still closed.
    pub fn close(&mut self) -> Result<(), ProcessError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for node in &mut self.nodes {
            if let TaskNodeKind::Processor(processor) = &mut node.kind
                && let Err(e) = processor.close()
            {
                warn!(task = %self.id, node = node.name, error = %e, "Processor close failed");
                first_error.get_or_insert(e);
            }
        }

        let m = &self.metrics;
        info!(
            task = %self.id,
            processed = m.processed,
            emitted = m.emitted,
            suppressed = m.suppressed,
            abandoned = m.abandoned,
            poison = m.poison,
            unresolved = m.unresolved,
            time_faults = m.time_faults,
            commits = m.commits,
            restarts = m.restarts,
            "Stream task closed"
        );
        first_error.map_or(Ok(()), Err)
    }

    fn dispatch(&mut self, pos: usize, record: Record, out: &mut Vec<OutboundRecord>) -> Result<(), ProcessError> {
        let partition = self.id.partition;
        let Some(node) = self.nodes.get_mut(pos) else {
            return Ok(());
        };

        let forwarded = match &mut node.kind {
            TaskNodeKind::Source => vec![record],
            TaskNodeKind::Sink { topic } => {
                match record.into_outbound(topic) {
                    Ok(outbound) => out.push(outbound),
                    Err(e) => {
                        warn!(task = %self.id, node = node.name, error = %e, "Skipping unencodable record");
                        self.metrics.record_skip(&e);
                    }
                }
                return Ok(());
            }
            TaskNodeKind::Processor(processor) => {
                let mut context = ProcessContext::new(&node.name, partition, &mut self.metrics);
                let result = processor.process(record, &mut context);
                let forwarded = context.into_forwarded();
                match result {
                    Ok(()) => forwarded,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(task = %self.id, node = node.name, error = %e, "Skipping record");
                        self.metrics.record_skip(&e);
                        return Ok(());
                    }
                }
            }
        };

        let children = node.children.clone();
        let Some((&last, rest)) = children.split_last() else {
            return Ok(());
        };
        for record in forwarded {
            for &child in rest {
                self.dispatch(child, record.clone(), out)?;
            }
            self.dispatch(last, record, out)?;
        }
        Ok(())
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(task = %self.id, error = %e, "Stream task close on drop failed");
        }
    }
}

impl std::fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTask")
            .field("id", &self.id)
            .field("nodes", &self.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use skirmish_store::{StoreError, WindowConfig};

    use super::*;
    use crate::processor::Payload;
    use crate::stores::StateStores;
    use crate::topology::TopologyBuilder;

    /// Upper-cases raw payloads; rejects "bad" and fails storage on "io".
    struct Shout;

    impl Processor for Shout {
        fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            let Payload::Raw(bytes) = &record.payload else {
                return Ok(());
            };
            match bytes.as_slice() {
                b"bad" => Err(ProcessError::Poison {
                    reason: "bad".to_owned(),
                }),
                b"io" => Err(StoreError::Poisoned("io".to_owned()).into()),
                _ => {
                    let upper = bytes.to_ascii_uppercase();
                    let out = record.derive(record.key.clone(), record.timestamp, Payload::Raw(upper));
                    context.forward(out);
                    Ok(())
                }
            }
        }
    }

    fn task() -> StreamTask {
        let topology = TopologyBuilder::new()
            .add_source("src", "in")
            .unwrap()
            .add_processor("shout", || Box::new(Shout), &["src"])
            .unwrap()
            .add_sink("one", "out-1", &["shout"])
            .unwrap()
            .add_sink("two", "out-2", &["shout"])
            .unwrap()
            .build()
            .unwrap();
        let stores = StateStores::in_memory(WindowConfig::default(), 1);
        StreamTask::new(&topology, 0, 0, stores.task_stores(0, false).unwrap()).unwrap()
    }

    #[test]
    fn records_reach_every_sink() {
        let mut task = task();
        let out = task.process("in", InboundRecord::keyed("k", b"hi".to_vec())).unwrap();
        let topics: Vec<&str> = out.iter().map(|o| o.topic.as_str()).collect();
        assert_eq!(topics, vec!["out-1", "out-2"]);
        assert!(out.iter().all(|o| o.payload == b"HI"));
        assert_eq!(task.metrics().emitted, 2);
    }

    #[test]
    fn poison_is_skipped_and_counted() {
        let mut task = task();
        assert!(task.process("in", InboundRecord::keyed("k", b"bad".to_vec())).unwrap().is_empty());
        assert_eq!(task.process("in", InboundRecord::keyed("k", b"ok".to_vec())).unwrap().len(), 2);
        assert_eq!(task.metrics().poison, 1);
        assert_eq!(task.metrics().processed, 2);
    }

    #[test]
    fn storage_fault_is_returned() {
        let mut task = task();
        let result = task.process("in", InboundRecord::keyed("k", b"io".to_vec()));
        assert!(result.is_err_and(|e| e.is_fatal()));
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let mut task = task();
        assert!(task.process("other", InboundRecord::keyed("k", b"x".to_vec())).unwrap().is_empty());
    }

    #[test]
    fn abandoned_task_skips_close() {
        let mut task = task();
        task.abandon();
        assert!(task.close().is_ok());
        assert_eq!(task.metrics().commits, 0);
    }

    #[test]
    fn task_id_display() {
        let id = TaskId {
            subtopology: 1,
            partition: 3,
        };
        assert_eq!(id.to_string(), "1_3");
    }
}
