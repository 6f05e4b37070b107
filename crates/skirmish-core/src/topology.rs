//! Processing graph construction and validation.
//!
//! [`TopologyBuilder`] composes named sources, processors, and sinks into
//! a directed acyclic graph. Parents must be added before their children,
//! so a cycle cannot be expressed. State stores are declared separately
//! and granted to nodes: every store has exactly one owning node and any
//! number of read-only nodes.
//!
//! [`TopologyBuilder::build`] splits the graph into its connected
//! components, the [`SubTopology`]s. A sub-topology whose nodes own a
//! global store runs as a single task; every other sub-topology runs one
//! task per partition.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::processor::Processor;

/// Errors raised while building or instantiating a topology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// Two nodes share a name.
    #[error("duplicate node name {name}")]
    DuplicateNode {
        /// The repeated name.
        name: String,
    },

    /// A node names a parent that does not exist (yet).
    #[error("node {node} names unknown parent {parent}")]
    UnknownParent {
        /// The child node.
        node: String,
        /// The missing parent.
        parent: String,
    },

    /// A parent is a sink, which has no output.
    #[error("node {node} cannot have sink {parent} as a parent")]
    SinkParent {
        /// The child node.
        node: String,
        /// The sink.
        parent: String,
    },

    /// A processor or sink was added without parents.
    #[error("node {node} has no parents")]
    Orphan {
        /// The node.
        node: String,
    },

    /// Two sources read the same topic.
    #[error("topic {topic} is consumed by more than one source")]
    DuplicateTopic {
        /// The topic.
        topic: String,
    },

    /// Two stores share a name.
    #[error("duplicate store name {store}")]
    DuplicateStore {
        /// The repeated name.
        store: String,
    },

    /// A grant names a store that was never declared.
    #[error("store {store} is not declared")]
    UnknownStore {
        /// The store.
        store: String,
    },

    /// A grant names a node that does not exist.
    #[error("store {store} is granted to unknown node {node}")]
    UnknownNode {
        /// The store.
        store: String,
        /// The missing node.
        node: String,
    },

    /// Stores can only be granted to processors.
    #[error("store {store} cannot be granted to non-processor {node}")]
    NotAProcessor {
        /// The store.
        store: String,
        /// The source or sink.
        node: String,
    },

    /// A store has no owning node.
    #[error("store {store} has no owner")]
    NoOwner {
        /// The store.
        store: String,
    },

    /// A store has more than one owning node.
    #[error("store {store} has multiple owners: {owners:?}")]
    MultipleOwners {
        /// The store.
        store: String,
        /// Every node granted ownership.
        owners: Vec<String>,
    },

    /// A partitioned store is used from more than one sub-topology.
    #[error("partitioned store {store} is shared across sub-topologies")]
    PartitionedStoreShared {
        /// The store.
        store: String,
    },

    /// A single-instance sub-topology also uses a partitioned store.
    #[error("sub-topology {subtopology} mixes global ownership with partitioned stores")]
    MixedStoreScopes {
        /// The offending sub-topology.
        subtopology: usize,
    },

    /// A node asked for a store it was not granted.
    #[error("node {node} has no declared access to store {store}")]
    UndeclaredStoreAccess {
        /// The store.
        store: String,
        /// The node.
        node: String,
    },

    /// A node asked for write access to a store it may only read.
    #[error("node {node} has read-only access to store {store}")]
    ReadOnlyStore {
        /// The store.
        store: String,
        /// The node.
        node: String,
    },

    /// The store instance was already handed out or was not provided.
    #[error("store {store} is not available to node {node}")]
    StoreUnavailable {
        /// The store.
        store: String,
        /// The node.
        node: String,
    },
}

/// Builds a fresh processor instance for each task.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// How a store is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    /// One instance shared by the whole process.
    Global,
    /// One instance per partition task.
    Partitioned,
}

/// What a node may do with a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccess {
    /// Read and write. Exactly one per store.
    Owner,
    /// Read only.
    ReadOnly,
}

/// How many tasks a sub-topology runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instancing {
    /// A single task.
    Single,
    /// One task per partition.
    Partitioned,
}

pub(crate) enum NodeKind {
    Source { topic: String },
    Processor { factory: ProcessorFactory },
    Sink { topic: String },
}

impl NodeKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::Source { .. } => "Source",
            Self::Processor { .. } => "Processor",
            Self::Sink { .. } => "Sink",
        }
    }
}

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) parents: Vec<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) stores: BTreeMap<String, StoreAccess>,
}

/// A connected component of the processing graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTopology {
    id: usize,
    nodes: Vec<usize>,
    sources: BTreeMap<String, usize>,
    stores: BTreeSet<String>,
    instancing: Instancing,
}

impl SubTopology {
    /// Position of this sub-topology in [`Topology::subtopologies`].
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Topics consumed by this sub-topology's sources.
    pub fn source_topics(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Names of the stores its nodes were granted.
    pub fn stores(&self) -> impl Iterator<Item = &str> {
        self.stores.iter().map(String::as_str)
    }

    /// Whether any node was granted `store`.
    pub fn uses_store(&self, store: &str) -> bool {
        self.stores.contains(store)
    }

    /// How many tasks it runs as.
    pub const fn instancing(&self) -> Instancing {
        self.instancing
    }

    pub(crate) fn node_indices(&self) -> &[usize] {
        &self.nodes
    }

    pub(crate) fn source_nodes(&self) -> &BTreeMap<String, usize> {
        &self.sources
    }
}

/// Incrementally composes a [`Topology`].
#[derive(Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    names: HashMap<String, usize>,
    stores: BTreeMap<String, StoreScope>,
}

impl TopologyBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source node reading `topic`.
    pub fn add_source(self, name: &str, topic: &str) -> Result<Self, TopologyError> {
        self.add_node(
            name,
            NodeKind::Source {
                topic: topic.to_owned(),
            },
            &[],
        )
    }

    /// Add a processor node built by `factory`, fed by `parents`.
    pub fn add_processor<F>(self, name: &str, factory: F, parents: &[&str]) -> Result<Self, TopologyError>
    where
        F: Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.add_node(
            name,
            NodeKind::Processor {
                factory: Arc::new(factory),
            },
            parents,
        )
    }

    /// Add a sink node writing to `topic`, fed by `parents`.
    pub fn add_sink(self, name: &str, topic: &str, parents: &[&str]) -> Result<Self, TopologyError> {
        self.add_node(
            name,
            NodeKind::Sink {
                topic: topic.to_owned(),
            },
            parents,
        )
    }

    /// Declare a state store.
    pub fn add_state_store(mut self, store: &str, scope: StoreScope) -> Result<Self, TopologyError> {
        if self.stores.insert(store.to_owned(), scope).is_some() {
            return Err(TopologyError::DuplicateStore {
                store: store.to_owned(),
            });
        }
        Ok(self)
    }

    /// Grant `node` `access` to `store`.
    pub fn connect_store(
        mut self,
        store: &str,
        node: &str,
        access: StoreAccess,
    ) -> Result<Self, TopologyError> {
        if !self.stores.contains_key(store) {
            return Err(TopologyError::UnknownStore {
                store: store.to_owned(),
            });
        }
        let target = self
            .names
            .get(node)
            .and_then(|&idx| self.nodes.get_mut(idx))
            .ok_or_else(|| TopologyError::UnknownNode {
                store: store.to_owned(),
                node: node.to_owned(),
            })?;
        if !matches!(target.kind, NodeKind::Processor { .. }) {
            return Err(TopologyError::NotAProcessor {
                store: store.to_owned(),
                node: node.to_owned(),
            });
        }
        target.stores.insert(store.to_owned(), access);
        Ok(self)
    }

    /// Validate the graph and split it into sub-topologies.
    pub fn build(self) -> Result<Topology, TopologyError> {
        self.check_ownership()?;

        let groups = self.components();
        let mut subtopologies = Vec::with_capacity(groups.len());
        let mut store_homes: HashMap<&str, usize> = HashMap::new();

        for (id, nodes) in groups.into_iter().enumerate() {
            let mut sources = BTreeMap::new();
            let mut stores = BTreeSet::new();
            let mut owns_global = false;
            let mut uses_partitioned = false;

            for &idx in &nodes {
                let Some(node) = self.nodes.get(idx) else {
                    continue;
                };
                if let NodeKind::Source { topic } = &node.kind {
                    sources.insert(topic.clone(), idx);
                }
                for (store, access) in &node.stores {
                    stores.insert(store.clone());
                    match self.stores.get(store) {
                        Some(StoreScope::Global) if *access == StoreAccess::Owner => {
                            owns_global = true;
                        }
                        Some(StoreScope::Partitioned) => {
                            uses_partitioned = true;
                            if *store_homes.entry(store.as_str()).or_insert(id) != id {
                                return Err(TopologyError::PartitionedStoreShared {
                                    store: store.clone(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }

            if owns_global && uses_partitioned {
                return Err(TopologyError::MixedStoreScopes { subtopology: id });
            }
            subtopologies.push(SubTopology {
                id,
                nodes,
                sources,
                stores,
                instancing: if owns_global {
                    Instancing::Single
                } else {
                    Instancing::Partitioned
                },
            });
        }

        Ok(Topology {
            nodes: self.nodes,
            stores: self.stores,
            subtopologies,
        })
    }

    fn add_node(mut self, name: &str, kind: NodeKind, parents: &[&str]) -> Result<Self, TopologyError> {
        if self.names.contains_key(name) {
            return Err(TopologyError::DuplicateNode {
                name: name.to_owned(),
            });
        }
        if parents.is_empty() && !matches!(kind, NodeKind::Source { .. }) {
            return Err(TopologyError::Orphan {
                node: name.to_owned(),
            });
        }
        if let NodeKind::Source { topic } = &kind {
            let taken = self
                .nodes
                .iter()
                .any(|n| matches!(&n.kind, NodeKind::Source { topic: t } if t == topic));
            if taken {
                return Err(TopologyError::DuplicateTopic {
                    topic: topic.clone(),
                });
            }
        }

        let mut parent_indices = Vec::with_capacity(parents.len());
        for parent in parents {
            let idx = self
                .names
                .get(*parent)
                .copied()
                .ok_or_else(|| TopologyError::UnknownParent {
                    node: name.to_owned(),
                    parent: (*parent).to_owned(),
                })?;
            if self
                .nodes
                .get(idx)
                .is_some_and(|p| matches!(p.kind, NodeKind::Sink { .. }))
            {
                return Err(TopologyError::SinkParent {
                    node: name.to_owned(),
                    parent: (*parent).to_owned(),
                });
            }
            parent_indices.push(idx);
        }

        let idx = self.nodes.len();
        for &parent in &parent_indices {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.push(idx);
            }
        }
        self.nodes.push(Node {
            name: name.to_owned(),
            kind,
            parents: parent_indices,
            children: Vec::new(),
            stores: BTreeMap::new(),
        });
        self.names.insert(name.to_owned(), idx);
        Ok(self)
    }

    fn check_ownership(&self) -> Result<(), TopologyError> {
        for store in self.stores.keys() {
            let owners: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| n.stores.get(store) == Some(&StoreAccess::Owner))
                .map(|n| n.name.clone())
                .collect();
            match owners.len() {
                0 => {
                    return Err(TopologyError::NoOwner {
                        store: store.clone(),
                    });
                }
                1 => {}
                _ => {
                    return Err(TopologyError::MultipleOwners {
                        store: store.clone(),
                        owners,
                    });
                }
            }
        }
        Ok(())
    }

    /// Connected components over parent edges, each in insertion order.
    fn components(&self) -> Vec<Vec<usize>> {
        let mut group_of: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();

        for start in 0..self.nodes.len() {
            if group_of.get(start).copied().flatten().is_some() {
                continue;
            }
            let group = groups.len();
            let mut members = Vec::new();
            let mut stack = vec![start];
            while let Some(idx) = stack.pop() {
                let Some(slot) = group_of.get_mut(idx) else {
                    continue;
                };
                if slot.is_some() {
                    continue;
                }
                *slot = Some(group);
                members.push(idx);
                if let Some(node) = self.nodes.get(idx) {
                    stack.extend(node.parents.iter().chain(&node.children));
                }
            }
            members.sort_unstable();
            groups.push(members);
        }
        groups
    }
}

/// A validated processing graph.
pub struct Topology {
    nodes: Vec<Node>,
    stores: BTreeMap<String, StoreScope>,
    subtopologies: Vec<SubTopology>,
}

impl Topology {
    /// The connected components, in order of their first node.
    pub fn subtopologies(&self) -> &[SubTopology] {
        &self.subtopologies
    }

    /// The sub-topology consuming `topic`.
    pub fn subtopology_for_topic(&self, topic: &str) -> Option<&SubTopology> {
        self.subtopologies
            .iter()
            .find(|sub| sub.sources.contains_key(topic))
    }

    /// Every topic read by a source.
    pub fn source_topics(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|n| match &n.kind {
            NodeKind::Source { topic } => Some(topic.as_str()),
            _ => None,
        })
    }

    /// Every topic written by a sink.
    pub fn sink_topics(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|n| match &n.kind {
            NodeKind::Sink { topic } => Some(topic.as_str()),
            _ => None,
        })
    }

    /// Declared scope of `store`.
    pub fn store_scope(&self, store: &str) -> Option<StoreScope> {
        self.stores.get(store).copied()
    }

    /// Names of every declared store.
    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub(crate) fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    /// Human-readable description of the graph, one line per node.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for sub in &self.subtopologies {
            let _ = writeln!(out, "Sub-topology {} ({:?})", sub.id, sub.instancing);
            for &idx in &sub.nodes {
                let Some(node) = self.nodes.get(idx) else {
                    continue;
                };
                let children: Vec<&str> = node
                    .children
                    .iter()
                    .filter_map(|&c| self.nodes.get(c).map(|n| n.name.as_str()))
                    .collect();
                let _ = write!(out, "  {}: {}", node.kind.label(), node.name);
                match &node.kind {
                    NodeKind::Source { topic } => {
                        let _ = write!(out, " (topic: {topic})");
                    }
                    NodeKind::Sink { topic } => {
                        let _ = write!(out, " (topic: {topic})");
                    }
                    NodeKind::Processor { .. } if !node.stores.is_empty() => {
                        let stores: Vec<&str> = node.stores.keys().map(String::as_str).collect();
                        let _ = write!(out, " (stores: {})", stores.join(", "));
                    }
                    NodeKind::Processor { .. } => {}
                }
                if !children.is_empty() {
                    let _ = write!(out, " --> {}", children.join(", "));
                }
                out.push('\n');
            }
        }
        out
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.nodes.len())
            .field("stores", &self.stores)
            .field("subtopologies", &self.subtopologies)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::{ProcessContext, ProcessError, Record};

    struct Pass;

    impl Processor for Pass {
        fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            context.forward(record);
            Ok(())
        }
    }

    fn pass() -> Box<dyn Processor> {
        Box::new(Pass)
    }

    fn two_components() -> TopologyBuilder {
        TopologyBuilder::new()
            .add_source("a-src", "a")
            .unwrap()
            .add_processor("a-proc", pass, &["a-src"])
            .unwrap()
            .add_source("b-src", "b")
            .unwrap()
            .add_processor("b-proc", pass, &["b-src"])
            .unwrap()
            .add_sink("b-sink", "out", &["b-proc"])
            .unwrap()
            .add_state_store("global", StoreScope::Global)
            .unwrap()
            .add_state_store("local", StoreScope::Partitioned)
            .unwrap()
            .connect_store("global", "a-proc", StoreAccess::Owner)
            .unwrap()
            .connect_store("global", "b-proc", StoreAccess::ReadOnly)
            .unwrap()
            .connect_store("local", "b-proc", StoreAccess::Owner)
            .unwrap()
    }

    #[test]
    fn components_become_subtopologies() {
        let topology = two_components().build().unwrap();
        let subs = topology.subtopologies();
        assert_eq!(subs.len(), 2);
        let (arenas, rounds) = (subs.first().unwrap(), subs.get(1).unwrap());
        assert_eq!(arenas.instancing(), Instancing::Single);
        assert_eq!(rounds.instancing(), Instancing::Partitioned);
        assert_eq!(topology.subtopology_for_topic("b").map(SubTopology::id), Some(1));
        assert!(rounds.uses_store("global"));
        assert_eq!(topology.sink_topics().collect::<Vec<_>>(), vec!["out"]);
    }

    #[test]
    fn unknown_parent_rejected() {
        let result = TopologyBuilder::new()
            .add_source("src", "t")
            .unwrap()
            .add_processor("p", pass, &["nope"]);
        assert!(matches!(result, Err(TopologyError::UnknownParent { .. })));
    }

    #[test]
    fn duplicate_name_rejected() {
        let result = TopologyBuilder::new()
            .add_source("src", "t")
            .unwrap()
            .add_processor("src", pass, &["src"]);
        assert!(matches!(result, Err(TopologyError::DuplicateNode { .. })));
    }

    #[test]
    fn store_without_owner_rejected() {
        let result = TopologyBuilder::new()
            .add_source("src", "t")
            .unwrap()
            .add_processor("p", pass, &["src"])
            .unwrap()
            .add_state_store("s", StoreScope::Partitioned)
            .unwrap()
            .connect_store("s", "p", StoreAccess::ReadOnly)
            .unwrap()
            .build();
        assert!(matches!(result, Err(TopologyError::NoOwner { .. })));
    }

    #[test]
    fn store_with_two_owners_rejected() {
        let result = two_components()
            .connect_store("global", "b-proc", StoreAccess::Owner)
            .unwrap()
            .build();
        assert!(matches!(result, Err(TopologyError::MultipleOwners { .. })));
    }

    #[test]
    fn sources_and_sinks_cannot_hold_stores() {
        let result = two_components().connect_store("local", "b-sink", StoreAccess::ReadOnly);
        assert!(matches!(result, Err(TopologyError::NotAProcessor { .. })));
    }

    #[test]
    fn partitioned_store_cannot_span_subtopologies() {
        let result = two_components()
            .connect_store("local", "a-proc", StoreAccess::ReadOnly)
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(TopologyError::PartitionedStoreShared { .. } | TopologyError::MixedStoreScopes { .. })
        ));
    }

    #[test]
    fn describe_lists_every_node() {
        let description = two_components().build().unwrap().describe();
        assert!(description.contains("Source: a-src (topic: a)"));
        assert!(description.contains("Processor: b-proc (stores: global, local) --> b-sink"));
        assert!(description.contains("Sink: b-sink (topic: out)"));
    }
}
