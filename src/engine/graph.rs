//! Flattening a generator entry tree into a task graph.
//!
//! Every task becomes a node with id `<entry id>#<task name>`. Dependencies are
//! matched against the exports visible from the consuming entry, and each
//! match becomes an edge from the producer to the consumer. Resolution fails
//! fast: a graph is either fully wired or not built at all.
//!
//! ## Visibility
//!
//! An export is visible to the subtree of a single *visible root* entry:
//!
//! * generator scope: the exporting entry itself,
//! * parent scope: the exporting entry's parent,
//! * named scope: the nearest ancestor (or self) that declares the scope.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::engine::entry::GeneratorEntry;
use crate::error::GraphError;
use crate::generator::TaskDefinition;
use crate::provider::{ExportScope, ProviderDependency, ProviderExport, ProviderRegistry};

/// A task positioned in the graph.
#[derive(Debug)]
pub struct TaskNode {
    pub(crate) id: String,
    pub(crate) entry_id: String,
    pub(crate) generator_name: String,
    pub(crate) base_directory: Utf8PathBuf,
    pub(crate) task: Arc<TaskDefinition>,
    /// Dependency key to the export that satisfies it, `None` for an
    /// unresolved optional dependency.
    pub(crate) dependencies: BTreeMap<String, Option<ResolvedDependency>>,
}

impl TaskNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn generator_name(&self) -> &str {
        &self.generator_name
    }

    pub fn base_directory(&self) -> &Utf8Path {
        &self.base_directory
    }

    pub fn task(&self) -> &TaskDefinition {
        &self.task
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedDependency {
    pub producer: NodeIndex,
    /// Key under which the producer exports the value.
    pub key: String,
    /// Whether the value comes from the producer's build phase.
    pub output: bool,
}

/// Edge payload: which provider flows from producer to consumer.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub key: String,
    pub provider: String,
}

struct FlatEntry<'a> {
    entry: &'a GeneratorEntry,
    parent: Option<usize>,
}

struct Candidate {
    node: NodeIndex,
    key: String,
    provider: String,
    output: bool,
    visible_root: usize,
}

#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) graph: DiGraph<TaskNode, DependencyEdge>,
    pub(crate) registry: ProviderRegistry,
}

impl TaskGraph {
    pub fn build(root: &GeneratorEntry) -> Result<Self, GraphError> {
        let entries = flatten(root);
        let mut registry = ProviderRegistry::new();
        let mut graph = DiGraph::new();
        let mut owners = Vec::new();

        for (index, flat) in entries.iter().enumerate() {
            for task in &flat.entry.tasks {
                let exports = task.exports.values().chain(task.outputs.values());
                for export in exports {
                    registry.register(&export.provider)?;
                }
                for dependency in task.dependencies.values() {
                    registry.register(&dependency.provider)?;
                }

                let node = graph.add_node(TaskNode {
                    id: format!("{}#{}", flat.entry.id, task.name),
                    entry_id: flat.entry.id.clone(),
                    generator_name: flat.entry.generator_name.clone(),
                    base_directory: flat.entry.base_directory.clone(),
                    task: task.clone(),
                    dependencies: BTreeMap::new(),
                });
                // `owners` is indexed by node index.
                debug_assert_eq!(node.index(), owners.len());
                owners.push(index);
            }
        }

        let mut candidates = Vec::new();
        for node in graph.node_indices() {
            let owner = owners[node.index()];
            let task = &graph[node].task;

            let declared = task
                .exports
                .iter()
                .map(|(key, export)| (key, export, false))
                .chain(task.outputs.iter().map(|(key, export)| (key, export, true)));

            for (key, export, output) in declared {
                candidates.push(Candidate {
                    node,
                    key: key.clone(),
                    provider: export.provider.name().to_string(),
                    output,
                    visible_root: visible_root(&entries, owner, &graph[node].id, export)?,
                });
            }
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let owner = owners[node.index()];
            let ancestors = ancestors(&entries, owner);
            let task = graph[node].task.clone();

            let mut resolved = BTreeMap::new();
            for (key, dependency) in &task.dependencies {
                let matches: Vec<&Candidate> = candidates
                    .iter()
                    .filter(|candidate| {
                        candidate.node != node
                            && candidate.output == dependency.output
                            && candidate.provider == dependency.provider.name()
                            && ancestors.contains(&candidate.visible_root)
                            && matches_reference(dependency, &graph[candidate.node])
                    })
                    .collect();

                let resolution = match matches.as_slice() {
                    [] if dependency.optional => None,
                    [] => {
                        return Err(GraphError::DependencyNotFound {
                            task: graph[node].id.clone(),
                            key: key.clone(),
                            provider: dependency.provider.name().to_string(),
                        });
                    }
                    [candidate] => {
                        edges.push((
                            candidate.node,
                            node,
                            DependencyEdge {
                                key: key.clone(),
                                provider: candidate.provider.clone(),
                            },
                        ));
                        Some(ResolvedDependency {
                            producer: candidate.node,
                            key: candidate.key.clone(),
                            output: candidate.output,
                        })
                    }
                    many => {
                        return Err(GraphError::AmbiguousDependency {
                            task: graph[node].id.clone(),
                            key: key.clone(),
                            provider: dependency.provider.name().to_string(),
                            count: many.len(),
                            candidates: many
                                .iter()
                                .map(|candidate| graph[candidate.node].id.clone())
                                .collect(),
                        });
                    }
                };

                resolved.insert(key.clone(), resolution);
            }

            graph[node].dependencies = resolved;
        }

        for (producer, consumer, edge) in edges {
            graph.add_edge(producer, consumer, edge);
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle {
                path: cycle_path(&graph, cycle.node_id()),
            });
        }

        tracing::debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            providers = registry.len(),
            "built task graph"
        );

        Ok(Self { graph, registry })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.graph.node_weights().find(|node| node.id == id)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Ids of the tasks `id` depends on, sorted.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        let Some(index) = self.graph.node_indices().find(|&i| self.graph[i].id == id) else {
            return Vec::new();
        };

        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| self.graph[dep].id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl Display for TaskGraph {
    /// Renders the graph as a Mermaid diagram.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.id.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge.weight.provider,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

fn flatten(root: &GeneratorEntry) -> Vec<FlatEntry<'_>> {
    let mut entries = Vec::new();
    let mut stack = vec![(root, None)];

    while let Some((entry, parent)) = stack.pop() {
        let index = entries.len();
        entries.push(FlatEntry { entry, parent });
        for child in entry.children.iter().rev() {
            stack.push((child, Some(index)));
        }
    }

    entries
}

fn ancestors(entries: &[FlatEntry], mut index: usize) -> HashSet<usize> {
    let mut set = HashSet::from([index]);
    while let Some(parent) = entries[index].parent {
        set.insert(parent);
        index = parent;
    }
    set
}

fn visible_root(
    entries: &[FlatEntry],
    owner: usize,
    task: &str,
    export: &ProviderExport,
) -> Result<usize, GraphError> {
    match &export.scope {
        ExportScope::Generator => Ok(owner),
        ExportScope::Parent => entries[owner].parent.ok_or_else(|| GraphError::NoParent {
            task: task.to_string(),
            provider: export.provider.name().to_string(),
            entry: entries[owner].entry.id.clone(),
        }),
        ExportScope::Named(scope) => {
            let mut current = Some(owner);
            while let Some(index) = current {
                let declares = entries[index]
                    .entry
                    .scopes
                    .iter()
                    .any(|declared| declared.name() == scope.name());
                if declares {
                    return Ok(index);
                }
                current = entries[index].parent;
            }

            Err(GraphError::ScopeNotFound {
                task: task.to_string(),
                provider: export.provider.name().to_string(),
                scope: scope.name().to_string(),
            })
        }
    }
}

fn matches_reference(dependency: &ProviderDependency, producer: &TaskNode) -> bool {
    match &dependency.reference {
        Some(reference) => producer.entry_id == *reference,
        None => true,
    }
}

/// Finds a path from `start` back to itself, as task ids.
fn cycle_path(graph: &DiGraph<TaskNode, DependencyEdge>, start: NodeIndex) -> Vec<String> {
    let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    'search: while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if next == start {
                previous.insert(start, current);
                break 'search;
            }
            if !previous.contains_key(&next) {
                previous.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    let mut path = vec![graph[start].id.clone()];
    let mut current = start;
    while let Some(&prev) = previous.get(&current) {
        path.push(graph[prev].id.clone());
        if prev == start {
            break;
        }
        current = prev;
    }
    path.reverse();
    path
}
