//! Build-time module graph.
//!
//! Topology mutation only happens while the pipeline is `Constructed`; at
//! start the graph is frozen into the runtime node table. Module indices
//! are daggy node indices, which are stable because nodes are never
//! removed, and double as bit positions in completion masks.

use crate::error::{Error, Result};
use crate::module::{Module, ModuleConfig, ParamMap};
use daggy::{Dag, NodeIndex, Walker};
use std::collections::HashMap;

/// Completion masks are u64 bitsets, which caps a graph at 64 modules.
pub const MAX_MODULES: usize = 64;

/// A module waiting for the pipeline to start.
pub(crate) struct BuildNode {
    pub name: String,
    pub module: Box<dyn Module>,
    pub parallelism: u32,
    pub queue_capacity: usize,
    pub parameters: ParamMap,
}

/// Edge payload: the link's identifier.
pub(crate) struct LinkEdge {
    pub id: String,
}

/// The pre-start module graph.
pub(crate) struct Graph {
    dag: Dag<BuildNode, LinkEdge>,
    by_name: HashMap<String, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            dag: Dag::new(),
            by_name: HashMap::new(),
        }
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Add a module. Fails on duplicate names and past [`MAX_MODULES`].
    pub fn add(&mut self, node: BuildNode) -> Result<u32> {
        if self.by_name.contains_key(&node.name) {
            return Err(Error::Graph(format!(
                "module '{}' already added",
                node.name
            )));
        }
        if self.dag.node_count() >= MAX_MODULES {
            return Err(Error::Graph(format!(
                "graph is limited to {MAX_MODULES} modules"
            )));
        }
        let name = node.name.clone();
        let idx = self.dag.add_node(node);
        self.by_name.insert(name, idx);
        Ok(idx.index() as u32)
    }

    /// Link two modules by name. Returns the link id.
    ///
    /// Fails when either module is unknown, the edge already exists, or
    /// the edge would create a cycle.
    pub fn link(&mut self, up: &str, down: &str) -> Result<String> {
        let up_idx = self.index_of(up)?;
        let down_idx = self.index_of(down)?;
        let duplicate = self
            .dag
            .children(up_idx)
            .iter(&self.dag)
            .any(|(_, node)| node == down_idx);
        if duplicate {
            return Err(Error::Graph(format!("'{up}' is already linked to '{down}'")));
        }
        let id = format!("{up}->{down}");
        self.dag
            .add_edge(up_idx, down_idx, LinkEdge { id: id.clone() })
            .map_err(|_| Error::Graph(format!("link {up} -> {down} would create a cycle")))?;
        Ok(id)
    }

    pub fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn node(&self, idx: NodeIndex) -> &BuildNode {
        &self.dag[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut BuildNode {
        &mut self.dag[idx]
    }

    /// Iterate nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &BuildNode)> + '_ {
        (0..self.dag.node_count()).map(|i| {
            let idx = NodeIndex::new(i);
            (idx, &self.dag[idx])
        })
    }

    /// Take all modules out for execution, in insertion order.
    pub fn take_modules(self) -> Vec<BuildNode> {
        let (nodes, _) = self.dag.into_graph().into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }

    /// Downstream module indices of `idx`, in link-creation order.
    pub fn downstream(&self, idx: NodeIndex) -> Vec<u32> {
        let mut edges: Vec<(usize, u32)> = self
            .dag
            .children(idx)
            .iter(&self.dag)
            .map(|(edge, node)| (edge.index(), node.index() as u32))
            .collect();
        edges.sort();
        edges.into_iter().map(|(_, target)| target).collect()
    }

    /// Bitmask of modules with an edge into `idx`.
    pub fn upstream_mask(&self, idx: NodeIndex) -> u64 {
        self.dag
            .parents(idx)
            .iter(&self.dag)
            .fold(0u64, |mask, (_, node)| mask | (1u64 << node.index()))
    }

    /// All links as `(id, up, down)` triples, in creation order.
    pub fn links(&self) -> Vec<(String, u32, u32)> {
        let mut links: Vec<(usize, String, u32, u32)> = Vec::new();
        for i in 0..self.dag.node_count() {
            let up = NodeIndex::new(i);
            for (edge, node) in self.dag.children(up).iter(&self.dag) {
                let id = self
                    .dag
                    .edge_weight(edge)
                    .map(|link| link.id.clone())
                    .unwrap_or_default();
                links.push((edge.index(), id, i as u32, node.index() as u32));
            }
        }
        links.sort_by_key(|(order, ..)| *order);
        links
            .into_iter()
            .map(|(_, id, up, down)| (id, up, down))
            .collect()
    }

    /// Validate a set of configs against this graph and each other before
    /// anything is instantiated: unique names, resolvable downstream
    /// references, registered classes, and acyclicity.
    pub fn validate_configs(
        &self,
        configs: &[ModuleConfig],
        registry: &crate::module::ModuleRegistry,
    ) -> Result<()> {
        let mut names: HashMap<&str, usize> = HashMap::new();
        for (i, config) in configs.iter().enumerate() {
            if config.name.is_empty() {
                return Err(Error::Graph("module name must not be empty".into()));
            }
            if self.contains(&config.name) || names.insert(&config.name, i).is_some() {
                return Err(Error::Graph(format!(
                    "duplicate module name: {}",
                    config.name
                )));
            }
            if !registry.contains(&config.class_name) {
                return Err(Error::Graph(format!(
                    "unknown module class: {}",
                    config.class_name
                )));
            }
        }
        if self.len() + configs.len() > MAX_MODULES {
            return Err(Error::Graph(format!(
                "graph is limited to {MAX_MODULES} modules"
            )));
        }
        // Reference resolution + cycle check on a shadow name graph.
        let mut shadow: Dag<(), ()> = Dag::new();
        let shadow_idx: Vec<NodeIndex> = configs.iter().map(|_| shadow.add_node(())).collect();
        for (i, config) in configs.iter().enumerate() {
            for next in &config.next {
                let Some(&j) = names.get(next.as_str()) else {
                    if self.contains(next) {
                        continue;
                    }
                    return Err(Error::Graph(format!(
                        "module '{}' references unknown downstream '{next}'",
                        config.name
                    )));
                };
                shadow
                    .add_edge(shadow_idx[i], shadow_idx[j], ())
                    .map_err(|_| {
                        Error::Graph(format!(
                            "link {} -> {next} would create a cycle",
                            config.name
                        ))
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Bundle;
    use crate::module::Output;
    use std::sync::Arc;

    struct Stub(String);

    impl Module for Stub {
        fn name(&self) -> &str {
            &self.0
        }
        fn open(&mut self, _params: &ParamMap) -> bool {
            true
        }
        fn process(&self, _bundle: &Arc<Bundle>) -> crate::error::Result<Output> {
            Ok(Output::Forward)
        }
        fn close(&mut self) {}
    }

    fn build_node(name: &str) -> BuildNode {
        BuildNode {
            name: name.into(),
            module: Box::new(Stub(name.into())),
            parallelism: 1,
            queue_capacity: 20,
            parameters: ParamMap::new(),
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut graph = Graph::new();
        graph.add(build_node("a")).unwrap();
        assert!(graph.add(build_node("a")).is_err());
    }

    #[test]
    fn cycles_rejected() {
        let mut graph = Graph::new();
        graph.add(build_node("a")).unwrap();
        graph.add(build_node("b")).unwrap();
        graph.link("a", "b").unwrap();
        assert!(graph.link("b", "a").is_err());
    }

    #[test]
    fn duplicate_links_rejected() {
        let mut graph = Graph::new();
        graph.add(build_node("a")).unwrap();
        graph.add(build_node("b")).unwrap();
        graph.link("a", "b").unwrap();
        assert!(graph.link("a", "b").is_err());
    }

    #[test]
    fn upstream_masks_reflect_fan_in() {
        let mut graph = Graph::new();
        let a = graph.add(build_node("a")).unwrap();
        let b = graph.add(build_node("b")).unwrap();
        graph.add(build_node("c")).unwrap();
        graph.link("a", "c").unwrap();
        graph.link("b", "c").unwrap();
        let c_idx = graph.index_of("c").unwrap();
        assert_eq!(graph.upstream_mask(c_idx), (1 << a) | (1 << b));
        assert_eq!(graph.downstream(graph.index_of("a").unwrap()), vec![2]);
    }

    #[test]
    fn link_ids_in_creation_order() {
        let mut graph = Graph::new();
        graph.add(build_node("a")).unwrap();
        graph.add(build_node("b")).unwrap();
        graph.add(build_node("c")).unwrap();
        graph.link("a", "b").unwrap();
        graph.link("b", "c").unwrap();
        let links = graph.links();
        assert_eq!(links[0].0, "a->b");
        assert_eq!(links[1].0, "b->c");
    }

    #[test]
    fn config_validation_catches_bad_references() {
        let graph = Graph::new();
        let registry = crate::module::ModuleRegistry::with_builtins();
        let configs = vec![ModuleConfig::new("src", "testsrc").with_next("gone")];
        assert!(graph.validate_configs(&configs, &registry).is_err());

        let configs = vec![
            ModuleConfig::new("src", "testsrc").with_next("sink"),
            ModuleConfig::new("sink", "nullsink"),
        ];
        assert!(graph.validate_configs(&configs, &registry).is_ok());

        let configs = vec![
            ModuleConfig::new("a", "passthrough").with_next("b"),
            ModuleConfig::new("b", "passthrough").with_next("a"),
        ];
        assert!(graph.validate_configs(&configs, &registry).is_err());
    }
}
