use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::license::BuildTarget;

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub rank: u32,
    /// Declaration order, used to break rank ties.
    pub seq: usize,
    pub after: Vec<String>,
}

/// Prerequisite graph over the active build targets.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: BTreeMap<String, Node>,
}

impl BuildGraph {
    pub fn add(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::msg(format!("duplicate build target '{}'", node.id)));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn from_targets(targets: &[BuildTarget]) -> Result<Self> {
        let mut graph = Self::default();
        for (seq, t) in targets.iter().enumerate() {
            let dep = &t.dependency;
            graph.add(Node {
                id: dep.name.to_string(),
                label: format!("{} {}", dep.name, t.pin.git_ref),
                rank: dep.rank,
                seq,
                after: dep.requires.iter().map(|r| r.to_string()).collect(),
            })?;
        }
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for dep in &node.after {
                if !self.nodes.contains_key(dep) {
                    return Err(Error::msg(format!(
                        "target '{}' requires '{dep}', which is not in the build graph",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Reverse edges: prerequisite -> targets waiting on it.
    pub fn dependents(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut out: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in self.nodes.values() {
            out.entry(node.id.as_str()).or_default();
            for dep in &node.after {
                out.entry(dep.as_str()).or_default().push(node.id.as_str());
            }
        }
        out
    }

    /// Topological order; among ready nodes, lowest (rank, declaration) first.
    pub fn ordered(&self) -> Result<Vec<&Node>> {
        let mut incoming: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.after.len()))
            .collect();
        let dependents = self.dependents();

        let mut ready: BTreeSet<(u32, usize, &str)> = self
            .nodes
            .values()
            .filter(|n| n.after.is_empty())
            .map(|n| (n.rank, n.seq, n.id.as_str()))
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());

        while let Some(key) = ready.pop_first() {
            let id = key.2;
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push(node);
            for &child in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                let Some(slot) = incoming.get_mut(child) else {
                    continue;
                };
                *slot -= 1;
                if *slot == 0
                    && let Some(c) = self.nodes.get(child)
                {
                    ready.insert((c.rank, c.seq, c.id.as_str()));
                }
            }
        }

        if out.len() != self.nodes.len() {
            let placed: BTreeSet<&str> = out.iter().map(|n| n.id.as_str()).collect();
            let remaining: Vec<&str> = self
                .nodes
                .keys()
                .map(String::as_str)
                .filter(|id| !placed.contains(id))
                .collect();
            return Err(Error::msg(format!(
                "build graph contains a cycle; remaining targets: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// GraphViz rendering; the consumer, when given, hangs off every target.
    pub fn to_dot(&self, consumer: Option<&str>) -> Result<String> {
        let ordered = self.ordered()?;
        let mut out = String::from("digraph build {\n  rankdir=LR;\n");
        for node in &ordered {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\nrank {}\"];\n",
                node.id, node.label, node.rank
            ));
        }
        for node in &ordered {
            for dep in &node.after {
                out.push_str(&format!("  \"{dep}\" -> \"{}\";\n", node.id));
            }
        }
        if let Some(consumer) = consumer {
            out.push_str(&format!("  \"{consumer}\" [shape=box];\n"));
            for node in &ordered {
                out.push_str(&format!("  \"{}\" -> \"{consumer}\";\n", node.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, rank: u32, seq: usize, after: &[&str]) -> Node {
        Node {
            id: id.into(),
            label: id.into(),
            rank,
            seq,
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_prerequisite_then_rank_then_declaration() {
        let mut g = BuildGraph::default();
        g.add(node("opus", 0, 0, &[])).expect("add");
        g.add(node("libvorbis", 1, 1, &["libogg"])).expect("add");
        g.add(node("libogg", 0, 2, &[])).expect("add");
        g.add(node("aom", 0, 3, &[])).expect("add");
        let ids: Vec<_> = g.ordered().expect("order").iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["opus", "libogg", "aom", "libvorbis"]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut g = BuildGraph::default();
        g.add(node("a", 0, 0, &["b"])).expect("add");
        g.add(node("b", 0, 1, &["a"])).expect("add");
        let err = g.ordered().expect_err("cycle");
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut g = BuildGraph::default();
        g.add(node("a", 0, 0, &[])).expect("add");
        assert!(g.add(node("a", 0, 1, &[])).is_err());
    }

    #[test]
    fn dot_includes_edges_and_consumer() {
        let mut g = BuildGraph::default();
        g.add(node("libogg", 0, 0, &[])).expect("add");
        g.add(node("libvorbis", 1, 1, &["libogg"])).expect("add");
        let dot = g.to_dot(Some("ffmpeg")).expect("dot");
        assert!(dot.contains("\"libogg\" -> \"libvorbis\";"));
        assert!(dot.contains("\"libvorbis\" -> \"ffmpeg\";"));
    }
}
