//! Read-only relationship graph between entity types.
//!
//! Nodes and edges live in flat arenas addressed by index, so cycles such
//! as "A regulates B, B depends on A" carry no ownership.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationLabel {
    Regulates,
    DependsOn,
    Produces,
    Consumes,
    Inhibits,
}

impl fmt::Display for RelationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationLabel::Regulates => "regulates",
            RelationLabel::DependsOn => "dependsOn",
            RelationLabel::Produces => "produces",
            RelationLabel::Consumes => "consumes",
            RelationLabel::Inhibits => "inhibits",
        };
        f.write_str(name)
    }
}

/// A typed edge, by entity type name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub label: RelationLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Edge {
    from: usize,
    to: usize,
    label: RelationLabel,
}

#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    nodes: Vec<String>,
    index: BTreeMap<String, usize>,
    edges: Vec<Edge>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }

    /// Add an edge; duplicates are ignored. Returns whether it was new.
    pub fn add(&mut self, from: &str, to: &str, label: RelationLabel) -> bool {
        let edge = Edge {
            from: self.node(from),
            to: self.node(to),
            label,
        };
        if self.edges.contains(&edge) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn relations(&self) -> impl Iterator<Item = Relation> + '_ {
        self.edges.iter().map(|e| Relation {
            from: self.nodes[e.from].clone(),
            to: self.nodes[e.to].clone(),
            label: e.label,
        })
    }

    /// Targets of edges leaving `from`, optionally filtered by label
    pub fn outgoing(&self, from: &str, label: Option<RelationLabel>) -> Vec<&str> {
        let Some(&i) = self.index.get(from) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.from == i && label.map_or(true, |l| e.label == l))
            .map(|e| self.nodes[e.to].as_str())
            .collect()
    }

    /// Sources of edges entering `to`, optionally filtered by label
    pub fn incoming(&self, to: &str, label: Option<RelationLabel>) -> Vec<&str> {
        let Some(&i) = self.index.get(to) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.to == i && label.map_or(true, |l| e.label == l))
            .map(|e| self.nodes[e.from].as_str())
            .collect()
    }

    /// Whether `to` can be reached from `from` along any edges
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let (Some(&start), Some(&goal)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            if n == goal {
                return true;
            }
            for e in self.edges.iter().filter(|e| e.from == n) {
                if seen.insert(e.to) {
                    queue.push_back(e.to);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_are_fine() {
        let mut graph = RelationGraph::new();
        graph.add("parathyroidCell", "osteoclast", RelationLabel::Regulates);
        graph.add("osteoclast", "bloodCalcium", RelationLabel::Produces);
        graph.add("bloodCalcium", "parathyroidCell", RelationLabel::Inhibits);

        assert!(graph.reaches("osteoclast", "parathyroidCell"));
        assert!(graph.reaches("parathyroidCell", "parathyroidCell"));
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_label_filters() {
        let mut graph = RelationGraph::new();
        graph.add("osteoblast", "collagenFibril", RelationLabel::Produces);
        graph.add("osteoblast", "bloodCalcium", RelationLabel::Consumes);
        assert!(!graph.add("osteoblast", "bloodCalcium", RelationLabel::Consumes));

        assert_eq!(graph.outgoing("osteoblast", None).len(), 2);
        assert_eq!(
            graph.outgoing("osteoblast", Some(RelationLabel::Produces)),
            vec!["collagenFibril"]
        );
        assert_eq!(graph.incoming("bloodCalcium", None), vec!["osteoblast"]);
        assert!(!graph.reaches("bloodCalcium", "osteoblast"));
        assert!(graph.outgoing("unknown", None).is_empty());
    }
}
