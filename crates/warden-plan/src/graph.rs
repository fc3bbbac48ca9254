//! Typed directed relation graphs.
//!
//! A [`RelationGraph`] stores id-to-id edges with attached info payloads.
//! Adjacency lists preserve insertion order, which is what gives
//! propagation its in-order dispatch guarantee. DAG enforcement is a
//! *pre-check*: [`would_cycle`](RelationGraph::would_cycle) runs before
//! any hook fires, so a rejected edge leaves no trace.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use warden_event::RelationFlags;

/// A directed graph between plan objects of one relation kind.
#[derive(Debug, Clone)]
pub struct RelationGraph<Id> {
    flags: RelationFlags,
    children: HashMap<Id, Vec<(Id, Value)>>,
    parents: HashMap<Id, Vec<Id>>,
    edge_count: usize,
}

impl<Id: Clone + Eq + Hash> RelationGraph<Id> {
    /// An empty graph with the given structural flags.
    #[must_use]
    pub fn new(flags: RelationFlags) -> Self {
        Self {
            flags,
            children: HashMap::new(),
            parents: HashMap::new(),
            edge_count: 0,
        }
    }

    /// Structural flags of this relation.
    #[must_use]
    pub fn flags(&self) -> RelationFlags {
        self.flags
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Whether the edge exists.
    #[must_use]
    pub fn has_edge(&self, from: &Id, to: &Id) -> bool {
        self.children
            .get(from)
            .is_some_and(|c| c.iter().any(|(t, _)| t == to))
    }

    /// The edge's info payload.
    #[must_use]
    pub fn edge_info(&self, from: &Id, to: &Id) -> Option<&Value> {
        self.children
            .get(from)?
            .iter()
            .find(|(t, _)| t == to)
            .map(|(_, info)| info)
    }

    /// Whether adding `from -> to` would close a cycle in a DAG
    /// relation. Always `false` for non-DAG relations.
    #[must_use]
    pub fn would_cycle(&self, from: &Id, to: &Id) -> bool {
        if !self.flags.dag {
            return false;
        }
        from == to || self.reaches(to, from)
    }

    /// Whether `to` is reachable from `from` along existing edges.
    #[must_use]
    pub fn reaches(&self, from: &Id, to: &Id) -> bool {
        let mut queue = VecDeque::from([from.clone()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if &current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().map(|(t, _)| t.clone()));
            }
        }
        false
    }

    /// Inserts an edge. Returns `false` without touching anything when
    /// the edge already exists. The caller is responsible for the DAG
    /// pre-check; this is the raw mutation.
    pub fn insert(&mut self, from: Id, to: Id, info: Value) -> bool {
        if self.has_edge(&from, &to) {
            return false;
        }
        self.children
            .entry(from.clone())
            .or_default()
            .push((to.clone(), info));
        self.parents.entry(to).or_default().push(from);
        self.edge_count += 1;
        true
    }

    /// Replaces the info payload of an existing edge. Returns the old
    /// payload, `None` when the edge does not exist.
    pub fn set_info(&mut self, from: &Id, to: &Id, info: Value) -> Option<Value> {
        let slot = self
            .children
            .get_mut(from)?
            .iter_mut()
            .find(|(t, _)| t == to)?;
        Some(std::mem::replace(&mut slot.1, info))
    }

    /// Removes an edge. Returns its info payload, `None` when absent.
    pub fn remove(&mut self, from: &Id, to: &Id) -> Option<Value> {
        let children = self.children.get_mut(from)?;
        let position = children.iter().position(|(t, _)| t == to)?;
        let (_, info) = children.remove(position);
        if let Some(parents) = self.parents.get_mut(to) {
            parents.retain(|p| p != from);
        }
        self.edge_count -= 1;
        Some(info)
    }

    /// Removes a vertex and every edge incident to it. Returns the
    /// removed edges as `(from, to, info)` triples.
    pub fn remove_vertex(&mut self, vertex: &Id) -> Vec<(Id, Id, Value)> {
        let mut removed = Vec::new();
        if let Some(children) = self.children.remove(vertex) {
            for (to, info) in children {
                if let Some(parents) = self.parents.get_mut(&to) {
                    parents.retain(|p| p != vertex);
                }
                removed.push((vertex.clone(), to, info));
            }
        }
        if let Some(parents) = self.parents.remove(vertex) {
            for from in parents {
                if let Some(children) = self.children.get_mut(&from) {
                    if let Some(position) = children.iter().position(|(t, _)| t == vertex) {
                        let (to, info) = children.remove(position);
                        removed.push((from.clone(), to, info));
                    }
                }
            }
        }
        self.edge_count -= removed.len();
        removed
    }

    /// Children of `vertex`, in edge insertion order.
    pub fn children_of<'a>(&'a self, vertex: &Id) -> impl Iterator<Item = (&'a Id, &'a Value)> {
        self.children
            .get(vertex)
            .into_iter()
            .flat_map(|c| c.iter().map(|(t, info)| (t, info)))
    }

    /// Parents of `vertex`, in edge insertion order.
    pub fn parents_of<'a>(&'a self, vertex: &Id) -> impl Iterator<Item = &'a Id> {
        self.parents.get(vertex).into_iter().flatten()
    }

    /// Whether `vertex` has no parent in this relation.
    #[must_use]
    pub fn is_root(&self, vertex: &Id) -> bool {
        self.parents.get(vertex).is_none_or(|p| p.is_empty())
    }

    /// Whether `vertex` has no child in this relation.
    #[must_use]
    pub fn is_leaf(&self, vertex: &Id) -> bool {
        self.children.get(vertex).is_none_or(|c| c.is_empty())
    }

    /// Every edge as `(from, to, info)`. Iteration order is stable per
    /// parent but unspecified across parents.
    pub fn each_edge(&self) -> impl Iterator<Item = (&Id, &Id, &Value)> {
        self.children
            .iter()
            .flat_map(|(from, children)| children.iter().map(move |(to, info)| (from, to, info)))
    }

    /// All vertices reachable from `roots` (roots included).
    #[must_use]
    pub fn descendants(&self, roots: &[Id]) -> HashSet<Id> {
        let mut seen: HashSet<Id> = HashSet::new();
        let mut queue: VecDeque<Id> = roots.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().map(|(t, _)| t.clone()));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dag() -> RelationGraph<u32> {
        RelationGraph::new(RelationFlags::dag())
    }

    #[test]
    fn insert_and_query() {
        let mut g = dag();
        assert!(g.insert(1, 2, Value::Null));
        assert!(g.has_edge(&1, &2));
        assert!(!g.has_edge(&2, &1));
        assert_eq!(g.edge_count(), 1);
        // Duplicate insertion is a no-op
        assert!(!g.insert(1, 2, json!("other")));
        assert_eq!(g.edge_info(&1, &2), Some(&Value::Null));
    }

    #[test]
    fn children_keep_insertion_order() {
        let mut g = dag();
        g.insert(1, 5, Value::Null);
        g.insert(1, 3, Value::Null);
        g.insert(1, 4, Value::Null);
        let children: Vec<u32> = g.children_of(&1).map(|(t, _)| *t).collect();
        assert_eq!(children, vec![5, 3, 4]);
    }

    #[test]
    fn cycle_detection() {
        let mut g = dag();
        g.insert(1, 2, Value::Null);
        g.insert(2, 3, Value::Null);
        assert!(g.would_cycle(&3, &1));
        assert!(g.would_cycle(&1, &1));
        assert!(!g.would_cycle(&1, &3));
    }

    #[test]
    fn non_dag_allows_cycles() {
        let g: RelationGraph<u32> = RelationGraph::new(RelationFlags::default());
        assert!(!g.would_cycle(&1, &1));
    }

    #[test]
    fn remove_edge_returns_info() {
        let mut g = dag();
        g.insert(1, 2, json!({"role": "arm"}));
        assert_eq!(g.remove(&1, &2), Some(json!({"role": "arm"})));
        assert!(!g.has_edge(&1, &2));
        assert_eq!(g.remove(&1, &2), None);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn remove_vertex_drops_incident_edges() {
        let mut g = dag();
        g.insert(1, 2, Value::Null);
        g.insert(2, 3, Value::Null);
        g.insert(4, 2, Value::Null);
        let removed = g.remove_vertex(&2);
        assert_eq!(removed.len(), 3);
        assert_eq!(g.edge_count(), 0);
        assert!(g.is_root(&3));
        assert!(g.is_leaf(&1));
    }

    #[test]
    fn set_info_fires_only_on_existing_edges() {
        let mut g = dag();
        g.insert(1, 2, json!(1));
        assert_eq!(g.set_info(&1, &2, json!(2)), Some(json!(1)));
        assert_eq!(g.edge_info(&1, &2), Some(&json!(2)));
        assert_eq!(g.set_info(&1, &3, json!(9)), None);
    }

    #[test]
    fn descendants_includes_roots() {
        let mut g = dag();
        g.insert(1, 2, Value::Null);
        g.insert(2, 3, Value::Null);
        g.insert(4, 5, Value::Null);
        let d = g.descendants(&[1]);
        assert_eq!(d, HashSet::from([1, 2, 3]));
    }
}
