//! The directed dependency multigraph and its depth-first iterator.
//!
//! Vertices carry neighbour *ids* (strings), not references, so cloning a
//! graph and removing vertices are straightforward and no reference cycles
//! can form; lookups are by name. Out-neighbours are the vertices this
//! vertex requires (its dependencies), in-neighbours the vertices requiring
//! it. An edge may appear more than once between the same pair; removal
//! takes one copy per call from both sides.

use std::collections::BTreeMap;
use std::collections::HashMap;

use smallvec::SmallVec;

/// A vertex: a unique id, a weight, and ordered neighbour id lists.
///
/// The weight counts the dependents that will consume this vertex's result
/// by value; the scheduler consults it to decide whether a result's buffers
/// may be moved or must be copied on dispatch.
#[derive(Clone, Debug)]
pub struct Vertex {
    id: String,
    weight: usize,
    out: SmallVec<[String; 4]>,
    inn: SmallVec<[String; 4]>,
}

impl Vertex {
    fn new(id: &str) -> Self {
        Vertex {
            id: id.to_owned(),
            weight: 0,
            out: SmallVec::new(),
            inn: SmallVec::new(),
        }
    }

    /// The vertex id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The number of by-value consumers of this vertex's result.
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Increments the by-value consumer count.
    pub fn bump_weight(&mut self) {
        self.weight += 1;
    }

    /// The ordered dependencies of this vertex.
    pub fn out_neighbours(&self) -> &[String] {
        &self.out
    }

    /// The ordered dependents of this vertex.
    pub fn in_neighbours(&self) -> &[String] {
        &self.inn
    }
}

/// A directed multigraph over string-identified vertices.
///
/// Invariants: every id in a neighbour list names an existing vertex, and
/// the in/out lists are mutually consistent (each out-edge `u → v` has a
/// matching in-edge entry on `v`, counted per copy). `Clone` deep-copies the
/// vertices and their neighbour lists.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    vertices: BTreeMap<String, Vertex>,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Graph::default()
    }

    /// Adds a vertex; false if the id is already present.
    pub fn add_vertex(&mut self, id: &str) -> bool {
        if self.vertices.contains_key(id) {
            return false;
        }
        self.vertices.insert(id.to_owned(), Vertex::new(id));
        true
    }

    /// Removes a vertex and every edge incident to it.
    pub fn remove_vertex(&mut self, id: &str) -> bool {
        if self.vertices.remove(id).is_none() {
            return false;
        }
        for vertex in self.vertices.values_mut() {
            vertex.out.retain(|neighbour| neighbour != id);
            vertex.inn.retain(|neighbour| neighbour != id);
        }
        true
    }

    /// Adds one copy of the edge `from → to`; false when either end is
    /// missing. Multi-edges are permitted.
    pub fn add_edge(&mut self, from: &str, to: &str) -> bool {
        if !self.vertices.contains_key(from) || !self.vertices.contains_key(to) {
            return false;
        }
        self.vertices
            .get_mut(from)
            .expect("endpoint checked above")
            .out
            .push(to.to_owned());
        self.vertices
            .get_mut(to)
            .expect("endpoint checked above")
            .inn
            .push(from.to_owned());
        true
    }

    /// Removes one copy of the edge `from → to` from both sides; false when
    /// no such edge exists.
    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let Some(position) = self
            .vertices
            .get(from)
            .and_then(|vertex| vertex.out.iter().position(|neighbour| neighbour == to))
        else {
            return false;
        };
        self.vertices
            .get_mut(from)
            .expect("endpoint exists")
            .out
            .remove(position);
        let vertex = self.vertices.get_mut(to).expect("edge endpoints exist");
        if let Some(position) = vertex.inn.iter().position(|neighbour| neighbour == from) {
            vertex.inn.remove(position);
        }
        true
    }

    /// True when a vertex with this id exists.
    pub fn has_vertex(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    /// True when at least one copy of `from → to` exists.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.vertices
            .get(from)
            .is_some_and(|vertex| vertex.out.iter().any(|neighbour| neighbour == to))
    }

    /// The vertex with this id, if present.
    pub fn get(&self, id: &str) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    /// The vertex with this id, mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Vertex> {
        self.vertices.get_mut(id)
    }

    /// The number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// True when the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// The vertex ids, in deterministic (sorted) order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    /// Vertices with no in-edges.
    pub fn roots(&self) -> Vec<&str> {
        self.vertices
            .values()
            .filter(|vertex| vertex.inn.is_empty())
            .map(|vertex| vertex.id())
            .collect()
    }

    /// Vertices with no out-edges.
    pub fn leaves(&self) -> Vec<&str> {
        self.vertices
            .values()
            .filter(|vertex| vertex.out.is_empty())
            .map(|vertex| vertex.id())
            .collect()
    }

    /// True when a depth-first traversal of the whole graph classifies some
    /// edge as a back edge.
    pub fn has_cycle(&self) -> bool {
        self.find_back_edge().is_some()
    }

    /// The first back edge `(from, to)` found in a full-graph traversal.
    pub fn find_back_edge(&self) -> Option<(String, String)> {
        let mut dfs = Dfs::empty(self);
        let ids: Vec<String> = self.vertices.keys().cloned().collect();
        for id in ids {
            if !dfs.restart(&id) {
                continue;
            }
            while let Some(visit) = dfs.next() {
                if visit.edge == Some(EdgeKind::Back) {
                    // The source is still on top of the stack: a back edge
                    // does not push its destination.
                    let from = dfs.current().unwrap_or(&id).to_owned();
                    return Some((from, visit.id));
                }
            }
        }
        None
    }
}

/// The classification of a traversed edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// The destination was white: first discovery.
    Tree,
    /// The destination is gray (on the traversal stack): a cycle.
    Back,
    /// The destination is already black.
    ForwardOrCross,
}

/// One step of a depth-first traversal: the vertex touched, and how the
/// edge leading to it was classified (`None` for a traversal start).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Visit {
    /// The vertex just touched.
    pub id: String,
    /// The classification of the edge traversed to reach it.
    pub edge: Option<EdgeKind>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    Gray,
    Black,
}

struct Frame {
    id: String,
    child: usize,
}

/// A three-coloured depth-first iterator.
///
/// [`next`](Dfs::next) returns the next vertex touched, or `None` when the
/// component reachable from the start is exhausted; vertices whose outgoing
/// edges are spent are popped and blackened silently. To cover the whole
/// graph, [`restart`](Dfs::restart) on each remaining white vertex; colours
/// persist across restarts.
pub struct Dfs<'a> {
    graph: &'a Graph,
    colour: HashMap<String, Colour>,
    stack: Vec<Frame>,
    pending: Option<Visit>,
}

impl<'a> Dfs<'a> {
    /// A traversal of the component reachable from `start`.
    pub fn new(graph: &'a Graph, start: &str) -> Self {
        let mut dfs = Dfs::empty(graph);
        dfs.restart(start);
        dfs
    }

    /// A traversal with no start vertex yet.
    pub fn empty(graph: &'a Graph) -> Self {
        Dfs {
            graph,
            colour: HashMap::new(),
            stack: Vec::new(),
            pending: None,
        }
    }

    /// True when `id` has not been touched by this traversal.
    pub fn is_white(&self, id: &str) -> bool {
        !self.colour.contains_key(id)
    }

    /// The vertex whose out-edges are currently being explored.
    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(|frame| frame.id.as_str())
    }

    /// Begins a traversal at `start`, keeping the colours of earlier runs.
    ///
    /// False when `start` is missing or already discovered.
    pub fn restart(&mut self, start: &str) -> bool {
        if !self.graph.has_vertex(start) || !self.is_white(start) {
            return false;
        }
        self.colour.insert(start.to_owned(), Colour::Gray);
        self.stack.push(Frame { id: start.to_owned(), child: 0 });
        self.pending = Some(Visit { id: start.to_owned(), edge: None });
        true
    }

    /// The next vertex touched, with the classification of the edge just
    /// traversed, or `None` when the traversal is exhausted.
    pub fn next(&mut self) -> Option<Visit> {
        if let Some(visit) = self.pending.take() {
            return Some(visit);
        }
        loop {
            let step = {
                let frame = self.stack.last_mut()?;
                match self.graph.get(&frame.id) {
                    Some(vertex) if frame.child < vertex.out_neighbours().len() => {
                        let destination = vertex.out_neighbours()[frame.child].clone();
                        frame.child += 1;
                        Some(destination)
                    }
                    _ => None,
                }
            };
            match step {
                Some(destination) => match self.colour.get(destination.as_str()) {
                    None => {
                        self.colour.insert(destination.clone(), Colour::Gray);
                        self.stack.push(Frame { id: destination.clone(), child: 0 });
                        return Some(Visit { id: destination, edge: Some(EdgeKind::Tree) });
                    }
                    Some(Colour::Gray) => {
                        return Some(Visit { id: destination, edge: Some(EdgeKind::Back) });
                    }
                    Some(Colour::Black) => {
                        return Some(Visit { id: destination, edge: Some(EdgeKind::ForwardOrCross) });
                    }
                },
                None => {
                    let frame = self.stack.pop().expect("the stack was just non-empty");
                    self.colour.insert(frame.id, Colour::Black);
                }
            }
        }
    }
}

impl Iterator for Dfs<'_> {
    type Item = Visit;
    fn next(&mut self) -> Option<Visit> {
        Dfs::next(self)
    }
}

#[cfg(test)]
mod tests {

    use super::{Dfs, EdgeKind, Graph};

    fn diamond() -> Graph {
        // a depends on b and c, which both depend on d.
        let mut graph = Graph::new();
        for id in ["a", "b", "c", "d"] {
            graph.add_vertex(id);
        }
        graph.add_edge("a", "b");
        graph.add_edge("a", "c");
        graph.add_edge("b", "d");
        graph.add_edge("c", "d");
        graph
    }

    #[test]
    fn single_vertex_is_root_and_leaf() {
        let mut graph = Graph::new();
        graph.add_vertex("only");
        assert_eq!(graph.roots(), vec!["only"]);
        assert_eq!(graph.leaves(), vec!["only"]);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn neighbour_lists_stay_consistent() {
        let mut graph = diamond();
        assert!(graph.has_edge("a", "b"));
        assert_eq!(graph.get("d").unwrap().in_neighbours().len(), 2);

        graph.remove_vertex("b");
        assert!(!graph.has_vertex("b"));
        assert!(!graph.has_edge("a", "b"));
        assert_eq!(graph.get("d").unwrap().in_neighbours(), &["c".to_owned()]);
        for id in ["a", "c", "d"] {
            let vertex = graph.get(id).unwrap();
            for neighbour in vertex.out_neighbours().iter().chain(vertex.in_neighbours()) {
                assert!(graph.has_vertex(neighbour));
            }
        }
    }

    #[test]
    fn multi_edges_are_counted() {
        let mut graph = Graph::new();
        graph.add_vertex("u");
        graph.add_vertex("v");
        graph.add_edge("u", "v");
        graph.add_edge("u", "v");
        assert_eq!(graph.get("u").unwrap().out_neighbours().len(), 2);

        assert!(graph.remove_edge("u", "v"));
        assert!(graph.has_edge("u", "v"));
        assert_eq!(graph.get("v").unwrap().in_neighbours().len(), 1);

        assert!(graph.remove_edge("u", "v"));
        assert!(!graph.has_edge("u", "v"));
        assert!(!graph.remove_edge("u", "v"));
    }

    #[test]
    fn roots_and_leaves_of_a_diamond() {
        let graph = diamond();
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.leaves(), vec!["d"]);
    }

    #[test]
    fn clones_are_independent() {
        let graph = diamond();
        let mut copy = graph.clone();
        copy.remove_vertex("d");
        assert!(graph.has_vertex("d"));
        assert_eq!(graph.get("b").unwrap().out_neighbours().len(), 1);
    }

    #[test]
    fn dfs_classifies_tree_and_cross_edges() {
        let graph = diamond();
        let kinds: Vec<_> = Dfs::new(&graph, "a").map(|visit| (visit.id, visit.edge)).collect();
        assert_eq!(kinds.len(), 5, "four vertices, one revisit of the shared sink");
        assert_eq!(kinds[0], ("a".to_owned(), None));
        let revisits = kinds
            .iter()
            .filter(|(_, edge)| *edge == Some(EdgeKind::ForwardOrCross))
            .count();
        assert_eq!(revisits, 1);
        assert!(kinds.iter().all(|(_, edge)| *edge != Some(EdgeKind::Back)));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = Graph::new();
        graph.add_vertex("solo");
        graph.add_edge("solo", "solo");
        assert!(graph.has_cycle());
    }

    #[test]
    fn two_cycle_is_found_from_any_start() {
        let mut graph = Graph::new();
        graph.add_vertex("x");
        graph.add_vertex("y");
        graph.add_edge("x", "y");
        graph.add_edge("y", "x");
        assert!(graph.has_cycle());
        let (from, to) = graph.find_back_edge().expect("a back edge");
        assert_ne!(from, to);
    }

    #[test]
    fn acyclic_graphs_have_no_back_edge() {
        assert_eq!(diamond().find_back_edge(), None);
    }

    #[test]
    fn restart_covers_disconnected_components() {
        let mut graph = Graph::new();
        for id in ["m", "n"] {
            graph.add_vertex(id);
        }
        let mut dfs = Dfs::empty(&graph);
        assert!(dfs.restart("m"));
        assert!(dfs.next().is_some());
        assert!(dfs.next().is_none());
        assert!(dfs.restart("n"));
        assert!(!dfs.restart("m"), "already black");
        assert_eq!(dfs.next().expect("start visit").id, "n");
    }
}
