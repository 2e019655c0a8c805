//! # Street Graph
//!
//! In-memory model of a walkable street network: intersections are nodes, directed street
//! segments are edges. The network is a multigraph, so an edge is named by its endpoints
//! plus a parallel-edge discriminator (`key`).
//!
//! A graph is assembled once, through [`StreetGraphBuilder`] or [`StreetGraph::load`], and
//! is read-only afterwards.
//!
//! ## File Format
//!
//! Graphs are stored as JSON:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": 1, "lat": 55.95, "lon": -3.19 },
//!     { "id": 2, "lat": 55.951, "lon": -3.19 }
//!   ],
//!   "edges": [
//!     { "source": 1, "target": 2, "key": 0, "length": 111.2,
//!       "geometry": [[55.95, -3.19], [55.951, -3.19]] }
//!   ]
//! }
//! ```
//!
//! `key` defaults to 0, `geometry` is optional, and a missing `length` is computed from the
//! geometry (or the straight node-to-node chord).

use crate::geo_utils::polyline_length;
use crate::{CoverageError, GpsPoint, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Opaque node identifier (OSM node ids are signed 64-bit).
pub type NodeId = i64;

/// Identifier of one directed street segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId {
    pub source: NodeId,
    pub target: NodeId,
    /// Parallel-edge discriminator
    pub key: u32,
}

impl EdgeId {
    pub fn new(source: NodeId, target: NodeId, key: u32) -> Self {
        Self { source, target, key }
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.source, self.target, self.key)
    }
}

/// An intersection (or any other vertex of the street network).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub position: GpsPoint,
}

/// A directed street segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    /// Length in meters
    pub length: f64,
    /// Shape of the street from source to target, if known
    pub geometry: Option<Vec<GpsPoint>>,
}

// ============================================================================
// Graph
// ============================================================================

/// The walkable street network.
#[derive(Debug, Clone, Default)]
pub struct StreetGraph {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<EdgeId, Edge>,
    outgoing: HashMap<NodeId, Vec<EdgeId>>,
    incoming: HashMap<NodeId, Vec<EdgeId>>,
}

impl StreetGraph {
    /// Load a graph from a JSON graph document.
    ///
    /// Any failure is a [`CoverageError::GraphLoad`]; a partially valid document never
    /// produces a graph.
    pub fn load(path: &Path) -> Result<Self> {
        let start = std::time::Instant::now();
        let origin = path.display().to_string();

        let file = File::open(path).map_err(|e| CoverageError::GraphLoad {
            origin: origin.clone(),
            reason: e.to_string(),
        })?;
        let document: GraphDocument = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CoverageError::GraphLoad {
                origin: origin.clone(),
                reason: e.to_string(),
            })?;

        let graph = StreetGraphBuilder::from_document(document).build_from(&origin)?;

        info!(
            "[Graph] Loaded {} nodes and {} edges from {} in {}ms",
            graph.node_count(),
            graph.edge_count(),
            origin,
            start.elapsed().as_millis()
        );

        Ok(graph)
    }

    /// Save the graph as a JSON graph document. Edges are written in id order.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::coverage::write_json_atomic(path, &self.to_document())
    }

    fn to_document(&self) -> GraphDocument {
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .values()
            .map(|n| NodeRecord {
                id: n.id,
                lat: n.position.latitude,
                lon: n.position.longitude,
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        let mut edges: Vec<EdgeRecord> = self
            .edges
            .values()
            .map(|e| EdgeRecord {
                source: e.id.source,
                target: e.id.target,
                key: e.id.key,
                length: Some(e.length),
                geometry: e
                    .geometry
                    .as_ref()
                    .map(|g| g.iter().map(|p| [p.latitude, p.longitude]).collect()),
            })
            .collect();
        edges.sort_by_key(|e| (e.source, e.target, e.key));

        GraphDocument { nodes, edges }
    }

    /// Outgoing edges of `node` as `(edge_id, target)`, in insertion order.
    ///
    /// Unknown nodes have no neighbors.
    pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = (EdgeId, NodeId)> + '_ {
        self.outgoing
            .get(&node)
            .into_iter()
            .flatten()
            .map(|id| (*id, id.target))
    }

    /// Incoming edges of `node` as `(edge_id, source)`.
    pub fn predecessors(&self, node: NodeId) -> impl Iterator<Item = (EdgeId, NodeId)> + '_ {
        self.incoming
            .get(&node)
            .into_iter()
            .flatten()
            .map(|id| (*id, id.source))
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Total number of DIRECTED edges.
    ///
    /// A two-way street stored as two opposing edges counts twice. This is the
    /// denominator of [`coverage_ratio`](crate::coverage_ratio), so walking a two-way
    /// street in one direction covers half of it.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Sum of all directed edge lengths in meters.
    pub fn total_length(&self) -> f64 {
        self.edges.values().map(|e| e.length).sum()
    }

    /// True if some edge leads directly from `source` to `target`.
    pub fn has_edge_between(&self, source: NodeId, target: NodeId) -> bool {
        self.neighbors(source).any(|(_, t)| t == target)
    }

    /// The polyline of an edge from source to target: its geometry when present,
    /// otherwise the straight chord between its nodes.
    pub fn edge_geometry(&self, id: &EdgeId) -> Option<Vec<GpsPoint>> {
        let edge = self.edges.get(id)?;
        match &edge.geometry {
            Some(geometry) if geometry.len() >= 2 => Some(geometry.clone()),
            _ => {
                let source = self.nodes.get(&id.source)?;
                let target = self.nodes.get(&id.target)?;
                Some(vec![source.position, target.position])
            }
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`StreetGraph`], validating it on [`build`](StreetGraphBuilder::build).
#[derive(Debug, Default)]
pub struct StreetGraphBuilder {
    nodes: Vec<NodeRecord>,
    edges: Vec<PendingEdge>,
    next_keys: HashMap<(NodeId, NodeId), u32>,
}

#[derive(Debug)]
struct PendingEdge {
    id: EdgeId,
    length: Option<f64>,
    geometry: Option<Vec<GpsPoint>>,
}

impl StreetGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_document(document: GraphDocument) -> Self {
        let mut builder = Self::new();
        builder.nodes = document.nodes;
        for record in document.edges {
            let geometry = record
                .geometry
                .map(|g| g.into_iter().map(|[lat, lon]| GpsPoint::new(lat, lon)).collect());
            builder.push_edge(
                EdgeId::new(record.source, record.target, record.key),
                record.length,
                geometry,
            );
        }
        builder
    }

    /// Add an intersection.
    pub fn add_node(&mut self, id: NodeId, latitude: f64, longitude: f64) -> &mut Self {
        self.nodes.push(NodeRecord {
            id,
            lat: latitude,
            lon: longitude,
        });
        self
    }

    /// Add a directed edge with a known length. The parallel-edge key is assigned
    /// automatically and returned as part of the id.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId, length: f64) -> EdgeId {
        let id = self.next_id(source, target);
        self.push_edge(id, Some(length), None);
        id
    }

    /// Add a directed edge with shape geometry. A `None` length is computed from the
    /// geometry when the graph is built.
    pub fn add_edge_with_geometry(
        &mut self,
        source: NodeId,
        target: NodeId,
        length: Option<f64>,
        geometry: Vec<GpsPoint>,
    ) -> EdgeId {
        let id = self.next_id(source, target);
        self.push_edge(id, length, Some(geometry));
        id
    }

    /// Add a two-way street as a pair of opposing edges. A `None` length is the chord
    /// length between the two nodes.
    pub fn add_street(&mut self, a: NodeId, b: NodeId, length: Option<f64>) -> (EdgeId, EdgeId) {
        let forward = self.next_id(a, b);
        self.push_edge(forward, length, None);
        let backward = self.next_id(b, a);
        self.push_edge(backward, length, None);
        (forward, backward)
    }

    fn next_id(&mut self, source: NodeId, target: NodeId) -> EdgeId {
        let key = self.next_keys.get(&(source, target)).copied().unwrap_or(0);
        EdgeId::new(source, target, key)
    }

    fn push_edge(&mut self, id: EdgeId, length: Option<f64>, geometry: Option<Vec<GpsPoint>>) {
        let next = self.next_keys.entry((id.source, id.target)).or_insert(0);
        *next = (*next).max(id.key.saturating_add(1));
        self.edges.push(PendingEdge { id, length, geometry });
    }

    /// Validate and assemble the graph.
    pub fn build(self) -> Result<StreetGraph> {
        self.build_from("<builder>")
    }

    fn build_from(self, origin: &str) -> Result<StreetGraph> {
        let invalid = |reason: String| CoverageError::GraphLoad {
            origin: origin.to_string(),
            reason,
        };

        let mut nodes: HashMap<NodeId, Node> = HashMap::with_capacity(self.nodes.len());
        for record in self.nodes {
            let position = GpsPoint::new(record.lat, record.lon);
            if !position.is_valid() {
                return Err(invalid(format!(
                    "node {} has invalid coordinates ({}, {})",
                    record.id, record.lat, record.lon
                )));
            }
            if nodes.insert(record.id, Node { id: record.id, position }).is_some() {
                return Err(invalid(format!("duplicate node {}", record.id)));
            }
        }

        let mut edges: HashMap<EdgeId, Edge> = HashMap::with_capacity(self.edges.len());
        let mut outgoing: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
        let mut seen: HashSet<EdgeId> = HashSet::with_capacity(self.edges.len());

        for pending in self.edges {
            let id = pending.id;
            let (Some(source), Some(target)) = (nodes.get(&id.source), nodes.get(&id.target))
            else {
                return Err(invalid(format!("edge {} references an unknown node", id)));
            };
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate edge {}", id)));
            }

            if let Some(geometry) = &pending.geometry {
                if let Some(bad) = geometry.iter().find(|p| !p.is_valid()) {
                    return Err(invalid(format!(
                        "edge {} has invalid geometry point ({}, {})",
                        id, bad.latitude, bad.longitude
                    )));
                }
            }

            let length = match pending.length {
                Some(length) => length,
                None => match &pending.geometry {
                    Some(geometry) if geometry.len() >= 2 => polyline_length(geometry),
                    _ => polyline_length(&[source.position, target.position]),
                },
            };
            if !length.is_finite() || length < 0.0 {
                return Err(invalid(format!("edge {} has invalid length {}", id, length)));
            }

            outgoing.entry(id.source).or_default().push(id);
            incoming.entry(id.target).or_default().push(id);
            edges.insert(
                id,
                Edge {
                    id,
                    length,
                    geometry: pending.geometry,
                },
            );
        }

        Ok(StreetGraph {
            nodes,
            edges,
            outgoing,
            incoming,
        })
    }
}

// ============================================================================
// Serialized Form
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct GraphDocument {
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    source: NodeId,
    target: NodeId,
    #[serde(default)]
    key: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<f64>,
    /// `[lat, lon]` pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    geometry: Option<Vec<[f64; 2]>>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_graph() -> StreetGraph {
        let mut builder = StreetGraphBuilder::new();
        builder
            .add_node(1, 55.9500, -3.1900)
            .add_node(2, 55.9510, -3.1900)
            .add_node(3, 55.9510, -3.1885);
        builder.add_street(1, 2, None);
        builder.add_edge(2, 3, 95.0);
        builder.build().unwrap()
    }

    #[test]
    fn test_edge_count_counts_directions() {
        let graph = sample_graph();
        assert_eq!(graph.node_count(), 3);
        // Two-way street counts twice, plus the one-way edge
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_neighbors_in_insertion_order() {
        let graph = sample_graph();
        let from_two: Vec<(EdgeId, NodeId)> = graph.neighbors(2).collect();
        assert_eq!(
            from_two,
            vec![(EdgeId::new(2, 1, 0), 1), (EdgeId::new(2, 3, 0), 3)]
        );
        assert_eq!(graph.neighbors(42).count(), 0);
        assert_eq!(graph.predecessors(1).collect::<Vec<_>>(), vec![(EdgeId::new(2, 1, 0), 2)]);
    }

    #[test]
    fn test_street_length_from_chord() {
        let graph = sample_graph();
        let edge = graph.edge(&EdgeId::new(1, 2, 0)).unwrap();
        // 0.001 degrees of latitude
        assert!((edge.length - 111.2).abs() < 1.0);
        assert!(graph.has_edge_between(1, 2));
        assert!(!graph.has_edge_between(3, 2));
    }

    #[test]
    fn test_parallel_edges_get_distinct_keys() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.95, -3.19).add_node(2, 55.951, -3.19);
        let main = builder.add_edge(1, 2, 111.0);
        let service = builder.add_edge(1, 2, 130.0);
        assert_eq!(main, EdgeId::new(1, 2, 0));
        assert_eq!(service, EdgeId::new(1, 2, 1));

        let graph = builder.build().unwrap();
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.neighbors(1).count(), 2);
    }

    #[test]
    fn test_geometry_length_and_polyline() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.950, -3.19).add_node(2, 55.951, -3.19);
        let bend = vec![
            GpsPoint::new(55.950, -3.19),
            GpsPoint::new(55.9505, -3.1890),
            GpsPoint::new(55.951, -3.19),
        ];
        let id = builder.add_edge_with_geometry(1, 2, None, bend.clone());
        let graph = builder.build().unwrap();

        let edge = graph.edge(&id).unwrap();
        assert!(edge.length > 111.2);
        assert_eq!(graph.edge_geometry(&id).unwrap(), bend);
    }

    #[test]
    fn test_rejects_unknown_node() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.95, -3.19);
        builder.add_edge(1, 99, 10.0);
        assert!(matches!(builder.build(), Err(CoverageError::GraphLoad { .. })));
    }

    #[test]
    fn test_rejects_negative_length() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.95, -3.19).add_node(2, 55.951, -3.19);
        builder.add_edge(1, 2, -5.0);
        assert!(matches!(builder.build(), Err(CoverageError::GraphLoad { .. })));
    }

    #[test]
    fn test_rejects_duplicate_node() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.95, -3.19).add_node(1, 55.951, -3.19);
        assert!(matches!(builder.build(), Err(CoverageError::GraphLoad { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let graph = sample_graph();
        graph.save(&path).unwrap();
        let loaded = StreetGraph::load(&path).unwrap();

        assert_eq!(loaded.node_count(), graph.node_count());
        assert_eq!(loaded.edge_count(), graph.edge_count());
        for edge in graph.edges() {
            let reloaded = loaded.edge(&edge.id).unwrap();
            assert!((reloaded.length - edge.length).abs() < 1e-6);
        }
        assert_eq!(loaded.neighbors(2).count(), 2);
    }

    #[test]
    fn test_load_document_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{"nodes": [{{"id": 1, "lat": 55.95, "lon": -3.19}},
                           {{"id": 2, "lat": 55.951, "lon": -3.19}}],
                "edges": [{{"source": 1, "target": 2}},
                          {{"source": 1, "target": 2, "key": 3, "length": 150.0}}]}}"#
        )
        .unwrap();

        let graph = StreetGraph::load(&path).unwrap();
        assert_eq!(graph.edge_count(), 2);
        assert!((graph.edge(&EdgeId::new(1, 2, 0)).unwrap().length - 111.2).abs() < 1.0);
        assert_eq!(graph.edge(&EdgeId::new(1, 2, 3)).unwrap().length, 150.0);
    }

    #[test]
    fn test_load_missing_or_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            StreetGraph::load(&missing),
            Err(CoverageError::GraphLoad { .. })
        ));

        let malformed = dir.path().join("bad.json");
        std::fs::write(&malformed, "{ not json").unwrap();
        assert!(matches!(
            StreetGraph::load(&malformed),
            Err(CoverageError::GraphLoad { .. })
        ));
    }
}
