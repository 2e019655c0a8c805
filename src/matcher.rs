//! # Spatial Matcher
//!
//! Resolves GPS points to the street they lie on.
//!
//! ## Algorithm
//! 1. Project every edge polyline (its shape geometry, or the node-to-node chord) into a
//!    local planar frame in meters
//! 2. Bulk-load the edge envelopes into an R-tree
//! 3. For each query point, walk the R-tree in order of envelope distance; the exact
//!    point-to-polyline distance decides the winner, so a long diagonal street whose box
//!    covers the point never beats the street the point is actually on
//! 4. Equal distances resolve to the smallest [`EdgeId`], keeping matching deterministic
//!
//! Matching is read-only: the graph and index are never mutated, so the same trace always
//! matches the same edges and traces can be matched in parallel.

use crate::geo_utils::{line_distance_2, LocalProjection};
use crate::graph::{EdgeId, NodeId, StreetGraph};
use crate::{Bounds, CoverageError, GpsPoint, Result};
use geo::LineString;
use log::{debug, info, warn};
use rstar::primitives::GeomWithData;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Distances closer than this (squared meters) are treated as ties.
const TIE_EPSILON_2: f64 = 1e-9;

/// Configuration for trace matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Points farther than this from every street (meters) are left unmatched.
    /// `None` always matches the closest street, however far away it is.
    /// Default: None
    pub max_match_distance: Option<f64>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_match_distance: None,
        }
    }
}

/// Result of matching one trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceMatch {
    /// Deduplicated edges the trace touched
    pub edges: HashSet<EdgeId>,
    /// Points that resolved to an edge
    pub matched_points: usize,
    /// Points that were invalid or too far from any street
    pub unmatched_points: usize,
}

// =============================================================================
// R-tree Entries
// =============================================================================

/// An edge polyline in projected meters.
#[derive(Debug, Clone)]
struct IndexedEdge {
    id: EdgeId,
    line: LineString<f64>,
    envelope: AABB<[f64; 2]>,
}

impl IndexedEdge {
    fn new(id: EdgeId, line: LineString<f64>) -> Option<Self> {
        let mut coords = line.coords();
        let first = coords.next()?;
        let (mut min, mut max) = ([first.x, first.y], [first.x, first.y]);
        for c in coords {
            min = [min[0].min(c.x), min[1].min(c.y)];
            max = [max[0].max(c.x), max[1].max(c.y)];
        }
        Some(Self {
            id,
            line,
            envelope: AABB::from_corners(min, max),
        })
    }
}

impl RTreeObject for IndexedEdge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl PointDistance for IndexedEdge {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        line_distance_2(&self.line, *point)
    }
}

type IndexedNode = GeomWithData<[f64; 2], NodeId>;

// =============================================================================
// Spatial Index
// =============================================================================

/// Bounding-box index over the edges and nodes of a [`StreetGraph`].
///
/// Built once from an immutable graph; rebuild it if the graph changes.
#[derive(Clone)]
pub struct SpatialIndex {
    projection: LocalProjection,
    bounds: Option<Bounds>,
    edges: RTree<IndexedEdge>,
    nodes: RTree<IndexedNode>,
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("projection", &self.projection)
            .field("bounds", &self.bounds)
            .field("edges", &self.edges.size())
            .field("nodes", &self.nodes.size())
            .finish()
    }
}

impl SpatialIndex {
    /// Build the index. A graph with no edges produces an empty (but usable) index.
    pub fn build(graph: &StreetGraph) -> Self {
        let start = std::time::Instant::now();

        let bounds = Bounds::from_points(graph.nodes().map(|n| &n.position));
        let ref_lat = bounds.map(|b| b.center().latitude).unwrap_or(0.0);
        let projection = LocalProjection::new(ref_lat);

        let indexed_edges: Vec<IndexedEdge> = graph
            .edges()
            .filter_map(|edge| {
                let polyline = graph.edge_geometry(&edge.id)?;
                IndexedEdge::new(edge.id, projection.project_line(&polyline))
            })
            .collect();

        let indexed_nodes: Vec<IndexedNode> = graph
            .nodes()
            .map(|n| GeomWithData::new(projection.project(&n.position), n.id))
            .collect();

        let index = Self {
            projection,
            bounds,
            edges: RTree::bulk_load(indexed_edges),
            nodes: RTree::bulk_load(indexed_nodes),
        };

        if index.is_empty() {
            warn!("[Matcher] Built an empty spatial index; no point will match");
        } else {
            info!(
                "[Matcher] Indexed {} edges and {} nodes in {}ms",
                index.edge_count(),
                index.nodes.size(),
                start.elapsed().as_millis()
            );
        }

        index
    }

    /// True when the index holds no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.size() == 0
    }

    /// Number of indexed edges.
    pub fn edge_count(&self) -> usize {
        self.edges.size()
    }

    /// Bounding box of the graph's nodes, if it has any.
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Fails with [`CoverageError::EmptyGraph`] when there is nothing to match against.
    pub fn ensure_not_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CoverageError::EmptyGraph);
        }
        Ok(())
    }

    /// Nearest edge to `point` together with its distance in meters.
    pub fn nearest_edge_with_distance(&self, point: &GpsPoint) -> Result<(EdgeId, f64)> {
        if !point.is_valid() {
            return Err(CoverageError::NoMatch);
        }
        let query = self.projection.project(point);

        let mut candidates = self.edges.nearest_neighbor_iter_with_distance_2(&query);
        let (first, best_d2) = candidates.next().ok_or(CoverageError::NoMatch)?;

        let mut best = first.id;
        for (candidate, d2) in candidates {
            if d2 > best_d2 + TIE_EPSILON_2 {
                break;
            }
            best = best.min(candidate.id);
        }

        Ok((best, best_d2.sqrt()))
    }

    /// Nearest edge to `point`, honoring `config.max_match_distance`.
    pub fn nearest_edge_with(&self, point: &GpsPoint, config: &MatchConfig) -> Result<EdgeId> {
        let (edge, distance) = self.nearest_edge_with_distance(point)?;
        match config.max_match_distance {
            Some(limit) if distance > limit => Err(CoverageError::NoMatch),
            _ => Ok(edge),
        }
    }

    /// Nearest node to `point`.
    pub fn nearest_node(&self, point: &GpsPoint) -> Result<NodeId> {
        if !point.is_valid() {
            return Err(CoverageError::NoMatch);
        }
        let query = self.projection.project(point);

        let mut candidates = self.nodes.nearest_neighbor_iter_with_distance_2(&query);
        let (first, best_d2) = candidates.next().ok_or(CoverageError::NoMatch)?;

        let mut best = first.data;
        for (candidate, d2) in candidates {
            if d2 > best_d2 + TIE_EPSILON_2 {
                break;
            }
            best = best.min(candidate.data);
        }

        Ok(best)
    }

    /// Match every point of a trace, collecting the distinct edges it touched.
    pub fn match_points(&self, points: &[GpsPoint], config: &MatchConfig) -> TraceMatch {
        let mut result = TraceMatch::default();

        for point in points {
            match self.nearest_edge_with(point, config) {
                Ok(edge) => {
                    result.edges.insert(edge);
                    result.matched_points += 1;
                }
                Err(_) => {
                    debug!(
                        "[Matcher] No street for point ({}, {})",
                        point.latitude, point.longitude
                    );
                    result.unmatched_points += 1;
                }
            }
        }

        result
    }
}

// =============================================================================
// Core Functions
// =============================================================================

/// Closest edge to `point` by true distance to the street's polyline.
///
/// Returns [`CoverageError::NoMatch`] if the index is empty or the point is invalid.
pub fn nearest_edge(index: &SpatialIndex, point: &GpsPoint) -> Result<EdgeId> {
    index.nearest_edge_with(point, &MatchConfig::default())
}

/// Closest graph node to `point`.
///
/// Returns [`CoverageError::NoMatch`] if the graph has no nodes or the point is invalid.
pub fn nearest_node(index: &SpatialIndex, point: &GpsPoint) -> Result<NodeId> {
    index.nearest_node(point)
}

/// Match a trace to the set of edges it touched.
///
/// Points that can't be matched contribute nothing. An empty trace matches nothing.
///
/// # Example
/// ```
/// use street_coverage::{match_trace, SpatialIndex, StreetGraphBuilder};
///
/// let mut builder = StreetGraphBuilder::new();
/// builder.add_node(1, 55.950, -3.19).add_node(2, 55.951, -3.19);
/// builder.add_edge(1, 2, 111.0);
/// let graph = builder.build().unwrap();
/// let index = SpatialIndex::build(&graph);
///
/// assert!(match_trace(&[], &index).is_empty());
/// ```
pub fn match_trace(points: &[GpsPoint], index: &SpatialIndex) -> HashSet<EdgeId> {
    index.match_points(points, &MatchConfig::default()).edges
}

/// Match a trace, keeping per-point counts.
pub fn match_trace_with_config(
    points: &[GpsPoint],
    index: &SpatialIndex,
    config: &MatchConfig,
) -> TraceMatch {
    index.match_points(points, config)
}

/// Match many independent traces against the same index in parallel.
#[cfg(feature = "parallel")]
pub fn match_traces_parallel(
    traces: &[Vec<GpsPoint>],
    index: &SpatialIndex,
    config: &MatchConfig,
) -> Vec<TraceMatch> {
    use rayon::prelude::*;

    traces
        .par_iter()
        .map(|points| index.match_points(points, config))
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
