//! # Route Generator
//!
//! Plans a walk of bounded length that favours streets not yet in the visited set.
//!
//! ## Algorithm
//! 1. Snap the start coordinate to the nearest graph node
//! 2. At each node, shuffle the outgoing edges with the caller's RNG
//! 3. Take the first edge that is unvisited, not yet walked in this route, and fits the
//!    remaining budget
//! 4. Otherwise fall back to any edge that fits, preferring ones not walked in this route.
//!    A zero-length edge is never taken twice, so every repeat consumes budget
//! 5. When nothing fits the generator is stuck and the plan is done
//!
//! [`RouteMode::Loop`] additionally keeps every step within reach of the start: it
//! precomputes the shortest way back from each node, only takes an edge if the way back
//! from its target still fits, and appends that way back once exploring stops.
//!
//! Generation is a simulation: the visited set is read, never written. Call
//! [`RoutePlan::commit`] (or use [`RouteGenerator::generate_and_commit`]) to record the walk.

use crate::coverage::VisitedSet;
use crate::graph::{EdgeId, NodeId, StreetGraph};
use crate::matcher::SpatialIndex;
use crate::{CoverageError, GpsPoint, Result};
use log::{debug, info, warn};
use pathfinding::prelude::dijkstra_all;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where the generator is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Still choosing edges
    Exploring,
    /// No outgoing edge fits the remaining budget
    Stuck,
    /// The plan is final
    Done,
}

/// Shape of the generated walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Walk until the budget runs out, ending wherever that is.
    #[default]
    Open,
    /// Return to the start node within the budget.
    Loop,
}

/// Configuration for route generation.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    /// Maximum route length in meters.
    /// Default: 5000
    pub budget_meters: f64,
    /// Open walk or closed loop.
    /// Default: Open
    pub mode: RouteMode,
    /// Upper bound on the number of edges chosen, regardless of budget.
    /// Default: 100000
    pub max_steps: u32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            budget_meters: 5000.0,
            mode: RouteMode::Open,
            max_steps: 100_000,
        }
    }
}

impl RouteConfig {
    /// Default configuration with a different budget.
    pub fn with_budget(budget_meters: f64) -> Self {
        Self {
            budget_meters,
            ..Self::default()
        }
    }
}

/// A generated walk.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    /// Node the walk starts from
    pub start: NodeId,
    /// Visited nodes in order, starting with `start`
    pub nodes: Vec<NodeId>,
    /// Traversed edges in order; `edges[i]` leads from `nodes[i]` to `nodes[i + 1]`
    pub edges: Vec<EdgeId>,
    /// Sum of traversed edge lengths in meters
    pub distance_meters: f64,
    /// Traversed edges that were not in the visited set when the plan was made
    pub newly_covered: HashSet<EdgeId>,
    pub state: GeneratorState,
}

impl RoutePlan {
    /// Merge the walked edges into `visited`, returning how many were new.
    pub fn commit(&self, visited: &mut VisitedSet) -> usize {
        visited.merge(self.edges.iter().copied())
    }

    /// Number of traversed edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Coordinates of the walk, following each street's shape where known.
    pub fn points(&self, graph: &StreetGraph) -> Vec<GpsPoint> {
        if self.edges.is_empty() {
            return graph
                .node(self.start)
                .map(|n| vec![n.position])
                .unwrap_or_default();
        }

        let mut points: Vec<GpsPoint> = Vec::new();
        for edge in &self.edges {
            let Some(geometry) = graph.edge_geometry(edge) else {
                continue;
            };
            // Consecutive edges share their joining node
            let skip = usize::from(!points.is_empty());
            points.extend(geometry.into_iter().skip(skip));
        }
        points
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Greedy coverage-seeking walk planner over a read-only graph.
pub struct RouteGenerator<'a> {
    graph: &'a StreetGraph,
    index: &'a SpatialIndex,
    config: RouteConfig,
}

/// Progress of one generation run.
struct Walk {
    current: NodeId,
    nodes: Vec<NodeId>,
    edges: Vec<EdgeId>,
    walked: HashSet<EdgeId>,
    distance: f64,
}

impl Walk {
    fn new(start: NodeId) -> Self {
        Self {
            current: start,
            nodes: vec![start],
            edges: Vec::new(),
            walked: HashSet::new(),
            distance: 0.0,
        }
    }

    fn push(&mut self, edge: EdgeId, length: f64) {
        self.current = edge.target;
        self.nodes.push(edge.target);
        self.edges.push(edge);
        self.walked.insert(edge);
        self.distance += length;
    }
}

/// Shortest distances from every node back to the start, in whole millimeters.
struct ReturnCosts {
    start: NodeId,
    /// node -> (next hop towards start, millimeters to start)
    next_hops: HashMap<NodeId, (NodeId, u64)>,
    /// Largest per-edge cost that can't overflow a path sum
    max_edge_mm: u64,
}

impl ReturnCosts {
    /// Meters from `node` back to the start, or `None` if the start is unreachable.
    fn meters(&self, node: NodeId) -> Option<f64> {
        if node == self.start {
            return Some(0.0);
        }
        self.next_hops.get(&node).map(|&(_, mm)| mm as f64 / 1000.0)
    }
}

/// Edge length rounded up to millimeters, so path costs never underestimate.
///
/// Edges costing more than `max_mm` are impassable on the way back.
fn millimeters(length: f64, max_mm: u64) -> Option<u64> {
    let mm = (length * 1000.0).ceil();
    (mm <= max_mm as f64).then_some(mm as u64)
}

impl<'a> RouteGenerator<'a> {
    pub fn new(graph: &'a StreetGraph, index: &'a SpatialIndex, config: RouteConfig) -> Self {
        Self {
            graph,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Plan a walk from the node nearest `start`.
    ///
    /// Returns [`CoverageError::NoMatch`] if the graph has no nodes and
    /// [`CoverageError::InvalidBudget`] for a negative or non-finite budget.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        visited: &VisitedSet,
        start: &GpsPoint,
        rng: &mut R,
    ) -> Result<RoutePlan> {
        self.check_budget()?;
        let start_node = self.index.nearest_node(start)?;
        debug!(
            "[Route] Start ({}, {}) snapped to node {}",
            start.latitude, start.longitude, start_node
        );
        self.simulate_from_node(visited, start_node, rng)
    }

    /// Plan a walk from a known node.
    pub fn simulate_from_node<R: Rng + ?Sized>(
        &self,
        visited: &VisitedSet,
        start: NodeId,
        rng: &mut R,
    ) -> Result<RoutePlan> {
        self.check_budget()?;
        if self.graph.node(start).is_none() {
            return Err(CoverageError::NoMatch);
        }

        let timer = std::time::Instant::now();
        let returns = match self.config.mode {
            RouteMode::Open => None,
            RouteMode::Loop => Some(self.return_costs(start)),
        };

        let mut walk = Walk::new(start);
        let mut candidates: Vec<(EdgeId, NodeId)> = Vec::new();
        let mut steps: u32 = 0;
        let mut state = GeneratorState::Exploring;

        loop {
            state = match state {
                GeneratorState::Exploring => {
                    if steps >= self.config.max_steps {
                        warn!(
                            "[Route] Stopped after {} steps with {:.0}m of budget left",
                            steps,
                            self.config.budget_meters - walk.distance
                        );
                        GeneratorState::Stuck
                    } else {
                        candidates.clear();
                        candidates.extend(self.graph.neighbors(walk.current));
                        candidates.shuffle(rng);

                        match self.choose_edge(&candidates, visited, &walk, returns.as_ref()) {
                            Some((edge, length)) => {
                                walk.push(edge, length);
                                steps += 1;
                                GeneratorState::Exploring
                            }
                            None => GeneratorState::Stuck,
                        }
                    }
                }
                GeneratorState::Stuck => {
                    if let Some(returns) = &returns {
                        self.return_to_start(&mut walk, returns);
                    }
                    GeneratorState::Done
                }
                GeneratorState::Done => break,
            };
        }

        let newly_covered: HashSet<EdgeId> = walk
            .walked
            .iter()
            .filter(|e| !visited.contains(e))
            .copied()
            .collect();

        info!(
            "[Route] Planned {} edges, {:.0}m of {:.0}m budget, {} new, in {}ms",
            walk.edges.len(),
            walk.distance,
            self.config.budget_meters,
            newly_covered.len(),
            timer.elapsed().as_millis()
        );

        Ok(RoutePlan {
            start,
            nodes: walk.nodes,
            edges: walk.edges,
            distance_meters: walk.distance,
            newly_covered,
            state,
        })
    }

    /// Plan a walk and immediately record it in `visited`.
    pub fn generate_and_commit<R: Rng + ?Sized>(
        &self,
        visited: &mut VisitedSet,
        start: &GpsPoint,
        rng: &mut R,
    ) -> Result<RoutePlan> {
        let plan = self.simulate(visited, start, rng)?;
        let added = plan.commit(visited);
        debug!("[Route] Committed {} new edges", added);
        Ok(plan)
    }

    fn check_budget(&self) -> Result<()> {
        let budget = self.config.budget_meters;
        if !budget.is_finite() || budget < 0.0 {
            return Err(CoverageError::InvalidBudget(budget));
        }
        Ok(())
    }

    /// Pick the next edge among the shuffled `candidates`, or `None` if nothing fits.
    fn choose_edge(
        &self,
        candidates: &[(EdgeId, NodeId)],
        visited: &VisitedSet,
        walk: &Walk,
        returns: Option<&ReturnCosts>,
    ) -> Option<(EdgeId, f64)> {
        let budget = self.config.budget_meters;
        let fitting: Vec<(EdgeId, f64)> = candidates
            .iter()
            .filter_map(|(id, target)| {
                let length = self.graph.edge(id)?.length;
                let way_back = match returns {
                    Some(returns) => returns.meters(*target)?,
                    None => 0.0,
                };
                (walk.distance + length + way_back <= budget).then_some((*id, length))
            })
            .collect();

        let unwalked = |id: &EdgeId| !walk.walked.contains(id);

        fitting
            .iter()
            .find(|(id, _)| unwalked(id) && !visited.contains(id))
            .or_else(|| fitting.iter().find(|(id, _)| unwalked(id)))
            .or_else(|| fitting.iter().find(|(_, length)| *length > 0.0))
            .copied()
    }

    /// Shortest distance from every node to `start`, by Dijkstra over reversed edges.
    fn return_costs(&self, start: NodeId) -> ReturnCosts {
        let graph = self.graph;
        // A shortest path has fewer edges than the graph has nodes
        let max_edge_mm = u64::MAX / (graph.node_count() as u64 + 1);
        let next_hops = dijkstra_all(&start, |node: &NodeId| {
            graph
                .predecessors(*node)
                .filter_map(|(id, source)| {
                    let edge = graph.edge(&id)?;
                    Some((source, millimeters(edge.length, max_edge_mm)?))
                })
                .collect::<Vec<_>>()
        });
        debug!(
            "[Route] {} nodes can walk back to node {}",
            next_hops.len(),
            start
        );
        ReturnCosts {
            start,
            next_hops,
            max_edge_mm,
        }
    }

    /// Append the shortest way from the current node back to the start.
    fn return_to_start(&self, walk: &mut Walk, returns: &ReturnCosts) {
        while walk.current != returns.start {
            let Some(&(next, _)) = returns.next_hops.get(&walk.current) else {
                // Only reachable nodes are ever entered in loop mode
                warn!("[Route] Node {} has no way back to the start", walk.current);
                return;
            };

            let hop = self
                .graph
                .neighbors(walk.current)
                .filter(|(_, target)| *target == next)
                .filter_map(|(id, _)| self.graph.edge(&id))
                .filter_map(|e| Some((millimeters(e.length, returns.max_edge_mm)?, e)))
                .min_by_key(|(mm, e)| (*mm, e.id))
                .map(|(_, e)| e);

            match hop {
                Some(edge) => walk.push(edge.id, edge.length),
                None => {
                    warn!(
                        "[Route] No edge from {} to {} on the way back",
                        walk.current, next
                    );
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
