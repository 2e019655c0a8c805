//! # Street Coverage
//!
//! Track which streets of a walkable network you have actually walked, and plan new walks
//! that favour the streets you have not.
//!
//! This library provides:
//! - GPS trace matching onto street-network edges using an R-tree spatial index
//! - A persistent, monotonically growing set of visited edges with coverage statistics
//! - A greedy, distance-bounded walk generator that prefers unvisited edges
//! - GPX trace ingestion with content fingerprints, and GPX route export
//!
//! ## Features
//!
//! - **`parallel`** - Match independent traces in parallel with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use rand::{rngs::StdRng, SeedableRng};
//! use street_coverage::{
//!     match_trace, GpsPoint, RouteConfig, RouteGenerator, SpatialIndex, StreetGraphBuilder,
//!     VisitedSet,
//! };
//!
//! // A tiny one-way triangle: 1 -> 2 -> 3 -> 1
//! let mut builder = StreetGraphBuilder::new();
//! builder
//!     .add_node(1, 51.5000, -0.1200)
//!     .add_node(2, 51.5009, -0.1200)
//!     .add_node(3, 51.5009, -0.1186);
//! builder.add_edge(1, 2, 100.0);
//! builder.add_edge(2, 3, 100.0);
//! builder.add_edge(3, 1, 100.0);
//! let graph = builder.build().unwrap();
//! let index = SpatialIndex::build(&graph);
//!
//! // Record a walk along the first street
//! let mut visited = VisitedSet::new();
//! let trace = vec![GpsPoint::new(51.5003, -0.1200), GpsPoint::new(51.5006, -0.1200)];
//! visited.merge(match_trace(&trace, &index));
//! assert_eq!(visited.len(), 1);
//!
//! // Plan a 250m walk from node 2 that avoids what we've already walked
//! let generator = RouteGenerator::new(&graph, &index, RouteConfig::with_budget(250.0));
//! let mut rng = StdRng::seed_from_u64(7);
//! let plan = generator.simulate(&visited, &GpsPoint::new(51.5009, -0.1200), &mut rng).unwrap();
//! assert_eq!(plan.nodes, vec![2, 3, 1]);
//! assert!(plan.distance_meters <= 250.0);
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod config;
pub mod coverage;
pub mod export;
pub mod geo_utils;
pub mod graph;
pub mod matcher;
pub mod route;
pub mod trace;

pub use config::WalkerConfig;
pub use coverage::{coverage_ratio, CoverageStats, SharedCoverage, VisitedSet};
pub use export::{route_to_gpx, write_route_gpx};
pub use graph::{Edge, EdgeId, Node, NodeId, StreetGraph, StreetGraphBuilder};
pub use matcher::{
    match_trace, match_trace_with_config, nearest_edge, nearest_node, MatchConfig, SpatialIndex,
    TraceMatch,
};
pub use route::{GeneratorState, RouteConfig, RouteGenerator, RouteMode, RoutePlan};
pub use trace::{
    find_new_traces, fingerprint_file, load_gpx, IngestReport, ProcessedTraces, TraceIngestor,
};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use street_coverage::GpsPoint;
/// let point = GpsPoint::new(55.9533, -3.1883); // Edinburgh
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points. Returns `None` for empty input.
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a GpsPoint>,
    {
        let mut points = points.into_iter().peekable();
        points.peek()?;

        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self { min_lat, max_lat, min_lng, max_lng })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Everything that can go wrong in the coverage engine and its I/O collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    /// The street graph could not be loaded or failed validation. Fatal for a run.
    #[error("failed to load street graph from {origin}: {reason}")]
    GraphLoad { origin: String, reason: String },

    /// No edge (or node) could be resolved for a point.
    #[error("no street matches the requested point")]
    NoMatch,

    /// The spatial index holds no edges.
    #[error("street graph has no edges to match against")]
    EmptyGraph,

    /// Reading or writing persisted state failed. The previously persisted file is untouched.
    #[error("persistence failure at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single trace file could not be read or parsed.
    #[error("failed to read trace {}: {reason}", path.display())]
    TraceParse { path: PathBuf, reason: String },

    /// Route export failed.
    #[error("failed to export route to {}: {reason}", path.display())]
    Export { path: PathBuf, reason: String },

    /// The configuration file is malformed.
    #[error("invalid configuration in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// Route budgets must be finite and non-negative.
    #[error("invalid distance budget: {0}")]
    InvalidBudget(f64),
}

pub type Result<T> = std::result::Result<T, CoverageError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(55.9533, -3.1883).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_from_points() {
        let points = [
            GpsPoint::new(55.95, -3.20),
            GpsPoint::new(55.96, -3.18),
            GpsPoint::new(55.94, -3.19),
        ];
        let bounds = Bounds::from_points(&points).unwrap();
        assert_eq!(bounds.min_lat, 55.94);
        assert_eq!(bounds.max_lat, 55.96);
        assert_eq!(bounds.min_lng, -3.20);
        assert_eq!(bounds.max_lng, -3.18);

        let center = bounds.center();
        assert!((center.latitude - 55.95).abs() < 1e-9);
        assert!((center.longitude - (-3.19)).abs() < 1e-9);
    }

    #[test]
    fn test_bounds_empty() {
        let empty: Vec<GpsPoint> = vec![];
        assert!(Bounds::from_points(&empty).is_none());
    }

    #[test]
    fn test_error_messages_name_the_path() {
        let err = CoverageError::TraceParse {
            path: PathBuf::from("walks/monday.gpx"),
            reason: "unexpected end of file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to read trace walks/monday.gpx: unexpected end of file"
        );
    }
}
