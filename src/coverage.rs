//! # Coverage Tracker
//!
//! Owns the set of street edges the user has walked and derives coverage statistics.
//!
//! The set only ever grows: merging is a set union, so submitting the same trace twice
//! changes nothing. It is persisted as a JSON list of `[source, target, key]` triples.
//! Legacy files holding `[source, target]` pairs load with `key = 0`.
//!
//! Saving writes a sibling temporary file and renames it over the target, so a failed
//! save leaves the previously persisted set intact.

use crate::graph::{EdgeId, NodeId, StreetGraph};
use crate::{CoverageError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// Visited Set
// ============================================================================

/// The edges a user has walked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitedSet {
    edges: HashSet<EdgeId>,
}

/// One persisted edge: a full triple, or a legacy pair without a key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEdge {
    Triple(NodeId, NodeId, u32),
    Pair(NodeId, NodeId),
}

impl From<StoredEdge> for EdgeId {
    fn from(stored: StoredEdge) -> Self {
        match stored {
            StoredEdge::Triple(source, target, key) => EdgeId::new(source, target, key),
            StoredEdge::Pair(source, target) => EdgeId::new(source, target, 0),
        }
    }
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted set. A missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("[Coverage] No visited set at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(CoverageError::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let stored: Vec<StoredEdge> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                CoverageError::Persistence {
                    path: path.to_path_buf(),
                    source: io::Error::from(e),
                }
            })?;

        let visited: Self = stored.into_iter().map(EdgeId::from).collect();
        info!(
            "[Coverage] Loaded {} visited edges from {}",
            visited.len(),
            path.display()
        );
        Ok(visited)
    }

    /// Persist the set, sorted by edge id.
    pub fn save(&self, path: &Path) -> Result<()> {
        let triples: Vec<(NodeId, NodeId, u32)> = self
            .to_sorted_vec()
            .into_iter()
            .map(|e| (e.source, e.target, e.key))
            .collect();
        write_json_atomic(path, &triples)?;
        debug!("[Coverage] Saved {} visited edges to {}", self.len(), path.display());
        Ok(())
    }

    /// Union `matched` into the set, returning how many edges were new.
    ///
    /// Idempotent: merging the same edges again returns 0 and changes nothing.
    pub fn merge<I>(&mut self, matched: I) -> usize
    where
        I: IntoIterator<Item = EdgeId>,
    {
        let before = self.edges.len();
        self.edges.extend(matched);
        self.edges.len() - before
    }

    pub fn contains(&self, edge: &EdgeId) -> bool {
        self.edges.contains(edge)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EdgeId> {
        self.edges.iter()
    }

    pub fn to_sorted_vec(&self) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = self.edges.iter().copied().collect();
        edges.sort();
        edges
    }
}

impl FromIterator<EdgeId> for VisitedSet {
    fn from_iter<T: IntoIterator<Item = EdgeId>>(iter: T) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

/// Percentage (0-100) of `total_edges` present in `visited`.
///
/// Returns 0.0 when `total_edges` is 0.
///
/// # Example
/// ```
/// use street_coverage::{coverage_ratio, EdgeId, VisitedSet};
///
/// let visited: VisitedSet = [EdgeId::new(1, 2, 0)].into_iter().collect();
/// assert_eq!(coverage_ratio(&visited, 4), 25.0);
/// assert_eq!(coverage_ratio(&visited, 0), 0.0);
/// ```
pub fn coverage_ratio(visited: &VisitedSet, total_edges: usize) -> f64 {
    percentage(visited.len(), total_edges)
}

fn percentage(visited_edges: usize, total_edges: usize) -> f64 {
    if total_edges == 0 {
        return 0.0;
    }
    (visited_edges as f64 / total_edges as f64 * 100.0).min(100.0)
}

// ============================================================================
// Statistics
// ============================================================================

/// Coverage summary for a graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageStats {
    /// Visited edges that exist in the graph
    pub visited_edges: usize,
    /// Directed edges in the graph
    pub total_edges: usize,
    /// Share of the graph's edges visited, 0-100
    pub percentage: f64,
    /// Length of visited edges that exist in the graph, meters
    pub walked_meters: f64,
    /// Length of all graph edges, meters
    pub total_meters: f64,
}

impl CoverageStats {
    /// Visited ids that are not edges of `graph` (a stale file, an older map) are ignored.
    pub fn compute(visited: &VisitedSet, graph: &StreetGraph) -> Self {
        let (visited_edges, walked_meters) = visited
            .iter()
            .filter_map(|id| graph.edge(id))
            .fold((0, 0.0), |(count, meters), e| (count + 1, meters + e.length));

        Self {
            visited_edges,
            total_edges: graph.edge_count(),
            percentage: percentage(visited_edges, graph.edge_count()),
            walked_meters,
            total_meters: graph.total_length(),
        }
    }

    /// Share of the network's length walked, 0-100.
    pub fn length_percentage(&self) -> f64 {
        if self.total_meters <= 0.0 {
            return 0.0;
        }
        (self.walked_meters / self.total_meters * 100.0).min(100.0)
    }
}

// ============================================================================
// Shared Handle
// ============================================================================

/// Single-writer handle around a [`VisitedSet`] for concurrent trace processing.
///
/// Every merge takes the lock, so concurrent matchers never interleave writes.
#[derive(Debug, Clone, Default)]
pub struct SharedCoverage {
    inner: Arc<Mutex<VisitedSet>>,
}

impl SharedCoverage {
    pub fn new(visited: VisitedSet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(visited)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VisitedSet> {
        // A panic while holding the lock cannot leave a half-applied union behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge under the lock, returning how many edges were new.
    pub fn merge<I>(&self, matched: I) -> usize
    where
        I: IntoIterator<Item = EdgeId>,
    {
        self.lock().merge(matched)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> VisitedSet {
        self.lock().clone()
    }

    /// Recover the set, cloning it if other handles are still alive.
    pub fn into_inner(self) -> VisitedSet {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

// ============================================================================
// Persistence Helpers
// ============================================================================

/// Serialize `value` as JSON to `path` via a temporary sibling file and a rename.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let persistence = |source: io::Error| CoverageError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persistence)?;
    }

    let tmp = temporary_path(path);
    let written = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, value).map_err(io::Error::from)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        // The target was never touched; only the temporary file needs cleaning up
        let _ = fs::remove_file(&tmp);
        return Err(persistence(e));
    }
    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StreetGraphBuilder;

    fn edges(ids: &[(NodeId, NodeId, u32)]) -> Vec<EdgeId> {
        ids.iter().map(|&(s, t, k)| EdgeId::new(s, t, k)).collect()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let matched = edges(&[(1, 2, 0), (2, 3, 0)]);
        let mut once = VisitedSet::new();
        assert_eq!(once.merge(matched.clone()), 2);

        let mut twice = once.clone();
        assert_eq!(twice.merge(matched), 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_coverage_is_monotonic() {
        let batches = [
            edges(&[(1, 2, 0)]),
            edges(&[(1, 2, 0), (2, 3, 0)]),
            edges(&[]),
            edges(&[(3, 1, 0), (2, 3, 0)]),
        ];
        let mut visited = VisitedSet::new();
        let mut previous = coverage_ratio(&visited, 4);
        for batch in batches {
            visited.merge(batch);
            let current = coverage_ratio(&visited, 4);
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, 75.0);
    }

    #[test]
    fn test_ratio_divide_by_zero_guard() {
        let visited: VisitedSet = edges(&[(1, 2, 0), (2, 1, 0)]).into_iter().collect();
        assert_eq!(coverage_ratio(&visited, 0), 0.0);
        assert_eq!(coverage_ratio(&VisitedSet::new(), 0), 0.0);
    }

    #[test]
    fn test_ratio_clamped() {
        let visited: VisitedSet = edges(&[(1, 2, 0), (2, 1, 0), (2, 3, 0)]).into_iter().collect();
        assert_eq!(coverage_ratio(&visited, 2), 100.0);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let visited = VisitedSet::load(&dir.path().join("visited.json")).unwrap();
        assert!(visited.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("visited.json");

        let visited: VisitedSet = edges(&[(3, 1, 0), (1, 2, 1), (1, 2, 0)]).into_iter().collect();
        visited.save(&path).unwrap();

        assert_eq!(VisitedSet::load(&path).unwrap(), visited);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[[1,2,0],[1,2,1],[3,1,0]]"
        );
        assert!(!temporary_path(&path).exists());
    }

    #[test]
    fn test_load_legacy_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited.json");
        fs::write(&path, "[[1, 2], [2, 3, 4]]").unwrap();

        let visited = VisitedSet::load(&path).unwrap();
        assert_eq!(visited.to_sorted_vec(), edges(&[(1, 2, 0), (2, 3, 4)]));
    }

    #[test]
    fn test_malformed_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited.json");
        fs::write(&path, "{\"not\": \"a list\"}").unwrap();

        assert!(matches!(
            VisitedSet::load(&path),
            Err(CoverageError::Persistence { .. })
        ));
    }

    #[test]
    fn test_failed_save_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited.json");

        let original: VisitedSet = edges(&[(1, 2, 0)]).into_iter().collect();
        original.save(&path).unwrap();

        // A directory squatting on the temporary path makes the next save fail
        fs::create_dir(temporary_path(&path)).unwrap();
        let grown: VisitedSet = edges(&[(1, 2, 0), (2, 3, 0)]).into_iter().collect();
        assert!(matches!(
            grown.save(&path),
            Err(CoverageError::Persistence { .. })
        ));

        assert_eq!(VisitedSet::load(&path).unwrap(), original);
    }

    #[test]
    fn test_stats_by_count_and_length() {
        let mut builder = StreetGraphBuilder::new();
        builder
            .add_node(1, 55.950, -3.19)
            .add_node(2, 55.951, -3.19)
            .add_node(3, 55.951, -3.188);
        builder.add_edge(1, 2, 100.0);
        builder.add_edge(2, 3, 300.0);
        let graph = builder.build().unwrap();

        // The stale edge (9, 9, 0) is not part of this graph
        let visited: VisitedSet = edges(&[(2, 3, 0), (9, 9, 0)]).into_iter().collect();
        let stats = CoverageStats::compute(&visited, &graph);

        assert_eq!(stats.visited_edges, 1);
        assert_eq!(stats.total_edges, 2);
        assert_eq!(stats.percentage, 50.0);
        assert_eq!(stats.walked_meters, 300.0);
        assert_eq!(stats.total_meters, 400.0);
        assert_eq!(stats.length_percentage(), 75.0);
    }

    #[test]
    fn test_stats_ignore_edges_missing_from_graph() {
        let mut builder = StreetGraphBuilder::new();
        builder
            .add_node(1, 55.950, -3.19)
            .add_node(2, 55.951, -3.19)
            .add_node(3, 55.951, -3.188);
        builder.add_edge(1, 2, 100.0);
        builder.add_edge(2, 3, 300.0);
        let graph = builder.build().unwrap();

        let stale: VisitedSet = edges(&[(7, 8, 0), (8, 9, 0)]).into_iter().collect();
        let stats = CoverageStats::compute(&stale, &graph);
        assert_eq!(stats.visited_edges, 0);
        assert_eq!(stats.percentage, 0.0);
        assert_eq!(stats.length_percentage(), 0.0);
    }

    #[test]
    fn test_stats_of_empty_set_are_positive_zero() {
        let mut builder = StreetGraphBuilder::new();
        builder.add_node(1, 55.950, -3.19).add_node(2, 55.951, -3.19);
        builder.add_edge(1, 2, 100.0);
        let graph = builder.build().unwrap();

        let stats = CoverageStats::compute(&VisitedSet::new(), &graph);
        assert!(stats.walked_meters.is_sign_positive());
        assert!(stats.length_percentage().is_sign_positive());
        assert_eq!(format!("{:.1}", stats.walked_meters / 1000.0), "0.0");
    }

    #[test]
    fn test_shared_coverage_serializes_merges() {
        let shared = SharedCoverage::new(VisitedSet::new());

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let handle = shared.clone();
                scope.spawn(move || {
                    for i in 0..50 {
                        handle.merge([EdgeId::new(worker, i, 0), EdgeId::new(-1, i, 0)]);
                    }
                });
            }
        });

        assert_eq!(shared.len(), 4 * 50 + 50);
        let snapshot = shared.snapshot();
        assert_eq!(shared.into_inner(), snapshot);
    }
}
