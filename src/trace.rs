//! # Trace Ingestion
//!
//! Loads GPX traces, fingerprints them so each file is only counted once, and feeds new
//! ones through the matcher into the visited set.
//!
//! A batch is committed in two steps: the visited set is saved first, and only then are the
//! fingerprints recorded in the processed registry. If the first save fails the registry is
//! left alone and the same traces are picked up again on the next run; merging is
//! idempotent, so nothing is double counted.

use crate::coverage::{write_json_atomic, SharedCoverage, VisitedSet};
use crate::matcher::{MatchConfig, SpatialIndex, TraceMatch};
use crate::{CoverageError, GpsPoint, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

// ============================================================================
// GPX Loading
// ============================================================================

/// Read every track point of a GPX file, in file order.
///
/// A file without track points is a valid, empty trace.
pub fn load_gpx(path: &Path) -> Result<Vec<GpsPoint>> {
    let parse_error = |reason: String| CoverageError::TraceParse {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| parse_error(e.to_string()))?;
    let gpx = gpx::read(BufReader::new(file)).map_err(|e| parse_error(e.to_string()))?;
    Ok(points_from_gpx(&gpx))
}

/// Flatten tracks, then segments, into one point sequence.
pub fn points_from_gpx(gpx: &gpx::Gpx) -> Vec<GpsPoint> {
    gpx.tracks
        .iter()
        .flat_map(|track| &track.segments)
        .flat_map(|segment| &segment.points)
        .map(|waypoint| {
            let point = waypoint.point();
            GpsPoint::new(point.y(), point.x())
        })
        .collect()
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Lowercase hex SHA-256 of `bytes`.
///
/// # Example
/// ```
/// use street_coverage::trace::fingerprint_bytes;
///
/// assert_eq!(
///     fingerprint_bytes(b"abc"),
///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
/// );
/// ```
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content fingerprint of a file. Renaming a file does not change it.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| CoverageError::TraceParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(fingerprint_bytes(&bytes))
}

/// Fingerprints of traces that have already been merged into coverage.
///
/// Persisted as a JSON object mapping each fingerprint to `true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessedTraces {
    entries: BTreeMap<String, bool>,
}

impl ProcessedTraces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let persistence = |source: io::Error| CoverageError::Persistence {
            path: path.to_path_buf(),
            source,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(persistence(e)),
        };
        serde_json::from_reader(BufReader::new(file)).map_err(|e| persistence(io::Error::from(e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn is_processed(&self, fingerprint: &str) -> bool {
        self.entries.get(fingerprint).copied().unwrap_or(false)
    }

    pub fn mark_processed(&mut self, fingerprint: impl Into<String>) {
        self.entries.insert(fingerprint.into(), true);
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|done| **done).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Directory Scan
// ============================================================================

/// A trace file that has not been processed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrace {
    pub path: PathBuf,
    pub fingerprint: String,
}

/// Result of scanning a trace directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceScan {
    /// New traces, sorted by path
    pub pending: Vec<PendingTrace>,
    /// Files whose content was already processed (or repeats one earlier in this scan)
    pub already_processed: usize,
    /// Files that could not be read, with the reason
    pub unreadable: Vec<(PathBuf, String)>,
}

fn is_gpx(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gpx"))
}

/// List the `.gpx` files in `dir` whose content is not in `registry`.
///
/// A missing directory holds no traces.
pub fn find_new_traces(dir: &Path, registry: &ProcessedTraces) -> Result<TraceScan> {
    let persistence = |source: io::Error| CoverageError::Persistence {
        path: dir.to_path_buf(),
        source,
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("[Trace] Trace directory {} does not exist", dir.display());
            return Ok(TraceScan::default());
        }
        Err(e) => return Err(persistence(e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(persistence)?.path();
        if path.is_file() && is_gpx(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut scan = TraceScan::default();
    let mut seen: HashSet<String> = HashSet::new();

    for path in paths {
        let fingerprint = match fingerprint_file(&path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("[Trace] {}", e);
                scan.unreadable.push((path, e.to_string()));
                continue;
            }
        };

        if registry.is_processed(&fingerprint) || !seen.insert(fingerprint.clone()) {
            debug!("[Trace] Skipping already processed {}", path.display());
            scan.already_processed += 1;
            continue;
        }
        scan.pending.push(PendingTrace { path, fingerprint });
    }

    Ok(scan)
}

// ============================================================================
// Batch Ingestion
// ============================================================================

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Traces merged into coverage and recorded as processed
    pub processed: Vec<PathBuf>,
    /// Traces skipped because their content was already processed
    pub skipped: usize,
    /// Traces that could not be read or parsed; they are retried next run
    pub failed: Vec<(PathBuf, String)>,
    /// Edges added to the visited set by this batch
    pub new_edges: usize,
    pub matched_points: usize,
    pub unmatched_points: usize,
}

/// Matches a directory of traces into a persisted visited set.
pub struct TraceIngestor<'a> {
    index: &'a SpatialIndex,
    match_config: MatchConfig,
    visited_path: PathBuf,
    registry_path: PathBuf,
    #[cfg_attr(not(feature = "parallel"), allow(dead_code))]
    parallel: bool,
}

struct TraceOutcome {
    trace: PendingTrace,
    matched: Result<(TraceMatch, usize)>,
}

impl<'a> TraceIngestor<'a> {
    pub fn new(
        index: &'a SpatialIndex,
        visited_path: impl Into<PathBuf>,
        registry_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            match_config: MatchConfig::default(),
            visited_path: visited_path.into(),
            registry_path: registry_path.into(),
            parallel: true,
        }
    }

    pub fn with_match_config(mut self, config: MatchConfig) -> Self {
        self.match_config = config;
        self
    }

    /// Match traces concurrently. Only takes effect with the `parallel` feature.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Ingest every new trace in `dir`.
    ///
    /// Saves `visited` and then `registry` when at least one trace was processed. A
    /// failure to read one trace is reported in [`IngestReport::failed`]; a failure to
    /// save either file is returned as [`CoverageError::Persistence`].
    pub fn ingest_directory(
        &self,
        dir: &Path,
        visited: &mut VisitedSet,
        registry: &mut ProcessedTraces,
    ) -> Result<IngestReport> {
        let start = std::time::Instant::now();
        let scan = find_new_traces(dir, registry)?;

        let mut report = IngestReport {
            skipped: scan.already_processed,
            failed: scan.unreadable,
            ..IngestReport::default()
        };

        if scan.pending.is_empty() {
            info!(
                "[Trace] No new traces in {} ({} already processed)",
                dir.display(),
                report.skipped
            );
            return Ok(report);
        }
        self.index.ensure_not_empty()?;

        info!("[Trace] Ingesting {} new traces from {}", scan.pending.len(), dir.display());

        let shared = SharedCoverage::new(std::mem::take(visited));

        #[cfg(feature = "parallel")]
        let outcomes: Vec<TraceOutcome> = if self.parallel {
            use rayon::prelude::*;
            scan.pending
                .into_par_iter()
                .map(|trace| self.process_trace(trace, &shared))
                .collect()
        } else {
            scan.pending
                .into_iter()
                .map(|trace| self.process_trace(trace, &shared))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<TraceOutcome> = scan
            .pending
            .into_iter()
            .map(|trace| self.process_trace(trace, &shared))
            .collect();

        *visited = shared.into_inner();

        let mut fingerprints = Vec::new();
        for outcome in outcomes {
            match outcome.matched {
                Ok((matched, added)) => {
                    report.new_edges += added;
                    report.matched_points += matched.matched_points;
                    report.unmatched_points += matched.unmatched_points;
                    report.processed.push(outcome.trace.path);
                    fingerprints.push(outcome.trace.fingerprint);
                }
                Err(e) => {
                    warn!("[Trace] {}", e);
                    report.failed.push((outcome.trace.path, e.to_string()));
                }
            }
        }

        if !report.processed.is_empty() {
            visited.save(&self.visited_path)?;
            for fingerprint in fingerprints {
                registry.mark_processed(fingerprint);
            }
            registry.save(&self.registry_path)?;
        }

        info!(
            "[Trace] Processed {} traces ({} failed, {} skipped), {} new edges in {}ms",
            report.processed.len(),
            report.failed.len(),
            report.skipped,
            report.new_edges,
            start.elapsed().as_millis()
        );

        Ok(report)
    }

    fn process_trace(&self, trace: PendingTrace, shared: &SharedCoverage) -> TraceOutcome {
        let matched = load_gpx(&trace.path).map(|points| {
            let matched = self.index.match_points(&points, &self.match_config);
            let added = shared.merge(matched.edges.iter().copied());
            debug!(
                "[Trace] {}: {} points, {} edges, {} new",
                trace.path.display(),
                points.len(),
                matched.edges.len(),
                added
            );
            (matched, added)
        });
        TraceOutcome { trace, matched }
    }
}

// ============================================================================
// Tests
// ============================================================================
