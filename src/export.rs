//! GPX export of route plans.

use crate::graph::StreetGraph;
use crate::route::RoutePlan;
use crate::{CoverageError, Result};
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};
use log::info;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

const CREATOR: &str = "street-coverage";

/// Build a GPX 1.1 document with one track holding the route's coordinates.
pub fn route_to_gpx(plan: &RoutePlan, graph: &StreetGraph, name: &str) -> Gpx {
    let mut segment = TrackSegment::default();
    segment.points = plan
        .points(graph)
        .into_iter()
        .map(|p| Waypoint::new(geo::Point::new(p.longitude, p.latitude)))
        .collect();

    let mut track = Track::default();
    track.name = Some(name.to_string());
    track.segments.push(segment);

    let mut gpx = Gpx::default();
    gpx.version = GpxVersion::Gpx11;
    gpx.creator = Some(CREATOR.to_string());
    gpx.tracks.push(track);
    gpx
}

/// Write `plan` to `path` as GPX, creating parent directories.
///
/// The track is named after the file stem.
pub fn write_route_gpx(plan: &RoutePlan, graph: &StreetGraph, path: &Path) -> Result<()> {
    let export_error = |reason: String| CoverageError::Export {
        path: path.to_path_buf(),
        reason,
    };

    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "route".to_string());
    let gpx = route_to_gpx(plan, graph, &name);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| export_error(e.to_string()))?;
    }

    let file = File::create(path).map_err(|e| export_error(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    gpx::write(&gpx, &mut writer).map_err(|e| export_error(e.to_string()))?;
    writer.flush().map_err(|e| export_error(e.to_string()))?;

    info!(
        "[Export] Wrote {} points ({:.0}m) to {}",
        gpx.tracks[0].segments[0].points.len(),
        plan.distance_meters,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::VisitedSet;
    use crate::graph::StreetGraphBuilder;
    use crate::matcher::SpatialIndex;
    use crate::route::{RouteConfig, RouteGenerator};
    use crate::trace::load_gpx;
    use crate::GpsPoint;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bent_street() -> StreetGraph {
        let mut builder = StreetGraphBuilder::new();
        builder
            .add_node(1, 55.9500, -3.1900)
            .add_node(2, 55.9510, -3.1900)
            .add_node(3, 55.9510, -3.1890);
        builder.add_edge_with_geometry(
            1,
            2,
            None,
            vec![
                GpsPoint::new(55.9500, -3.1900),
                GpsPoint::new(55.9505, -3.1895),
                GpsPoint::new(55.9510, -3.1900),
            ],
        );
        builder.add_edge(2, 3, 64.0);
        builder.build().unwrap()
    }

    fn walk(graph: &StreetGraph, budget: f64) -> RoutePlan {
        let index = SpatialIndex::build(graph);
        let generator = RouteGenerator::new(graph, &index, RouteConfig::with_budget(budget));
        let mut rng = StdRng::seed_from_u64(0);
        generator
            .simulate_from_node(&VisitedSet::new(), 1, &mut rng)
            .unwrap()
    }

    #[test]
    fn test_route_to_gpx() {
        let graph = bent_street();
        let plan = walk(&graph, 1_000.0);
        let gpx = route_to_gpx(&plan, &graph, "sunday");

        assert_eq!(gpx.version, GpxVersion::Gpx11);
        assert_eq!(gpx.creator.as_deref(), Some("street-coverage"));
        assert_eq!(gpx.tracks.len(), 1);
        assert_eq!(gpx.tracks[0].name.as_deref(), Some("sunday"));
        // Shape point of the bent street plus the three nodes
        assert_eq!(gpx.tracks[0].segments[0].points.len(), 4);
    }

    #[test]
    fn test_written_route_reads_back() {
        let graph = bent_street();
        let plan = walk(&graph, 1_000.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes").join("new_route.gpx");

        write_route_gpx(&plan, &graph, &path).unwrap();

        let points = load_gpx(&path).unwrap();
        let expected = plan.points(&graph);
        assert_eq!(points.len(), expected.len());
        for (read, planned) in points.iter().zip(&expected) {
            assert!((read.latitude - planned.latitude).abs() < 1e-9);
            assert!((read.longitude - planned.longitude).abs() < 1e-9);
        }
    }

    #[test]
    fn test_empty_route_exports_start() {
        let graph = bent_street();
        let plan = walk(&graph, 0.0);
        let gpx = route_to_gpx(&plan, &graph, "idle");
        assert_eq!(gpx.tracks[0].segments[0].points.len(), 1);
    }

    #[test]
    fn test_unwritable_path_is_export_error() {
        let graph = bent_street();
        let plan = walk(&graph, 1_000.0);
        let dir = tempfile::tempdir().unwrap();

        // The target is a directory
        let result = write_route_gpx(&plan, &graph, dir.path());
        assert!(matches!(result, Err(CoverageError::Export { .. })));
    }
}
