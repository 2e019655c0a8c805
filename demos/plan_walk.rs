//! Example of recording a walk and planning the next one over a small street grid.
//!
//! Run with: cargo run --example plan_walk

use rand::rngs::StdRng;
use rand::SeedableRng;
use street_coverage::{
    match_trace, CoverageStats, GpsPoint, RouteConfig, RouteGenerator, RouteMode, SpatialIndex,
    StreetGraphBuilder, VisitedSet,
};

fn main() {
    // 4x4 grid of two-way streets, roughly 100m apart (Edinburgh New Town)
    let mut builder = StreetGraphBuilder::new();
    let id = |row: i64, col: i64| row * 10 + col + 1;
    for row in 0..4 {
        for col in 0..4 {
            builder.add_node(
                id(row, col),
                55.9530 + row as f64 * 0.0009,
                -3.2000 + col as f64 * 0.0016,
            );
        }
    }
    for row in 0..4 {
        for col in 0..4 {
            if col < 3 {
                builder.add_street(id(row, col), id(row, col + 1), None);
            }
            if row < 3 {
                builder.add_street(id(row, col), id(row + 1, col), None);
            }
        }
    }
    let graph = builder.build().expect("grid is a valid graph");
    let index = SpatialIndex::build(&graph);

    println!("Street Coverage Example\n");
    println!(
        "Network: {} nodes, {} directed streets, {:.1} km\n",
        graph.node_count(),
        graph.edge_count(),
        graph.total_length() / 1000.0
    );

    // A morning walk along the southern edge
    let trace = vec![
        GpsPoint::new(55.95301, -3.19990),
        GpsPoint::new(55.95302, -3.19900),
        GpsPoint::new(55.95299, -3.19780),
        GpsPoint::new(55.95301, -3.19650),
        GpsPoint::new(55.95300, -3.19540),
    ];
    let mut visited = VisitedSet::new();
    let added = visited.merge(match_trace(&trace, &index));

    let stats = CoverageStats::compute(&visited, &graph);
    println!("1. After the morning walk: {} new streets", added);
    println!(
        "   Coverage: {:.1}% by count, {:.1}% by length\n",
        stats.percentage,
        stats.length_percentage()
    );

    // Plan an open 1.2km walk from the north-west corner
    let mut rng = StdRng::seed_from_u64(2024);
    let generator = RouteGenerator::new(&graph, &index, RouteConfig::with_budget(1_200.0));
    let start = GpsPoint::new(55.9557, -3.2000);
    match generator.simulate(&visited, &start, &mut rng) {
        Ok(plan) => {
            println!("2. Open walk: {:?}", plan.nodes);
            println!(
                "   {:.0}m, {} of {} streets new\n",
                plan.distance_meters,
                plan.newly_covered.len(),
                plan.len()
            );
            plan.commit(&mut visited);
        }
        Err(e) => println!("2. No walk: {}\n", e),
    }

    // Plan a 1km loop from the same corner
    let loop_config = RouteConfig {
        mode: RouteMode::Loop,
        ..RouteConfig::with_budget(1_000.0)
    };
    let generator = RouteGenerator::new(&graph, &index, loop_config);
    match generator.simulate(&visited, &start, &mut rng) {
        Ok(plan) => {
            println!("3. Loop: {:?}", plan.nodes);
            println!(
                "   {:.0}m, {} of {} streets new\n",
                plan.distance_meters,
                plan.newly_covered.len(),
                plan.len()
            );
            plan.commit(&mut visited);
        }
        Err(e) => println!("3. No loop: {}\n", e),
    }

    let stats = CoverageStats::compute(&visited, &graph);
    println!(
        "Final coverage: {:.1}% ({} of {} streets)",
        stats.percentage, stats.visited_edges, stats.total_edges
    );
}
