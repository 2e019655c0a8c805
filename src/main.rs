//! street-coverage CLI
//!
//! # Commands
//!
//! - `status`: print how much of the street network has been walked
//! - `ingest`: match new GPX traces into the visited set
//! - `route`: plan a walk over unvisited streets and export it as GPX
//! - `run`: ingest, report, then plan a route

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use street_coverage::{
    write_route_gpx, CoverageError, CoverageStats, GpsPoint, IngestReport, ProcessedTraces, Result,
    RouteGenerator, RouteMode, SpatialIndex, StreetGraph, TraceIngestor, VisitedSet,
    WalkerConfig,
};

/// Track walked streets and plan walks over the ones you haven't.
#[derive(Parser)]
#[command(name = "street-coverage")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, default_value = "street_coverage.json")]
    config: PathBuf,

    /// Street graph, overriding the config
    #[arg(long, global = true)]
    graph: Option<PathBuf>,

    /// Visited set file, overriding the config
    #[arg(long, global = true)]
    visited: Option<PathBuf>,

    /// Verbosity level (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print coverage statistics
    Status,
    /// Match new GPX traces into the visited set
    Ingest {
        /// Trace directory, overriding the config
        #[arg(long)]
        traces: Option<PathBuf>,
    },
    /// Plan a walk and export it as GPX
    Route(RouteArgs),
    /// Ingest new traces, print statistics, then plan a walk
    Run {
        #[arg(long)]
        traces: Option<PathBuf>,

        #[command(flatten)]
        route: RouteArgs,
    },
}

#[derive(Args)]
struct RouteArgs {
    /// Start latitude (requires --lon)
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,

    /// Start longitude (requires --lat)
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,

    /// Distance budget in meters
    #[arg(short, long)]
    distance: Option<f64>,

    /// Return to the start
    #[arg(long = "loop")]
    round_trip: bool,

    /// RNG seed for a reproducible route
    #[arg(long)]
    seed: Option<u64>,

    /// GPX output path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Record the planned route as walked
    #[arg(long)]
    commit: bool,
}

impl RouteArgs {
    fn apply(&self, config: &mut WalkerConfig) {
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            config.start = Some(GpsPoint::new(lat, lon));
        }
        if let Some(distance) = self.distance {
            config.budget_meters = distance;
        }
        if self.round_trip {
            config.route_mode = RouteMode::Loop;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(output) = &self.output {
            config.route_output = output.clone();
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = WalkerConfig::load(&cli.config)?;
    if let Some(graph) = cli.graph {
        config.graph_path = graph;
    }
    if let Some(visited) = cli.visited {
        config.visited_path = visited;
    }

    match cli.command {
        Commands::Status => {
            let graph = StreetGraph::load(&config.graph_path)?;
            let visited = VisitedSet::load(&config.visited_path)?;
            print_status(&graph, &visited);
        }
        Commands::Ingest { traces } => {
            if let Some(traces) = traces {
                config.trace_dir = traces;
            }
            let graph = StreetGraph::load(&config.graph_path)?;
            let index = SpatialIndex::build(&graph);
            let mut visited = VisitedSet::load(&config.visited_path)?;

            ingest(&config, &index, &mut visited)?;
            print_status(&graph, &visited);
        }
        Commands::Route(args) => {
            args.apply(&mut config);
            let graph = StreetGraph::load(&config.graph_path)?;
            let index = SpatialIndex::build(&graph);
            let mut visited = VisitedSet::load(&config.visited_path)?;

            plan_route(&config, &graph, &index, &mut visited, args.commit)?;
        }
        Commands::Run { traces, route } => {
            if let Some(traces) = traces {
                config.trace_dir = traces;
            }
            route.apply(&mut config);
            let graph = StreetGraph::load(&config.graph_path)?;
            let index = SpatialIndex::build(&graph);
            let mut visited = VisitedSet::load(&config.visited_path)?;

            ingest(&config, &index, &mut visited)?;
            print_status(&graph, &visited);
            plan_route(&config, &graph, &index, &mut visited, route.commit)?;
        }
    }

    Ok(())
}

fn ingest(config: &WalkerConfig, index: &SpatialIndex, visited: &mut VisitedSet) -> Result<()> {
    let mut registry = ProcessedTraces::load(&config.registry_path)?;
    let ingestor = TraceIngestor::new(index, &config.visited_path, &config.registry_path)
        .with_match_config(config.matching.clone())
        .with_parallel(config.parallel);

    let report = ingestor.ingest_directory(&config.trace_dir, visited, &mut registry)?;
    print_report(&report);
    Ok(())
}

fn plan_route(
    config: &WalkerConfig,
    graph: &StreetGraph,
    index: &SpatialIndex,
    visited: &mut VisitedSet,
    commit: bool,
) -> Result<()> {
    let start = match (config.start, index.bounds()) {
        (Some(start), _) => start,
        (None, Some(bounds)) => {
            let center = bounds.center();
            info!(
                "No start given, starting from the map center ({:.5}, {:.5})",
                center.latitude, center.longitude
            );
            center
        }
        (None, None) => return Err(CoverageError::EmptyGraph),
    };

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let generator = RouteGenerator::new(graph, index, config.route_config());
    let plan = generator.simulate(visited, &start, &mut rng)?;

    println!(
        "Planned a {:.0}m route over {} streets, {} of them new",
        plan.distance_meters,
        plan.len(),
        plan.newly_covered.len()
    );

    write_route_gpx(&plan, graph, &config.route_output)?;
    println!("Route exported to {}", config.route_output.display());

    if commit {
        let added = plan.commit(visited);
        visited.save(&config.visited_path)?;
        println!("Recorded {} new streets as walked", added);
    }
    Ok(())
}

fn print_report(report: &IngestReport) {
    if report.processed.is_empty() && report.failed.is_empty() {
        println!("No new GPX files to process");
        return;
    }
    for path in &report.processed {
        println!("Processed {}", path.display());
    }
    for (path, reason) in &report.failed {
        println!("Failed {}: {}", path.display(), reason);
    }
    println!(
        "{} new streets from {} traces ({} already processed)",
        report.new_edges,
        report.processed.len(),
        report.skipped
    );
}

fn print_status(graph: &StreetGraph, visited: &VisitedSet) {
    let stats = CoverageStats::compute(visited, graph);
    println!("Total streets in the network: {}", stats.total_edges);
    println!(
        "You have visited {:.2}% of the streets ({} of {}), {:.1} of {:.1} km",
        stats.percentage,
        stats.visited_edges,
        stats.total_edges,
        stats.walked_meters / 1000.0,
        stats.total_meters / 1000.0
    );
}
