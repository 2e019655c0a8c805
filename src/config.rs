//! Run configuration.
//!
//! Every field has a default, so a config file only needs the values it changes:
//!
//! ```json
//! { "graph_path": "maps/leith.json", "budget_meters": 3000, "route_mode": "loop" }
//! ```

use crate::matcher::MatchConfig;
use crate::route::{RouteConfig, RouteMode};
use crate::{CoverageError, GpsPoint, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Paths and parameters for ingesting traces and planning walks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// JSON street graph.
    /// Default: map_data/city_map.json
    pub graph_path: PathBuf,
    /// Directory scanned for GPX traces.
    /// Default: gpx_files
    pub trace_dir: PathBuf,
    /// Persisted visited set.
    /// Default: visited_streets.json
    pub visited_path: PathBuf,
    /// Registry of processed trace fingerprints.
    /// Default: gpx_metadata.json
    pub registry_path: PathBuf,
    /// Where generated routes are written.
    /// Default: new_route.gpx
    pub route_output: PathBuf,
    /// Route start. `None` starts from the middle of the map.
    pub start: Option<GpsPoint>,
    /// Route length budget in meters.
    /// Default: 5000
    pub budget_meters: f64,
    /// Default: open
    pub route_mode: RouteMode,
    /// RNG seed for reproducible routes. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Default: 100000
    pub max_steps: u32,
    /// Match traces concurrently when built with the `parallel` feature.
    /// Default: true
    pub parallel: bool,
    pub matching: MatchConfig,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        let route = RouteConfig::default();
        Self {
            graph_path: PathBuf::from("map_data/city_map.json"),
            trace_dir: PathBuf::from("gpx_files"),
            visited_path: PathBuf::from("visited_streets.json"),
            registry_path: PathBuf::from("gpx_metadata.json"),
            route_output: PathBuf::from("new_route.gpx"),
            start: None,
            budget_meters: route.budget_meters,
            route_mode: route.mode,
            seed: None,
            max_steps: route.max_steps,
            parallel: true,
            matching: MatchConfig::default(),
        }
    }
}

impl WalkerConfig {
    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config_error = |reason: String| CoverageError::Config {
            path: path.to_path_buf(),
            reason,
        };

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("[Config] No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(config_error(e.to_string())),
        };

        let config: Self = serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))?;
        if let Some(start) = &config.start {
            if !start.is_valid() {
                return Err(config_error(format!(
                    "start ({}, {}) is not a valid coordinate",
                    start.latitude, start.longitude
                )));
            }
        }
        Ok(config)
    }

    /// Route generator settings from this config.
    pub fn route_config(&self) -> RouteConfig {
        RouteConfig {
            budget_meters: self.budget_meters,
            mode: self.route_mode,
            max_steps: self.max_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalkerConfig::load(&dir.path().join("walker.json")).unwrap();
        assert_eq!(config, WalkerConfig::default());
        assert_eq!(config.graph_path, PathBuf::from("map_data/city_map.json"));
        assert_eq!(config.budget_meters, 5000.0);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walker.json");
        fs::write(
            &path,
            r#"{
                "budget_meters": 3000,
                "route_mode": "loop",
                "start": { "latitude": 55.95, "longitude": -3.19 },
                "matching": { "max_match_distance": 25.0 }
            }"#,
        )
        .unwrap();

        let config = WalkerConfig::load(&path).unwrap();
        assert_eq!(config.budget_meters, 3000.0);
        assert_eq!(config.route_mode, RouteMode::Loop);
        assert_eq!(config.start, Some(GpsPoint::new(55.95, -3.19)));
        assert_eq!(config.matching.max_match_distance, Some(25.0));
        assert_eq!(config.trace_dir, PathBuf::from("gpx_files"));

        let route = config.route_config();
        assert_eq!(route.budget_meters, 3000.0);
        assert_eq!(route.mode, RouteMode::Loop);
        assert_eq!(route.max_steps, 100_000);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walker.json");

        fs::write(&path, "{ \"budget_meters\": \"far\" }").unwrap();
        assert!(matches!(WalkerConfig::load(&path), Err(CoverageError::Config { .. })));

        fs::write(&path, r#"{ "start": { "latitude": 123.0, "longitude": 0.0 } }"#).unwrap();
        assert!(matches!(WalkerConfig::load(&path), Err(CoverageError::Config { .. })));
    }
}
