//! # Geographic Utilities
//!
//! Geographic computations shared by the graph, matcher and route modules.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Total length of a polyline in meters |
//! | [`LocalProjection`] | Equirectangular projection to planar meters around a latitude |
//! | [`line_distance_2`] | Squared planar distance from a point to a projected polyline |
//!
//! ## Example
//!
//! ```rust
//! use street_coverage::{GpsPoint, geo_utils};
//!
//! let street = vec![
//!     GpsPoint::new(55.9500, -3.1900),
//!     GpsPoint::new(55.9505, -3.1900),
//!     GpsPoint::new(55.9505, -3.1890),
//! ];
//!
//! let length = geo_utils::polyline_length(&street);
//! println!("Street length: {:.0}m", length);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! Lengths of streets are great-circle distances, accurate to within 0.3% for the
//! distances a walker covers.
//!
//! ### Local Projection
//!
//! Nearest-street queries need distances to line segments, not just to points. Within a
//! single city the earth is flat enough that an equirectangular projection centred on the
//! city's latitude keeps errors well under GPS noise, and lets the R-tree work in meters.

use crate::GpsPoint;
use geo::{Closest, ClosestPoint, Coord, Distance, Haversine, LineString, Point};

/// Approximate meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// # Example
///
/// ```rust
/// use street_coverage::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Calculate the total length of a polyline in meters.
///
/// Sums the haversine distance between consecutive points. Empty or single-point
/// polylines return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Planar Projection
// =============================================================================

/// Equirectangular projection from WGS84 degrees to planar meters.
///
/// `x` grows east, `y` grows north. Longitude is scaled by the cosine of the reference
/// latitude, clamped so that polar references don't collapse the x axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    ref_lat: f64,
    lng_scale: f64,
}

impl LocalProjection {
    /// Create a projection centred on `ref_lat` (degrees).
    pub fn new(ref_lat: f64) -> Self {
        let lng_scale = METERS_PER_DEGREE * ref_lat.to_radians().cos().max(0.1);
        Self { ref_lat, lng_scale }
    }

    /// The reference latitude this projection was built for.
    pub fn reference_latitude(&self) -> f64 {
        self.ref_lat
    }

    /// Project a GPS point to `[x, y]` meters.
    #[inline]
    pub fn project(&self, point: &GpsPoint) -> [f64; 2] {
        [
            point.longitude * self.lng_scale,
            point.latitude * METERS_PER_DEGREE,
        ]
    }

    /// Project a polyline to a planar [`LineString`].
    pub fn project_line(&self, points: &[GpsPoint]) -> LineString<f64> {
        points
            .iter()
            .map(|p| {
                let [x, y] = self.project(p);
                Coord { x, y }
            })
            .collect()
    }
}

/// Squared planar distance from `point` to the closest position on `line`.
///
/// Degenerate lines (a single coordinate, or all coordinates identical) fall back to the
/// distance to their first coordinate. An empty line is infinitely far away.
pub fn line_distance_2(line: &LineString<f64>, point: [f64; 2]) -> f64 {
    let query = Point::new(point[0], point[1]);
    let closest = match line.closest_point(&query) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p,
        Closest::Indeterminate => match line.0.first() {
            Some(first) => Point::from(*first),
            None => return f64::INFINITY,
        },
    };

    let dx = closest.x() - point[0];
    let dy = closest.y() - point[1];
    dx * dx + dy * dy
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(55.9533, -3.1883);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_known_value() {
        // One thousandth of a degree of latitude is about 111m
        let a = GpsPoint::new(55.950, -3.19);
        let b = GpsPoint::new(55.951, -3.19);
        assert!(approx_eq(haversine_distance(&a, &b), 111.2, 1.0));
    }

    #[test]
    fn test_polyline_length_empty_and_single() {
        assert_eq!(polyline_length(&[]), 0.0);
        assert_eq!(polyline_length(&[GpsPoint::new(55.95, -3.19)]), 0.0);
    }

    #[test]
    fn test_polyline_length_sums_segments() {
        let line = vec![
            GpsPoint::new(55.950, -3.19),
            GpsPoint::new(55.951, -3.19),
            GpsPoint::new(55.952, -3.19),
        ];
        assert!(approx_eq(polyline_length(&line), 222.4, 2.0));
    }

    #[test]
    fn test_projection_scales_longitude() {
        let projection = LocalProjection::new(60.0);
        let [x, y] = projection.project(&GpsPoint::new(1.0, 1.0));
        assert!(approx_eq(y, METERS_PER_DEGREE, 1e-6));
        // cos(60°) = 0.5
        assert!(approx_eq(x, METERS_PER_DEGREE * 0.5, 1e-6));
        assert_eq!(projection.reference_latitude(), 60.0);
    }

    #[test]
    fn test_line_distance_perpendicular() {
        let line: LineString<f64> = vec![(0.0, 0.0), (10.0, 0.0)].into();
        assert!(approx_eq(line_distance_2(&line, [5.0, 3.0]), 9.0, 1e-9));
    }

    #[test]
    fn test_line_distance_beyond_endpoint() {
        let line: LineString<f64> = vec![(0.0, 0.0), (10.0, 0.0)].into();
        // Closest position is the endpoint (10, 0)
        assert!(approx_eq(line_distance_2(&line, [13.0, 4.0]), 25.0, 1e-9));
    }

    #[test]
    fn test_line_distance_on_line() {
        let line: LineString<f64> = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)].into();
        assert!(approx_eq(line_distance_2(&line, [10.0, 5.0]), 0.0, 1e-9));
    }

    #[test]
    fn test_line_distance_degenerate() {
        let line: LineString<f64> = vec![(2.0, 2.0), (2.0, 2.0)].into();
        assert!(approx_eq(line_distance_2(&line, [5.0, 6.0]), 25.0, 1e-9));

        let empty: LineString<f64> = LineString::new(vec![]);
        assert!(line_distance_2(&empty, [0.0, 0.0]).is_infinite());
    }
}
