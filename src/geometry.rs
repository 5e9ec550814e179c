//! Point-in-polygon testing over zone boundaries.
//!
//! Uses the even-odd (ray casting) rule: a horizontal ray is cast from the
//! point along its latitude and every boundary edge it crosses flips the
//! result. Points lying exactly on an edge or vertex have implementation
//! defined membership; this is a known limitation of ray casting and is left
//! as is.

use geo::bounding_rect::BoundingRect;
use geo::{Coord, LineString, Rect};

use crate::types::Coordinate;

/// Returns true when `point` lies inside `polygon`.
///
/// Polygons with fewer than 3 vertices never match. The ring may be open or
/// closed; a repeated closing vertex contributes a zero-length edge which
/// never counts as a crossing.
pub fn is_inside(point: Coordinate, polygon: &[Coordinate]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let px = point.longitude;
    let py = point.latitude;
    let mut inside = false;
    let mut j = polygon.len() - 1;

    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].longitude, polygon[i].latitude);
        let (xj, yj) = (polygon[j].longitude, polygon[j].latitude);

        // (yi > py) != (yj > py) also guarantees yj != yi below
        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Axis-aligned bounds of a boundary in (lon, lat) space.
pub fn bounding_rect(polygon: &[Coordinate]) -> Option<Rect<f64>> {
    let ring: LineString<f64> = polygon.iter().map(|&c| Coord::from(c)).collect();
    ring.bounding_rect()
}
