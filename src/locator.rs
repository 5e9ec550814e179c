//! Position to zone lookup.
//!
//! Zones are expected not to overlap. When they do, the first zone in caller
//! order that contains the point wins; no attempt is made to pick the
//! smaller or "more specific" zone.

use rstar::{RTree, RTreeObject, AABB};
use tracing::debug;

use crate::geometry::{bounding_rect, is_inside};
use crate::types::{Coordinate, Zone, ZoneAssignment, ZoneId};

/// Linear first-match lookup. Zones with fewer than 3 vertices are skipped.
pub fn locate(point: Coordinate, zones: &[Zone]) -> ZoneAssignment {
    zones
        .iter()
        .filter(|zone| zone.has_valid_boundary())
        .find(|zone| is_inside(point, &zone.boundary))
        .map(|zone| ZoneAssignment::Zone(zone.id.clone()))
        .unwrap_or(ZoneAssignment::Unknown)
}

// Wrapper for RTree indexing
struct ZoneEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for ZoneEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Bounding-box prefilter over a zone set. Answers are identical to
/// [`locate`] over the same zones in the same order.
///
/// The index copies ids and boundaries, so it must be rebuilt whenever a zone
/// is added, removed or reshaped. Occupancy changes do not affect it.
pub struct ZoneIndex {
    outlines: Vec<(ZoneId, Vec<Coordinate>)>,
    tree: RTree<ZoneEnvelope>,
}

impl ZoneIndex {
    pub fn build(zones: &[Zone]) -> Self {
        let items: Vec<ZoneEnvelope> = zones
            .iter()
            .enumerate()
            .filter(|(_, zone)| zone.has_valid_boundary())
            .filter_map(|(index, zone)| {
                let rect = bounding_rect(&zone.boundary)?;
                Some(ZoneEnvelope {
                    index,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();

        debug!(zones = zones.len(), indexed = items.len(), "built zone index");

        Self {
            outlines: zones.iter().map(|z| (z.id.clone(), z.boundary.clone())).collect(),
            tree: RTree::bulk_load(items),
        }
    }

    pub fn len(&self) -> usize {
        self.outlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outlines.is_empty()
    }

    pub fn locate(&self, point: Coordinate) -> ZoneAssignment {
        let envelope = AABB::from_point([point.longitude, point.latitude]);
        let mut candidates: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|c| c.index)
            .collect();
        // tree order is arbitrary, caller order decides
        candidates.sort_unstable();

        candidates
            .into_iter()
            .map(|i| &self.outlines[i])
            .find(|(_, boundary)| is_inside(point, boundary))
            .map(|(id, _)| ZoneAssignment::Zone(id.clone()))
            .unwrap_or(ZoneAssignment::Unknown)
    }
}
