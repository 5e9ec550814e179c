//! Occupancy ratio to density category.

use crate::error::{CoreError, Result};
use crate::types::{DensityCategory, ManualOverride, Zone};
use thiserror::Error;

pub const CROWDED_RATIO: f64 = 1.0;
pub const BUSY_RATIO: f64 = 0.7;
pub const MODERATE_RATIO: f64 = 0.3;

/// `classify` knows counts, not zones; callers attach the zone id.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("capacity must be positive, got {0}")]
pub struct CapacityError(pub u32);

/// Classify a zone's occupancy.
///
/// A manual override wins only while `occupant_count` still equals the count
/// recorded when it was set. Otherwise the category is derived from
/// `occupant_count / capacity` with closed-open bands: a ratio sitting on a
/// threshold belongs to the upper category.
pub fn classify(
    occupant_count: u32,
    capacity: u32,
    manual: Option<&ManualOverride>,
) -> std::result::Result<DensityCategory, CapacityError> {
    if let Some(pin) = manual {
        if pin.occupant_count_at_override == occupant_count {
            return Ok(pin.density);
        }
    }

    if capacity == 0 {
        return Err(CapacityError(capacity));
    }

    Ok(category_for_ratio(occupant_count as f64 / capacity as f64))
}

pub fn category_for_ratio(ratio: f64) -> DensityCategory {
    if ratio >= CROWDED_RATIO {
        DensityCategory::OverCrowded
    } else if ratio >= BUSY_RATIO {
        DensityCategory::Crowded
    } else if ratio >= MODERATE_RATIO {
        DensityCategory::Moderate
    } else {
        DensityCategory::Free
    }
}

/// Re-derive `zone.density` in place, dropping a stale override.
///
/// Returns true when the density changed.
pub fn reclassify_zone(zone: &mut Zone) -> Result<bool> {
    let density = classify(zone.occupant_count, zone.capacity, zone.manual_override.as_ref()).map_err(
        |CapacityError(capacity)| CoreError::InvalidCapacity {
            zone_id: zone.id.clone(),
            capacity,
        },
    )?;

    if zone
        .manual_override
        .is_some_and(|pin| pin.occupant_count_at_override != zone.occupant_count)
    {
        zone.manual_override = None;
    }

    let changed = zone.density != density;
    zone.density = density;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinate;

    fn pin(density: DensityCategory, at: u32) -> ManualOverride {
        ManualOverride {
            density,
            occupant_count_at_override: at,
        }
    }

    #[test]
    fn bands() {
        assert_eq!(classify(0, 100, None).unwrap(), DensityCategory::Free);
        assert_eq!(classify(29, 100, None).unwrap(), DensityCategory::Free);
        assert_eq!(classify(30, 100, None).unwrap(), DensityCategory::Moderate);
        assert_eq!(classify(69, 100, None).unwrap(), DensityCategory::Moderate);
        assert_eq!(classify(70, 100, None).unwrap(), DensityCategory::Crowded);
        assert_eq!(classify(99, 100, None).unwrap(), DensityCategory::Crowded);
        assert_eq!(classify(100, 100, None).unwrap(), DensityCategory::OverCrowded);
        assert_eq!(classify(250, 100, None).unwrap(), DensityCategory::OverCrowded);
    }

    #[test]
    fn boundary_belongs_to_upper_band() {
        assert_eq!(category_for_ratio(0.699999), DensityCategory::Moderate);
        assert_eq!(category_for_ratio(0.7), DensityCategory::Crowded);
        assert_eq!(classify(699_999, 1_000_000, None).unwrap(), DensityCategory::Moderate);
        assert_eq!(classify(7, 10, None).unwrap(), DensityCategory::Crowded);
        assert_eq!(classify(3, 10, None).unwrap(), DensityCategory::Moderate);
    }

    #[test]
    fn monotonic_in_count() {
        for capacity in [1, 7, 10, 33, 100] {
            let mut last = DensityCategory::Free;
            for count in 0..=capacity * 2 {
                let d = classify(count, capacity, None).unwrap();
                assert!(d.congestion_rank() >= last.congestion_rank(), "{count}/{capacity}");
                last = d;
            }
        }
    }

    #[test]
    fn zero_capacity_fails() {
        let err = classify(5, 0, None).unwrap_err();
        assert_eq!(err, CapacityError(0));
        assert_eq!(err.to_string(), "capacity must be positive, got 0");
    }

    #[test]
    fn override_sticks_while_count_unchanged() {
        let manual = pin(DensityCategory::Free, 50);
        assert_eq!(classify(50, 100, Some(&manual)).unwrap(), DensityCategory::Free);
        assert_eq!(classify(51, 100, Some(&manual)).unwrap(), DensityCategory::Moderate);
    }

    #[test]
    fn reclassify_drops_stale_override() {
        let square = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 1.0),
            Coordinate::new(1.0, 1.0),
        ];
        let mut zone = Zone::new("gate", "Gate", square, 10);
        zone.occupant_count = 2;
        zone.manual_override = Some(pin(DensityCategory::OverCrowded, 2));

        assert!(reclassify_zone(&mut zone).unwrap());
        assert_eq!(zone.density, DensityCategory::OverCrowded);
        assert!(zone.manual_override.is_some());

        zone.occupant_count = 3;
        assert!(reclassify_zone(&mut zone).unwrap());
        assert_eq!(zone.density, DensityCategory::Moderate);
        assert!(zone.manual_override.is_none());
        assert!(!reclassify_zone(&mut zone).unwrap());
    }

    #[test]
    fn reclassify_reports_zone_id_on_bad_capacity() {
        let mut zone = Zone::new("z9", "Broken", Vec::new(), 0);
        match reclassify_zone(&mut zone) {
            Err(e @ CoreError::InvalidCapacity { .. }) => {
                assert!(e.to_string().contains("z9"));
                assert!(matches!(e, CoreError::InvalidCapacity { ref zone_id, capacity: 0 } if zone_id == "z9"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
