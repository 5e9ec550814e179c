//! Non-authoritative second opinion for positions the locator could not place.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::locator::locate;
use crate::types::{Coordinate, Zone, ZoneAssignment, ZoneId};

/// External service (e.g. a language model) asked to place a point when
/// ray casting found nothing.
#[async_trait]
pub trait AdvisoryLocator: Send + Sync {
    async fn suggest(&self, point: Coordinate, zones: &[Zone]) -> Result<Option<ZoneId>>;
}

/// Never has an opinion.
pub struct NoAdvisory;

#[async_trait]
impl AdvisoryLocator for NoAdvisory {
    async fn suggest(&self, _point: Coordinate, _zones: &[Zone]) -> Result<Option<ZoneId>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Deterministic(ZoneAssignment),
    AdvisoryFallback(ZoneId),
}

impl Resolution {
    pub fn assignment(&self) -> ZoneAssignment {
        match self {
            Resolution::Deterministic(a) => a.clone(),
            Resolution::AdvisoryFallback(id) => ZoneAssignment::Zone(id.clone()),
        }
    }
}

/// Deterministic lookup first; the advisory is only consulted on `Unknown`
/// and its answer is dropped if it is late, failed, or names no known zone.
pub async fn locate_with_advisory(
    point: Coordinate,
    zones: &[Zone],
    advisory: &dyn AdvisoryLocator,
    timeout: Duration,
) -> Resolution {
    let found = locate(point, zones);
    if found != ZoneAssignment::Unknown {
        return Resolution::Deterministic(found);
    }

    match tokio::time::timeout(timeout, advisory.suggest(point, zones)).await {
        Ok(Ok(Some(id))) if zones.iter().any(|z| z.id == id) => {
            debug!(zone_id = %id, "advisory placed position");
            Resolution::AdvisoryFallback(id)
        }
        Ok(Ok(Some(id))) => {
            warn!(zone_id = %id, "advisory suggested unknown zone, ignoring");
            Resolution::Deterministic(ZoneAssignment::Unknown)
        }
        Ok(Ok(None)) => Resolution::Deterministic(ZoneAssignment::Unknown),
        Ok(Err(e)) => {
            warn!(error = %e, "advisory lookup failed");
            Resolution::Deterministic(ZoneAssignment::Unknown)
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "advisory lookup timed out");
            Resolution::Deterministic(ZoneAssignment::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        answer: Option<ZoneId>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(answer: Option<&str>, delay: Duration) -> Self {
            Self {
                answer: answer.map(str::to_string),
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AdvisoryLocator for Fixed {
        async fn suggest(&self, _point: Coordinate, _zones: &[Zone]) -> Result<Option<ZoneId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.answer.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl AdvisoryLocator for Failing {
        async fn suggest(&self, _point: Coordinate, _zones: &[Zone]) -> Result<Option<ZoneId>> {
            anyhow::bail!("service unavailable")
        }
    }

    fn zones() -> Vec<Zone> {
        let square = |lat: f64, lon: f64| {
            vec![
                Coordinate::new(lat, lon),
                Coordinate::new(lat, lon + 1.0),
                Coordinate::new(lat + 1.0, lon + 1.0),
                Coordinate::new(lat + 1.0, lon),
            ]
        };
        vec![Zone::new("hall", "Hall", square(0.0, 0.0), 50), Zone::new("yard", "Yard", square(5.0, 5.0), 50)]
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn deterministic_match_never_asks_advisory() {
        let advisory = Fixed::new(Some("yard"), Duration::ZERO);
        let res = locate_with_advisory(Coordinate::new(0.5, 0.5), &zones(), &advisory, WAIT).await;
        assert_eq!(res, Resolution::Deterministic(ZoneAssignment::Zone("hall".into())));
        assert_eq!(advisory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_used_when_unknown() {
        let advisory = Fixed::new(Some("yard"), Duration::ZERO);
        let res = locate_with_advisory(Coordinate::new(3.0, 3.0), &zones(), &advisory, WAIT).await;
        assert_eq!(res, Resolution::AdvisoryFallback("yard".into()));
        assert_eq!(res.assignment(), ZoneAssignment::Zone("yard".into()));
    }

    #[tokio::test]
    async fn late_advisory_is_discarded() {
        let advisory = Fixed::new(Some("yard"), Duration::from_secs(5));
        let res = locate_with_advisory(Coordinate::new(3.0, 3.0), &zones(), &advisory, Duration::from_millis(10)).await;
        assert_eq!(res, Resolution::Deterministic(ZoneAssignment::Unknown));
    }

    #[tokio::test]
    async fn bogus_or_failed_advisory_is_ignored() {
        let bogus = Fixed::new(Some("nowhere"), Duration::ZERO);
        let p = Coordinate::new(3.0, 3.0);
        assert_eq!(
            locate_with_advisory(p, &zones(), &bogus, WAIT).await,
            Resolution::Deterministic(ZoneAssignment::Unknown)
        );
        assert_eq!(
            locate_with_advisory(p, &zones(), &Failing, WAIT).await,
            Resolution::Deterministic(ZoneAssignment::Unknown)
        );
        assert_eq!(
            locate_with_advisory(p, &zones(), &NoAdvisory, WAIT).await,
            Resolution::Deterministic(ZoneAssignment::Unknown)
        );
    }
}
