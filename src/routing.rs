//! Congestion-aware route planning over the zone adjacency graph.
//!
//! The primary route is the shortest path by hop count, ties broken by the
//! lexicographically smaller id sequence; crowding does not bend it. When it
//! crosses a crowded or over-crowded zone, the alternative is searched with
//! those zones forbidden and candidates ranked by the summed congestion rank
//! of their intermediate zones, then hops, then ids. Identical zone state
//! always yields the identical route. Without any adjacency between the
//! endpoints the planner falls back to the direct path `[source, destination]`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{CongestionLevel, DensityCategory, Route, Zone, ZoneId};

/// Undirected graph built from each zone's `adjacent` list. An edge exists if
/// either side lists the other; ids not present in the zone set are ignored.
pub struct ZoneGraph {
    density: BTreeMap<ZoneId, DensityCategory>,
    edges: BTreeMap<ZoneId, BTreeSet<ZoneId>>,
}

impl ZoneGraph {
    pub fn from_zones(zones: &[Zone]) -> Self {
        let density: BTreeMap<ZoneId, DensityCategory> = zones.iter().map(|z| (z.id.clone(), z.density)).collect();
        let mut edges: BTreeMap<ZoneId, BTreeSet<ZoneId>> = BTreeMap::new();

        for zone in zones {
            for other in &zone.adjacent {
                if other == &zone.id || !density.contains_key(other) {
                    continue;
                }
                edges.entry(zone.id.clone()).or_default().insert(other.clone());
                edges.entry(other.clone()).or_default().insert(zone.id.clone());
            }
        }

        Self { density, edges }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.density.contains_key(id)
    }

    pub fn density(&self, id: &str) -> Option<DensityCategory> {
        self.density.get(id).copied()
    }

    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = &ZoneId> {
        self.edges.get(id).into_iter().flatten()
    }

    fn rank(&self, id: &str) -> u32 {
        self.density(id).map(DensityCategory::congestion_rank).unwrap_or(0)
    }

    /// Shortest path by hops, then lexicographic ids.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<ZoneId>> {
        self.search(from, to, |_| true, |_| 0)
    }

    /// Cheapest path by summed congestion rank whose intermediate zones all
    /// pass `allowed`.
    pub fn cheapest_path(&self, from: &str, to: &str, allowed: impl Fn(&str) -> bool) -> Option<Vec<ZoneId>> {
        self.search(from, to, allowed, |id| self.rank(id))
    }

    // Best-first over (cost, hops, path). Extending two paths to the same node
    // by the same step preserves their order, so the first pop per node wins.
    fn search(
        &self,
        from: &str,
        to: &str,
        allowed: impl Fn(&str) -> bool,
        cost_of: impl Fn(&str) -> u32,
    ) -> Option<Vec<ZoneId>> {
        let mut settled: HashSet<ZoneId> = HashSet::new();
        let mut frontier = BinaryHeap::new();
        frontier.push(Reverse((0u32, 0usize, vec![from.to_string()])));

        while let Some(Reverse((cost, hops, path))) = frontier.pop() {
            let current = match path.last() {
                Some(id) => id.clone(),
                None => continue,
            };
            if current == to {
                return Some(path);
            }
            if !settled.insert(current.clone()) {
                continue;
            }

            for next in self.neighbors(&current) {
                if settled.contains(next) {
                    continue;
                }
                let step = if next == to {
                    0
                } else if allowed(next.as_str()) {
                    cost_of(next.as_str())
                } else {
                    continue;
                };
                let mut extended = path.clone();
                extended.push(next.clone());
                frontier.push(Reverse((cost + step, hops + 1, extended)));
            }
        }

        None
    }

    fn max_rank(&self, path: &[ZoneId]) -> u32 {
        path.iter().map(|id| self.rank(id)).max().unwrap_or(0)
    }
}

/// Plan a route between two zones.
///
/// Fails with `InvalidEndpoints` when the endpoints are equal or either is
/// not in `zones`. When the shortest path crosses a crowded or over-crowded
/// zone, a second search forbids every such zone; if that succeeds the
/// cheapest result is offered as `alternative_path`. Congested endpoints
/// cannot be avoided.
pub fn plan_route(source: &str, destination: &str, zones: &[Zone]) -> Result<Route> {
    let graph = ZoneGraph::from_zones(zones);

    if source == destination || !graph.contains(source) || !graph.contains(destination) {
        return Err(CoreError::InvalidEndpoints {
            origin: source.to_string(),
            destination: destination.to_string(),
        });
    }

    let path = graph
        .shortest_path(source, destination)
        .unwrap_or_else(|| vec![source.to_string(), destination.to_string()]);
    let congestion_level = CongestionLevel::from_max_rank(graph.max_rank(&path));

    let alternative_path = if congestion_level == CongestionLevel::High {
        find_uncongested(&graph, source, destination)
    } else {
        None
    };

    debug!(
        source,
        destination,
        hops = path.len() - 1,
        ?congestion_level,
        alternative = alternative_path.is_some(),
        "planned route"
    );

    Ok(Route {
        path,
        congestion_level,
        alternative_path,
    })
}

fn find_uncongested(graph: &ZoneGraph, source: &str, destination: &str) -> Option<Vec<ZoneId>> {
    let congested = |id: &str| graph.density(id).is_some_and(DensityCategory::is_congested);
    if congested(source) || congested(destination) {
        return None;
    }
    graph.cheapest_path(source, destination, |id| !congested(id))
}

/// Wire shape handed to the map overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub route: Vec<ZoneId>,
    pub congestion_level: CongestionLevel,
    pub alternative_route_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_route: Option<Vec<ZoneId>>,
    pub congestion_unavoidable: bool,
}

impl From<Route> for RouteResponse {
    fn from(route: Route) -> Self {
        Self {
            alternative_route_available: route.alternative_available(),
            congestion_unavoidable: route.congestion_unavoidable(),
            route: route.path,
            congestion_level: route.congestion_level,
            alternative_route: route.alternative_path,
        }
    }
}
