use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

pub type ZoneId = String;

/// WGS84 position. Ranges are not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

// geo works in (x, y) = (lon, lat)
impl From<Coordinate> for geo::Coord<f64> {
    fn from(c: Coordinate) -> Self {
        geo::Coord {
            x: c.longitude,
            y: c.latitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DensityCategory {
    Free,
    Moderate,
    Crowded,
    OverCrowded,
}

impl DensityCategory {
    /// Weight used when comparing route costs.
    pub fn congestion_rank(self) -> u32 {
        match self {
            DensityCategory::Free => 0,
            DensityCategory::Moderate => 1,
            DensityCategory::Crowded => 3,
            DensityCategory::OverCrowded => 8,
        }
    }

    pub fn is_congested(self) -> bool {
        matches!(self, DensityCategory::Crowded | DensityCategory::OverCrowded)
    }
}

impl fmt::Display for DensityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DensityCategory::Free => "free",
            DensityCategory::Moderate => "moderate",
            DensityCategory::Crowded => "crowded",
            DensityCategory::OverCrowded => "over-crowded",
        };
        f.write_str(s)
    }
}

/// Admin-pinned density, valid only while the occupant count stays at
/// `occupant_count_at_override`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverride {
    pub density: DensityCategory,
    pub occupant_count_at_override: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub boundary: Vec<Coordinate>,
    pub capacity: u32,
    #[serde(default)]
    pub occupant_count: u32,
    #[serde(default = "default_density")]
    pub density: DensityCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverride>,
    #[serde(default)]
    pub adjacent: Vec<ZoneId>,
}

fn default_density() -> DensityCategory {
    DensityCategory::Free
}

impl Zone {
    pub fn new(id: impl Into<ZoneId>, name: impl Into<String>, boundary: Vec<Coordinate>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            boundary,
            capacity,
            occupant_count: 0,
            density: DensityCategory::Free,
            manual_override: None,
            adjacent: Vec::new(),
        }
    }

    pub fn has_valid_boundary(&self) -> bool {
        self.boundary.len() >= 3
    }

    /// Admin-side validation, run before a zone is accepted.
    pub fn validate(&self) -> Result<()> {
        if !self.has_valid_boundary() {
            return Err(CoreError::InvalidPolygon {
                zone_id: self.id.clone(),
                vertices: self.boundary.len(),
            });
        }
        if self.capacity == 0 {
            return Err(CoreError::InvalidCapacity {
                zone_id: self.id.clone(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Where a user currently is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ZoneAssignment {
    Zone(ZoneId),
    Outside,
    Unknown,
}

impl ZoneAssignment {
    pub fn zone_id(&self) -> Option<&str> {
        match self {
            ZoneAssignment::Zone(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneAssignment::Zone(id) => f.write_str(id),
            ZoneAssignment::Outside => f.write_str("outside"),
            ZoneAssignment::Unknown => f.write_str("unknown"),
        }
    }
}

// Serialized as a bare string: the zone id, "outside" or "unknown".
impl Serialize for ZoneAssignment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ZoneAssignment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "outside" => ZoneAssignment::Outside,
            "unknown" => ZoneAssignment::Unknown,
            _ => ZoneAssignment::Zone(s),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPosition {
    pub user_id: String,
    pub coordinate: Coordinate,
    pub observed_at: DateTime<Utc>,
    pub assigned_zone_id: ZoneAssignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Moderate,
    High,
}

impl CongestionLevel {
    pub fn from_max_rank(rank: u32) -> Self {
        match rank {
            0 => CongestionLevel::Low,
            1 | 2 => CongestionLevel::Moderate,
            _ => CongestionLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: Vec<ZoneId>,
    pub congestion_level: CongestionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_path: Option<Vec<ZoneId>>,
}

impl Route {
    pub fn alternative_available(&self) -> bool {
        self.alternative_path.is_some()
    }

    /// High congestion with no way around it.
    pub fn congestion_unavoidable(&self) -> bool {
        self.congestion_level == CongestionLevel::High && self.alternative_path.is_none()
    }
}
