use crate::types::{Coordinate, UserPosition, Zone, ZoneId};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use geojson::feature::Id;
use geojson::{GeoJson, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Persistent home of zone records. Capacity, name and boundary belong to the
/// admin side; density and occupancy are written back by the orchestrator.
#[async_trait]
pub trait ZoneRepository: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<Zone>>;
    async fn get_zone(&self, id: &str) -> Result<Option<Zone>>;
    async fn upsert_zone(&self, zone: Zone) -> Result<()>;
    async fn delete_zone(&self, id: &str) -> Result<()>;
}

/// Where refreshed user positions are written.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn record_position(&self, position: UserPosition) -> Result<()>;
    async fn remove_position(&self, user_id: &str) -> Result<()>;
}

/// Process-local store; keeps zones in insertion order.
#[derive(Default)]
pub struct MemoryZoneStore {
    zones: RwLock<Vec<Zone>>,
    positions: RwLock<HashMap<String, UserPosition>>,
}

impl MemoryZoneStore {
    pub async fn position(&self, user_id: &str) -> Option<UserPosition> {
        self.positions.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl ZoneRepository for MemoryZoneStore {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        Ok(self.zones.read().await.clone())
    }

    async fn get_zone(&self, id: &str) -> Result<Option<Zone>> {
        Ok(self.zones.read().await.iter().find(|z| z.id == id).cloned())
    }

    async fn upsert_zone(&self, zone: Zone) -> Result<()> {
        let mut zones = self.zones.write().await;
        match zones.iter_mut().find(|z| z.id == zone.id) {
            Some(existing) => *existing = zone,
            None => zones.push(zone),
        }
        Ok(())
    }

    async fn delete_zone(&self, id: &str) -> Result<()> {
        self.zones.write().await.retain(|z| z.id != id);
        Ok(())
    }
}

#[async_trait]
impl PositionSink for MemoryZoneStore {
    async fn record_position(&self, position: UserPosition) -> Result<()> {
        self.positions.write().await.insert(position.user_id.clone(), position);
        Ok(())
    }

    async fn remove_position(&self, user_id: &str) -> Result<()> {
        self.positions.write().await.remove(user_id);
        Ok(())
    }
}

/// Load zones from a GeoJSON FeatureCollection.
///
/// Each Polygon feature becomes a zone built from its outer ring. Properties:
/// `id` (string or number), `name`, `capacity`, and optionally
/// `occupantCount` and `adjacent` (array of ids). Features missing an id or
/// with non-polygon geometry are skipped.
pub fn load_zones_geojson(path: &Path) -> Result<Vec<Zone>> {
    info!(path = ?path, "loading zones");
    let file = File::open(path).with_context(|| format!("Failed to open zones file: {:?}", path))?;
    let reader = BufReader::new(file);

    let geojson = GeoJson::from_reader(reader).context("Failed to parse zones GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("Zones GeoJSON must be a FeatureCollection")),
    };

    let mut zones = Vec::new();

    for feature in collection.features {
        let feature_id = match &feature.id {
            Some(Id::String(s)) => Some(s.clone()),
            Some(Id::Number(n)) => Some(n.to_string()),
            None => None,
        };
        let props = feature.properties.unwrap_or_default();

        let id: ZoneId = match props.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => match feature_id {
                Some(id) => id,
                None => {
                    warn!("skipping zone feature without id");
                    continue;
                }
            },
        };

        let ring = match feature.geometry.map(|g| g.value) {
            Some(Value::Polygon(rings)) => match rings.into_iter().next() {
                Some(outer) => outer,
                None => continue,
            },
            _ => {
                warn!(zone_id = %id, "skipping zone with non-polygon geometry");
                continue;
            }
        };

        let mut boundary: Vec<Coordinate> = ring
            .iter()
            .filter(|pos| pos.len() >= 2)
            .map(|pos| Coordinate::new(pos[1], pos[0]))
            .collect();
        // GeoJSON rings repeat the first vertex at the end
        if boundary.len() > 1 && boundary.first() == boundary.last() {
            boundary.pop();
        }

        let name = props
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let capacity = read_u32(&props, "capacity")
            .ok_or_else(|| anyhow!("Zone '{}' has no numeric capacity", id))?;

        let mut zone = Zone::new(id, name, boundary, capacity);
        zone.occupant_count = read_u32(&props, "occupantCount").unwrap_or(0);
        zone.adjacent = props
            .get("adjacent")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        zones.push(zone);
    }

    info!(count = zones.len(), "loaded zones");
    Ok(zones)
}

fn read_u32(props: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<u32> {
    props.get(key).and_then(|v| v.as_u64()).and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ZONES: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "properties": { "id": "north", "name": "North Stand", "capacity": 200, "adjacent": ["south", 7] },
          "geometry": { "type": "Polygon", "coordinates": [[[-6.2, 53.3], [-6.1, 53.3], [-6.1, 53.4], [-6.2, 53.4], [-6.2, 53.3]]] }
        },
        {
          "type": "Feature",
          "id": 7,
          "properties": { "name": "Concourse", "capacity": 50, "occupantCount": 12 },
          "geometry": { "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]] }
        },
        {
          "type": "Feature",
          "properties": { "id": "flag", "capacity": 10 },
          "geometry": { "type": "Point", "coordinates": [0.0, 0.0] }
        },
        {
          "type": "Feature",
          "properties": { "capacity": 10 },
          "geometry": { "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]] }
        }
      ]
    }"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_polygon_features() {
        let file = write_temp(ZONES);
        let zones = load_zones_geojson(file.path()).unwrap();
        assert_eq!(zones.len(), 2);

        let north = &zones[0];
        assert_eq!(north.id, "north");
        assert_eq!(north.name, "North Stand");
        assert_eq!(north.capacity, 200);
        assert_eq!(north.boundary.len(), 4);
        assert_eq!(north.boundary[0], Coordinate::new(53.3, -6.2));
        assert_eq!(north.adjacent, vec!["south".to_string(), "7".to_string()]);

        let concourse = &zones[1];
        assert_eq!(concourse.id, "7");
        assert_eq!(concourse.occupant_count, 12);
        assert_eq!(concourse.boundary.len(), 3);
    }

    #[test]
    fn rejects_non_collection() {
        let file = write_temp(r#"{ "type": "Point", "coordinates": [0.0, 0.0] }"#);
        assert!(load_zones_geojson(file.path()).is_err());
    }

    #[test]
    fn missing_capacity_is_an_error() {
        let file = write_temp(
            r#"{ "type": "FeatureCollection", "features": [ { "type": "Feature", "properties": { "id": "x" },
                "geometry": { "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]] } } ] }"#,
        );
        assert!(load_zones_geojson(file.path()).is_err());
    }

    #[tokio::test]
    async fn memory_store_upsert_and_delete() {
        let store = MemoryZoneStore::default();
        let tri = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 1.0),
            Coordinate::new(1.0, 1.0),
        ];
        store.upsert_zone(Zone::new("a", "A", tri.clone(), 10)).await.unwrap();
        store.upsert_zone(Zone::new("b", "B", tri.clone(), 10)).await.unwrap();
        store.upsert_zone(Zone::new("a", "A2", tri, 20)).await.unwrap();

        let zones = store.list_zones().await.unwrap();
        assert_eq!(zones.iter().map(|z| z.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(store.get_zone("a").await.unwrap().unwrap().capacity, 20);

        store.delete_zone("a").await.unwrap();
        assert!(store.get_zone("a").await.unwrap().is_none());
        assert_eq!(store.list_zones().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_records_and_removes_positions() {
        let store = MemoryZoneStore::default();
        store
            .record_position(UserPosition {
                user_id: "u1".into(),
                coordinate: Coordinate::new(0.5, 0.5),
                observed_at: chrono::Utc::now(),
                assigned_zone_id: crate::types::ZoneAssignment::Unknown,
            })
            .await
            .unwrap();
        assert!(store.position("u1").await.is_some());

        store.remove_position("u1").await.unwrap();
        assert!(store.position("u1").await.is_none());
        // removing twice is not an error
        store.remove_position("u1").await.unwrap();
    }
}
