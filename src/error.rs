use thiserror::Error;

use crate::types::ZoneId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("zone {zone_id}: boundary has {vertices} vertices, need at least 3")]
    InvalidPolygon { zone_id: ZoneId, vertices: usize },

    #[error("zone {zone_id}: capacity must be positive, got {capacity}")]
    InvalidCapacity { zone_id: ZoneId, capacity: u32 },

    #[error("invalid route endpoints: {origin} -> {destination}")]
    InvalidEndpoints { origin: ZoneId, destination: ZoneId },

    #[error("unknown zone: {0}")]
    UnknownZone(ZoneId),

    #[error("publish failed: {0}")]
    PublishFailure(String),

    #[error("sync orchestrator is not running")]
    OrchestratorStopped,
}

pub type Result<T> = std::result::Result<T, CoreError>;
