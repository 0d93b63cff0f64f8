use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::core::types::Etag;
use crate::index::table::{IndexShared, IndexState};

/// Database statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub uptime_secs: u64,
    pub start_time: DateTime<Utc>,

    // Document store
    pub document_count: usize,
    pub current_etag: Etag,
    pub wal_size_bytes: u64,

    pub indexes: Vec<IndexStatus>,
}

/// Inspection view of one map-reduce index.
///
/// This is where asynchronous index failures surface: a `Put` that broke
/// the map function succeeds, and the failure shows up here as `Corrupted`
/// with the error text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub name: String,
    pub state: IndexState,
    pub checkpoint: Etag,
    pub store_etag: Etag,
    pub row_count: usize,
    pub contributing_documents: usize,
    pub error: Option<String>,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl IndexStatus {
    pub fn capture(index: &IndexShared, store_etag: Etag) -> Self {
        let table = index.read();
        let state = match table.state {
            IndexState::Idle if table.checkpoint < store_etag => IndexState::Stale,
            state => state,
        };
        IndexStatus {
            name: index.name.clone(),
            state,
            checkpoint: table.checkpoint,
            store_etag,
            row_count: table.rows.len(),
            contributing_documents: table.contributing_documents,
            error: table.error.clone(),
            last_indexed_at: table.last_indexed_at,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.checkpoint < self.store_etag
    }
}

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Unhealthy(_) => 2,
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: u64,
}

impl HealthCheck {
    pub fn for_index(status: &IndexStatus) -> Self {
        let (health, message) = match status.state {
            IndexState::Corrupted => {
                let error = status.error.clone().unwrap_or_else(|| "corrupted".to_string());
                (HealthStatus::Unhealthy(error.clone()), Some(error))
            }
            IndexState::Building => (
                HealthStatus::Degraded("building".to_string()),
                Some(format!("checkpoint {} of {}", status.checkpoint, status.store_etag)),
            ),
            IndexState::Stale | IndexState::Idle => (HealthStatus::Healthy, None),
        };
        HealthCheck {
            name: format!("index:{}", status.name),
            status: health,
            message,
            latency_ms: 0,
        }
    }
}

impl HealthCheckResult {
    /// Worst individual status wins.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| &c.status)
            .max_by_key(|s| s.severity())
            .cloned()
            .unwrap_or(HealthStatus::Healthy);
        HealthCheckResult {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }
}
