use serde::Serialize;
use utoipa::ToSchema;

/// Overall state reported by the `/healthcheck` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// The storage backend did not answer; live sessions keep running.
    Degraded,
}

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    /// Sessions served by this process.
    pub live_sessions: usize,
}

impl HealthResponse {
    pub fn ok(live_sessions: usize) -> Self {
        Self {
            status: HealthStatus::Ok,
            live_sessions,
        }
    }

    pub fn degraded(live_sessions: usize) -> Self {
        Self {
            status: HealthStatus::Degraded,
            live_sessions,
        }
    }
}
