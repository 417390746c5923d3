use tokio::time::timeout;
use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Ping the storage backend and report the live session count.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let live_sessions = state.sessions().len();
    let limit = state.config().engine.transition_timeout();

    match timeout(limit, state.store().health_check()).await {
        Ok(Ok(())) => HealthResponse::ok(live_sessions),
        Ok(Err(err)) => {
            warn!(error = %err, "storage health check failed");
            HealthResponse::degraded(live_sessions)
        }
        Err(_) => {
            warn!("storage health check timed out");
            HealthResponse::degraded(live_sessions)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig, dao::session_store::MemorySessionStore, dto::health::HealthStatus,
        services::identity::TokenDirectory, state::AppState,
    };

    #[tokio::test]
    async fn offline_storage_reports_degraded() {
        let store = MemorySessionStore::new();
        let state = AppState::new(
            Arc::new(store.clone()),
            Arc::new(TokenDirectory::default()),
            AppConfig::default(),
        );
        assert_eq!(health_status(&state).await.status, HealthStatus::Ok);

        store.set_offline(true);
        assert_eq!(health_status(&state).await.status, HealthStatus::Degraded);
    }
}
