use std::{future::Future, time::Duration};

use tokio::time::timeout;
use tracing::warn;

use crate::{
    error::ServiceError,
    state::{
        Plan,
        live::SessionRuntime,
        state_machine::{SessionEvent, SessionPhase},
    },
};

/// Plan `event`, run `work` under `limit`, then apply the plan on success or
/// abort it on failure so the phase is left untouched.
///
/// The caller holds the session lock, so at most one transition is in flight
/// per session.
pub async fn run_transition<F, Fut, T>(
    runtime: &mut SessionRuntime,
    event: SessionEvent,
    limit: Duration,
    work: F,
) -> Result<(T, SessionPhase), ServiceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let Plan { id: plan_id, .. } = runtime.machine.plan(event.clone())?;

    let outcome = match timeout(limit, work()).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout),
    };

    match outcome {
        Ok(value) => {
            let next = runtime.machine.apply(plan_id)?;
            Ok((value, next))
        }
        Err(err) => {
            if let Err(abort_err) = runtime.machine.abort(plan_id) {
                warn!(
                    event = ?event,
                    plan_id = %plan_id,
                    error = ?abort_err,
                    "failed to abort transition after work error"
                );
            }
            Err(err)
        }
    }
}
