//! Invitation code allocation on top of the store's atomic activation.

use std::{ops::RangeInclusive, time::SystemTime};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::dao::{
    models::ActivationOutcome, session_store::SessionStore, storage::StorageError,
};

/// Six digit codes players type to join.
pub const CODE_RANGE: RangeInclusive<u32> = 100_000..=999_999;
/// Collisions tolerated before activation gives up.
pub const MAX_ATTEMPTS: u32 = 10;

/// Source of candidate invitation codes.
pub trait CodeSource: Send + Sync {
    /// Draw the next candidate code.
    fn next_code(&self) -> u32;
}

/// Uniformly random codes drawn from [`CODE_RANGE`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeSource for RandomCodes {
    fn next_code(&self) -> u32 {
        rand::rng().random_range(CODE_RANGE)
    }
}

/// Reasons an activation request fails.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Every candidate code collided with another active session.
    #[error("no invitation code could be reserved after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// The session does not exist.
    #[error("session not found")]
    NotFound,
    /// The caller is not the session's admin.
    #[error("caller does not own the session")]
    NotOwner,
    /// The session was terminated and can never be reactivated.
    #[error("session has been terminated")]
    Closed,
    /// The store failed while attempting the activation.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Activate `session_id` for `admin_id` and return its invitation code.
///
/// Re-activating an already active session returns the code it already holds.
pub async fn activate(
    store: &dyn SessionStore,
    codes: &dyn CodeSource,
    session_id: Uuid,
    admin_id: Uuid,
) -> Result<u32, ActivationError> {
    for attempt in 1..=MAX_ATTEMPTS {
        let code = codes.next_code();
        match store
            .try_activate(session_id, admin_id, code, SystemTime::now())
            .await?
        {
            ActivationOutcome::Activated => {
                info!(session_id = %session_id, code, attempt, "session activated");
                return Ok(code);
            }
            ActivationOutcome::AlreadyActive { code } => return Ok(code),
            ActivationOutcome::CodeTaken => {
                debug!(session_id = %session_id, code, attempt, "invitation code collision");
            }
            ActivationOutcome::Closed => return Err(ActivationError::Closed),
            ActivationOutcome::NotOwner => return Err(ActivationError::NotOwner),
            ActivationOutcome::NotFound => return Err(ActivationError::NotFound),
        }
    }

    error!(
        session_id = %session_id,
        attempts = MAX_ATTEMPTS,
        "invitation code allocation exhausted"
    );
    Err(ActivationError::Exhausted {
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;
    use crate::dao::{models::SessionEntity, session_store::MemorySessionStore};

    struct Fixed(u32);

    impl CodeSource for Fixed {
        fn next_code(&self) -> u32 {
            self.0
        }
    }

    struct Sequence(Mutex<Vec<u32>>);

    impl CodeSource for Sequence {
        fn next_code(&self) -> u32 {
            self.0.lock().unwrap().remove(0)
        }
    }

    async fn waiting_session(store: &MemorySessionStore, admin_id: Uuid) -> Uuid {
        let session = SessionEntity::waiting(Uuid::new_v4(), admin_id);
        let id = session.id;
        store.create_session(session).await.unwrap();
        id
    }

    #[test]
    fn random_codes_stay_in_range() {
        for _ in 0..1000 {
            assert!(CODE_RANGE.contains(&RandomCodes.next_code()));
        }
    }

    #[tokio::test]
    async fn exhausted_after_ten_collisions_and_session_stays_inactive() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let holder = waiting_session(&store, admin).await;
        activate(&store, &Fixed(424_242), holder, admin).await.unwrap();

        let target = waiting_session(&store, admin).await;
        let err = activate(&store, &Fixed(424_242), target, admin)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::Exhausted { attempts: 10 }));

        let session = store.find_session(target).await.unwrap().unwrap();
        assert!(!session.is_active);
        assert_eq!(session.invitation_code, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_activations_drawing_one_code_have_one_winner() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let session_id = waiting_session(&store, admin).await;
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                activate(&store, &Fixed(515_151), session_id, admin).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(code) => {
                    assert_eq!(code, 515_151);
                    winners += 1;
                }
                Err(err) => assert!(matches!(err, ActivationError::Exhausted { .. })),
            }
        }
        assert_eq!(winners, 1);
        assert!(store.find_active_by_code(515_151).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_activations_get_distinct_codes() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let session_id = waiting_session(&store, admin).await;
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                activate(&store, &RandomCodes, session_id, admin).await
            }));
        }

        let mut codes = HashSet::new();
        for handle in handles {
            let code = handle.await.unwrap().unwrap();
            assert!(codes.insert(code), "code {code} handed out twice");
        }
        assert_eq!(codes.len(), 32);
    }

    #[tokio::test]
    async fn retries_past_a_collision() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let holder = waiting_session(&store, admin).await;
        activate(&store, &Fixed(111_111), holder, admin).await.unwrap();

        let target = waiting_session(&store, admin).await;
        let codes = Sequence(Mutex::new(vec![111_111, 111_111, 222_222]));
        assert_eq!(activate(&store, &codes, target, admin).await.unwrap(), 222_222);
    }

    #[tokio::test]
    async fn reactivation_returns_the_existing_code() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let id = waiting_session(&store, admin).await;

        let first = activate(&store, &RandomCodes, id, admin).await.unwrap();
        let second = activate(&store, &RandomCodes, id, admin).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store
                .find_active_by_code(first)
                .await
                .unwrap()
                .map(|s| s.id),
            Some(id)
        );
    }

    #[tokio::test]
    async fn terminated_or_foreign_sessions_cannot_be_activated() {
        let store = MemorySessionStore::new();
        let admin = Uuid::new_v4();
        let id = waiting_session(&store, admin).await;

        let err = activate(&store, &RandomCodes, id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::NotOwner));

        store.deactivate(id, SystemTime::now()).await.unwrap();
        let err = activate(&store, &RandomCodes, id, admin).await.unwrap_err();
        assert!(matches!(err, ActivationError::Closed));

        let err = activate(&store, &RandomCodes, Uuid::new_v4(), admin)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::NotFound));
    }
}
