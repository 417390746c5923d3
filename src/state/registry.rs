use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::state::live::LiveSession;

/// Live sessions served by this process, indexed by id and invitation code.
///
/// Sessions are fully independent; the registry only hands out handles.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<LiveSession>>,
    codes: DashMap<u32, Uuid>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live session with the given id.
    pub fn get(&self, id: &Uuid) -> Option<Arc<LiveSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Live session currently holding `code`.
    pub fn by_code(&self, code: u32) -> Option<Arc<LiveSession>> {
        let id = *self.codes.get(&code)?.value();
        self.get(&id)
    }

    /// Register `live` unless another handle already serves the same session,
    /// returning whichever handle is registered.
    pub fn insert_or_get(&self, live: Arc<LiveSession>) -> Arc<LiveSession> {
        let registered = self
            .sessions
            .entry(live.id)
            .or_insert_with(|| live.clone())
            .value()
            .clone();
        self.codes.insert(registered.code, registered.id);
        registered
    }

    /// Drop a session once it ended.
    pub fn remove(&self, id: &Uuid) {
        if let Some((_, live)) = self.sessions.remove(id) {
            self.codes.remove_if(&live.code, |_, owner| *owner == live.id);
        }
    }

    /// Drop `live` only if it is the handle currently registered for its id.
    pub fn remove_handle(&self, live: &Arc<LiveSession>) {
        if self
            .sessions
            .remove_if(&live.id, |_, registered| Arc::ptr_eq(registered, live))
            .is_some()
        {
            self.codes.remove_if(&live.code, |_, owner| *owner == live.id);
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::SessionEntity;

    fn live(entity: &SessionEntity, code: u32) -> Arc<LiveSession> {
        Arc::new(LiveSession::new(entity, code, Vec::new(), 0))
    }

    #[test]
    fn first_registration_wins() {
        let registry = SessionRegistry::new();
        let entity = SessionEntity::waiting(Uuid::new_v4(), Uuid::new_v4());
        let first = registry.insert_or_get(live(&entity, 111_111));
        let second = registry.insert_or_get(live(&entity, 111_111));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.by_code(111_111).is_some());
    }

    #[test]
    fn removal_frees_the_code() {
        let registry = SessionRegistry::new();
        let entity = SessionEntity::waiting(Uuid::new_v4(), Uuid::new_v4());
        registry.insert_or_get(live(&entity, 222_222));
        registry.remove(&entity.id);

        assert!(registry.is_empty());
        assert!(registry.by_code(222_222).is_none());
    }

    #[test]
    fn a_losing_handle_cannot_remove_the_registered_one() {
        let registry = SessionRegistry::new();
        let entity = SessionEntity::waiting(Uuid::new_v4(), Uuid::new_v4());
        let registered = registry.insert_or_get(live(&entity, 333_333));
        let loser = live(&entity, 333_333);

        registry.remove_handle(&loser);
        assert_eq!(registry.len(), 1);

        registry.remove_handle(&registered);
        assert!(registry.is_empty());
        assert!(registry.by_code(333_333).is_none());
    }
}
