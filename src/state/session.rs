use std::time::SystemTime;

use uuid::Uuid;

use crate::dao::models::SessionEntity;

/// Durable lifecycle of a session, decoded from its persisted flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, never activated.
    Waiting,
    /// Activated and holding an invitation code.
    Active {
        code: u32,
        since: Option<SystemTime>,
        /// Question whose answer window is open, if any.
        current_question: Option<Uuid>,
    },
    /// Terminated. Never reactivated.
    Closed {
        from: Option<SystemTime>,
        to: SystemTime,
    },
}

impl SessionStatus {
    /// Whether players may currently join with the session's code.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active { .. })
    }
}

impl From<&SessionEntity> for SessionStatus {
    fn from(entity: &SessionEntity) -> Self {
        if let Some(to) = entity.activated_to {
            return SessionStatus::Closed {
                from: entity.activated_from,
                to,
            };
        }
        match (entity.is_active, entity.invitation_code) {
            (true, Some(code)) => SessionStatus::Active {
                code,
                since: entity.activated_from,
                current_question: entity
                    .current_question_id
                    .filter(|_| entity.is_question_active),
            },
            _ => SessionStatus::Waiting,
        }
    }
}
