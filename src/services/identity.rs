//! Bearer token identity lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::UserConfig;

/// Coarse capability attached to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May create, drive and terminate sessions it owns.
    Admin,
    /// May only join sessions.
    Player,
}

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Resolves opaque tokens into identities.
pub trait IdentityProvider: Send + Sync {
    /// Identity behind `token`, or `None` when the token is unknown.
    fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Static token table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct TokenDirectory {
    tokens: HashMap<String, Identity>,
}

impl TokenDirectory {
    pub fn new(users: &[UserConfig]) -> Self {
        let tokens = users
            .iter()
            .map(|user| {
                (
                    user.token.clone(),
                    Identity {
                        user_id: user.user_id,
                        role: user.role,
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

impl IdentityProvider for TokenDirectory {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_tokens_only() {
        let admin = Uuid::new_v4();
        let directory = TokenDirectory::new(&[UserConfig {
            token: "secret".into(),
            user_id: admin,
            role: Role::Admin,
        }]);

        let identity = directory.authenticate("secret").unwrap();
        assert_eq!(identity.user_id, admin);
        assert!(identity.is_admin());
        assert!(directory.authenticate("guess").is_none());
    }
}
