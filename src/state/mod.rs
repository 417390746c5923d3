pub mod live;
pub mod registry;
pub mod session;
pub mod state_machine;
pub mod transitions;

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::SessionStore,
    services::{
        allocator::{CodeSource, RandomCodes},
        identity::IdentityProvider,
    },
};

pub use self::registry::SessionRegistry;
pub use self::state_machine::{AbortError, ApplyError, Plan, PlanError, PlanId};

pub type SharedState = Arc<AppState>;

#[derive(Debug, Clone)]
/// Handle used to push messages to a connected socket.
pub struct ClientConnection {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Message>,
}

impl ClientConnection {
    /// Wrap the outbound channel of a freshly accepted socket.
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Ask the writer task to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

/// Central application state shared by every route and socket task.
pub struct AppState {
    store: Arc<dyn SessionStore>,
    identity: Arc<dyn IdentityProvider>,
    codes: Arc<dyn CodeSource>,
    config: AppConfig,
    sessions: SessionRegistry,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentityProvider>,
        config: AppConfig,
    ) -> SharedState {
        Self::with_code_source(store, identity, Arc::new(RandomCodes), config)
    }

    /// Same as [`AppState::new`] with a custom invitation code source.
    pub fn with_code_source(
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentityProvider>,
        codes: Arc<dyn CodeSource>,
        config: AppConfig,
    ) -> SharedState {
        Arc::new(Self {
            store,
            identity,
            codes,
            config,
            sessions: SessionRegistry::new(),
        })
    }

    /// Durable storage backend.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Identity lookup for bearer tokens.
    pub fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    /// Candidate invitation codes for the allocator.
    pub fn codes(&self) -> &dyn CodeSource {
        self.codes.as_ref()
    }

    /// Immutable runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Sessions currently served by this process.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}
