//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::designers::{PasswordScheme, PlaintextScheme};
use crate::locks::LockManager;
use crate::remote::RemoteStore;
use crate::sessions::{ImportGate, SessionTracker};

/// Everything the handlers need, shared behind an `Arc`.
pub struct AppState {
    pub config: Config,
    /// `None` when Supabase credentials are not configured; every data path
    /// then uses the Excel files directly.
    pub store: Option<RemoteStore>,
    pub locks: LockManager,
    pub sessions: SessionTracker,
    pub import_gate: Arc<ImportGate>,
    pub passwords: Box<dyn PasswordScheme>,
}

impl AppState {
    /// Builds the state from a resolved configuration.
    pub fn new(config: Config) -> Self {
        let store = RemoteStore::from_config(&config);
        if store.is_some() {
            log::info!("Supabase configured, remote-first mode");
        } else {
            log::warn!("Supabase not configured, running in file-only mode");
        }
        AppState {
            config,
            store,
            locks: LockManager::new(),
            sessions: SessionTracker::new(),
            import_gate: Arc::new(ImportGate::new()),
            passwords: Box::new(PlaintextScheme),
        }
    }
}
