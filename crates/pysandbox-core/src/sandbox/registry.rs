//! `SessionRegistry`: session id to runtime, created lazily, never evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::mount::validate_session_id;
use super::runtime::{SandboxContext, SandboxRuntime};
use crate::error::{SandboxError, SandboxResult};

/// Process-wide map of live session runtimes.
///
/// Passed explicitly to the components that need it. `get_or_create` is atomic
/// per id: two near-simultaneous callers for a new id receive the same
/// runtime, and that runtime's own init gate guarantees one setup pass.
#[derive(Debug)]
pub struct SessionRegistry {
    context: SandboxContext,
    sessions: Mutex<HashMap<String, Arc<SandboxRuntime>>>,
}

impl SessionRegistry {
    pub fn new(context: SandboxContext) -> Self {
        Self {
            context,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SandboxContext {
        &self.context
    }

    /// The runtime for `session_id`, creating (but not initializing) it on first use.
    pub fn get_or_create(&self, session_id: &str) -> SandboxResult<Arc<SandboxRuntime>> {
        validate_session_id(session_id)
            .map_err(|_| SandboxError::InvalidSession(session_id.to_string()))?;

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let runtime = sessions.entry(session_id.to_string()).or_insert_with(|| {
            debug!(session_id = %session_id, "creating session runtime");
            Arc::new(SandboxRuntime::new(session_id, self.context.clone()))
        });
        Ok(Arc::clone(runtime))
    }

    /// Resolve `session_id` and bring its runtime to `Ready`.
    pub async fn get_initialized(&self, session_id: &str) -> SandboxResult<Arc<SandboxRuntime>> {
        let runtime = self.get_or_create(session_id)?;
        if !runtime.initialize(&self.context.config.cache_dir).await {
            return Err(SandboxError::InitializationFailed(format!(
                "session {session_id} could not start its interpreter"
            )));
        }
        Ok(runtime)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SandboxRuntime>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Known session ids, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
