//! Tracks active sessions for shutdown drain. Not on the hot per-frame
//! path: only touched once per connection, on accept and on close.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::session::SessionId;

#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        id: SessionId,
        cancel: CancellationToken,
    ) {
        self.sessions.lock().expect("registry mutex poisoned").insert(id, cancel);
    }

    pub fn remove(
        &self,
        id: SessionId,
    ) {
        self.sessions.lock().expect("registry mutex poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry mutex poisoned").len()
    }

    /// Cancels every tracked session. Used to force-close stragglers once
    /// the shutdown drain deadline elapses.
    pub fn cancel_all(&self) {
        for cancel in self.sessions.lock().expect("registry mutex poisoned").values() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_track_len() {
        let registry = Registry::new();
        let id = uuid::Uuid::new_v4();
        registry.insert(id, CancellationToken::new());
        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn cancel_all_cancels_every_tracked_token() {
        let registry = Registry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        registry.insert(uuid::Uuid::new_v4(), a.clone());
        registry.insert(uuid::Uuid::new_v4(), b.clone());
        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
