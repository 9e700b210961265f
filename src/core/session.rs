/// Per-download invalidation tokens
///
/// Every start or resume mints a fresh opaque token; pause/cancel drops it.
/// In-flight callbacks pass the token they were spawned with and stop as
/// soon as it no longer matches.
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct SessionManager {
    tokens: Mutex<HashMap<i64, Uuid>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token, replacing any prior one.
    pub fn create_session(&self, id: i64) -> Uuid {
        let token = Uuid::new_v4();
        self.tokens.lock().unwrap().insert(id, token);
        token
    }

    /// True when `token` matches the stored one. A `None` token is
    /// unconditional and always current.
    pub fn is_current(&self, id: i64, token: Option<Uuid>) -> bool {
        match token {
            None => true,
            Some(token) => self.tokens.lock().unwrap().get(&id) == Some(&token),
        }
    }

    /// Drop the token; all outstanding callbacks for `id` become stale.
    pub fn invalidate(&self, id: i64) {
        self.tokens.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_current() {
        let sessions = SessionManager::new();
        let token = sessions.create_session(1);
        assert!(sessions.is_current(1, Some(token)));
        assert!(sessions.is_current(1, None));
    }

    #[test]
    fn test_invalidate_drops_token() {
        let sessions = SessionManager::new();
        let token = sessions.create_session(1);
        sessions.invalidate(1);
        assert!(!sessions.is_current(1, Some(token)));
        // unconditional checks still pass
        assert!(sessions.is_current(1, None));
    }

    #[test]
    fn test_new_session_replaces_old() {
        let sessions = SessionManager::new();
        let old = sessions.create_session(1);
        let new = sessions.create_session(1);
        assert!(!sessions.is_current(1, Some(old)));
        assert!(sessions.is_current(1, Some(new)));
    }

    #[test]
    fn test_sessions_are_per_download() {
        let sessions = SessionManager::new();
        let a = sessions.create_session(1);
        let b = sessions.create_session(2);
        sessions.invalidate(1);
        assert!(!sessions.is_current(1, Some(a)));
        assert!(sessions.is_current(2, Some(b)));
    }
}
