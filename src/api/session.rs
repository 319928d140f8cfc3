use parking_lot::RwLock;
use std::sync::Arc;

/// Local session state. Only the bearer token lives here; logging in is
/// someone else's job.
#[derive(Clone, Default)]
pub struct Session {
    token: Arc<RwLock<Option<String>>>,
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_is_unauthenticated() {
        assert!(!Session::new(Some(String::new())).is_authenticated());
        assert!(!Session::new(None).is_authenticated());
    }

    #[test]
    fn test_clear_is_shared_between_clones() {
        let session = Session::new(Some("abc".to_string()));
        let clone = session.clone();
        assert_eq!(clone.token().as_deref(), Some("abc"));

        session.clear();
        assert!(!clone.is_authenticated());

        clone.set_token("def".to_string());
        assert_eq!(session.token().as_deref(), Some("def"));
    }
}
