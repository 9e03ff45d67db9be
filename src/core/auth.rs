use std::collections::HashSet;
use std::sync::RwLock;

use crate::core::error::RelayError;

/// Validates the token a publisher presents inside its RTMP `connect`
/// command object (`token` field, falling back to `app`).
///
/// Thread-safe behind an `RwLock` so it can be shared as a plain
/// `Arc<TokenAuthenticator>`; tokens can be added and removed at runtime
/// for rotation without restarting the relay.
#[derive(Debug)]
pub struct TokenAuthenticator {
    tokens: RwLock<HashSet<String>>,
}

impl TokenAuthenticator {
    pub fn new(tokens: &[String]) -> Self {
        let set = tokens
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect::<HashSet<_>>();
        Self {
            tokens: RwLock::new(set),
        }
    }

    /// Check a token; `Ok(())` means the session may proceed.
    pub fn authenticate(&self, token: &str) -> Result<(), RelayError> {
        if token.is_empty() {
            return Err(RelayError::Auth("empty token".into()));
        }
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        if tokens.contains(token) {
            Ok(())
        } else {
            Err(RelayError::Auth("invalid token".into()))
        }
    }

    pub fn add_token(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token.to_string());
    }

    pub fn remove_token(&self, token: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.remove(token);
    }

    pub fn token_count(&self) -> usize {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_known_token() {
        let auth = TokenAuthenticator::new(&["secret-token".to_string()]);
        assert!(auth.authenticate("secret-token").is_ok());
        assert!(auth.authenticate("wrong").is_err());
        assert!(auth.authenticate("").is_err());
    }

    #[test]
    fn test_empty_tokens_are_ignored() {
        let auth = TokenAuthenticator::new(&[String::new(), "a".to_string()]);
        assert_eq!(auth.token_count(), 1);
    }

    #[test]
    fn test_rotation() {
        let auth = TokenAuthenticator::new(&["old".to_string()]);
        auth.add_token("new");
        auth.remove_token("old");
        assert!(auth.authenticate("old").is_err());
        assert!(auth.authenticate("new").is_ok());
        assert_eq!(auth.token_count(), 1);
    }
}
