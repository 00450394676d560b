//! Stream identity and connection ids.
//!
//! # Purpose
//! Derive the key that enforces one active stream per (user, session, endpoint).
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

const ANONYMOUS: &str = "anonymous";

/// Caller identity supplied by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub session_id: String,
}

impl Identity {
    pub fn new(user_id: Option<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id,
            session_id: session_id.into(),
        }
    }

    pub fn user(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(Some(user_id.into()), session_id)
    }

    pub fn anonymous(session_id: impl Into<String>) -> Self {
        Self::new(None, session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn derive(identity: &Identity, path: &str) -> Self {
        let path_hash = hex::encode(Sha256::digest(path.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(identity.user_id.as_deref().unwrap_or(ANONYMOUS).as_bytes());
        hasher.update(b"|");
        hasher.update(identity.session_id.as_bytes());
        hasher.update(b"|");
        hasher.update(path_hash.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_stable() {
        let identity = Identity::user("9", "abc");
        assert_eq!(
            IdentityKey::derive(&identity, "/stream"),
            IdentityKey::derive(&identity, "/stream")
        );
        assert_eq!(IdentityKey::derive(&identity, "/stream").as_str().len(), 64);
    }

    #[test]
    fn endpoints_and_users_do_not_collide() {
        let identity = Identity::user("9", "abc");
        let stream = IdentityKey::derive(&identity, "/stream");
        assert_ne!(stream, IdentityKey::derive(&identity, "/notifications"));
        assert_ne!(stream, IdentityKey::derive(&Identity::user("10", "abc"), "/stream"));
        assert_ne!(stream, IdentityKey::derive(&Identity::anonymous("abc"), "/stream"));
    }

    #[test]
    fn connection_id_round_trips_through_text() {
        let id = ConnectionId::new();
        assert_eq!(ConnectionId::parse(&id.to_string()), Some(id));
        assert_eq!(ConnectionId::parse("not-a-uuid"), None);
    }
}
