//! Token authentication seam
//!
//! Credential checking is a black box to the rest of the service: anything
//! that can turn a user/pass into a session token and a token back into a
//! principal will do. The bundled implementation keeps a static credential
//! table from the config and sessions in memory.

use crate::config::UserConfig;
use crate::now_ms;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Authenticated identity attached to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
}

/// An issued session
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at_ms: u64,
}

pub trait Authenticator: Send + Sync + 'static {
    /// Check credentials and mint a session token
    fn authenticate(&self, user: &str, pass: &str) -> Option<Session>;

    /// Resolve a token to its principal, if still valid
    fn validate(&self, token: &str) -> Option<Principal>;
}

struct SessionRecord {
    user: String,
    expires_at_ms: u64,
}

/// Authenticator over the config's demo credential table
pub struct StaticAuthenticator {
    credentials: HashMap<String, String>,
    sessions: DashMap<String, SessionRecord>,
    session_ttl: Duration,
}

impl StaticAuthenticator {
    pub fn new(users: &[UserConfig], session_ttl: Duration) -> Self {
        Self {
            credentials: users
                .iter()
                .map(|u| (u.name.clone(), u.pass.clone()))
                .collect(),
            sessions: DashMap::new(),
            session_ttl,
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, user: &str, pass: &str) -> Option<Session> {
        match self.credentials.get(user) {
            Some(expected) if expected == pass => {
                let token = Uuid::new_v4().to_string();
                let expires_at_ms = now_ms() + self.session_ttl.as_millis() as u64;
                self.sessions.insert(
                    token.clone(),
                    SessionRecord {
                        user: user.to_string(),
                        expires_at_ms,
                    },
                );
                Some(Session {
                    token,
                    expires_at_ms,
                })
            }
            _ => None,
        }
    }

    fn validate(&self, token: &str) -> Option<Principal> {
        let record = self.sessions.get(token)?;
        if now_ms() > record.expires_at_ms {
            drop(record);
            self.sessions.remove(token);
            return None;
        }
        Some(Principal {
            user: record.user.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> StaticAuthenticator {
        StaticAuthenticator::new(
            &[UserConfig {
                name: "alice".into(),
                pass: "secret".into(),
            }],
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn valid_credentials_yield_a_working_token() {
        let auth = authenticator();
        let session = auth.authenticate("alice", "secret").unwrap();
        let principal = auth.validate(&session.token).unwrap();
        assert_eq!(principal.user, "alice");
    }

    #[test]
    fn bad_credentials_and_bad_tokens_are_rejected() {
        let auth = authenticator();
        assert!(auth.authenticate("alice", "wrong").is_none());
        assert!(auth.authenticate("bob", "secret").is_none());
        assert!(auth.validate("no-such-token").is_none());
    }

    #[test]
    fn expired_sessions_stop_validating() {
        let auth = StaticAuthenticator::new(
            &[UserConfig {
                name: "alice".into(),
                pass: "secret".into(),
            }],
            Duration::from_millis(0),
        );
        let session = auth.authenticate("alice", "secret").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(auth.validate(&session.token).is_none());
    }
}
