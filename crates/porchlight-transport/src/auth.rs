//! Client authentication.

use porchlight_protocol::Login;

/// Decides whether a CONNECT may open a session.
pub trait Authenticator: Send + Sync {
    /// Check the credentials a client presented.
    fn authenticate(&self, client_id: &str, login: Option<&Login>) -> bool;
}

/// A single username/password pair shared by every client.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    /// Create a credential check for one username/password pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, _client_id: &str, login: Option<&Login>) -> bool {
        login.is_some_and(|l| l.username == self.username && l.password == self.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(username: &str, password: &str) -> Login {
        Login {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_static_credentials() {
        let auth = StaticCredentials::new("user", "pass");

        assert!(auth.authenticate("ESP8266-Button-1", Some(&login("user", "pass"))));
        assert!(!auth.authenticate("ESP8266-Button-1", Some(&login("user", "wrong"))));
        assert!(!auth.authenticate("ESP8266-Button-1", Some(&login("other", "pass"))));
        assert!(!auth.authenticate("ESP8266-Button-1", None));
    }
}
