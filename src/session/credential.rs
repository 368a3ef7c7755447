//! Session credential and refresh grant types.
//!
//! Expiry hints stored here are informational only. Whether a credential is
//! still accepted is discovered from server responses, never from the clock.

use serde::{Deserialize, Serialize};

/// Access/refresh token pair plus arbitrary metadata.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    /// Opaque access token sent with every authenticated request.
    pub access_token: String,

    /// Opaque refresh token used to obtain a new access token.
    pub refresh_token: String,

    /// Token type, typically "Bearer".
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Unix timestamp at which the access token was obtained.
    #[serde(default)]
    pub obtained_at: i64,

    /// Server-provided expiry hint (Unix timestamp). Not trusted.
    #[serde(default)]
    pub expires_at: Option<i64>,

    /// Application-defined data carried alongside the tokens.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Create a credential obtained now, with no expiry hint and no metadata.
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
            obtained_at: chrono::Utc::now().timestamp(),
            expires_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the expiry hint relative to now.
    #[must_use]
    pub fn with_expires_in(mut self, expires_in: i64) -> Self {
        self.expires_at = Some(chrono::Utc::now().timestamp() + expires_in);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Value of the `Authorization` header for this credential.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Produce the credential that results from a successful refresh.
    ///
    /// The access token is replaced. The refresh token is kept unless the
    /// grant carries a non-empty new one. Metadata is preserved.
    #[must_use]
    pub fn refreshed(&self, grant: TokenGrant) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut next = self.clone();
        next.access_token = grant.access_token;
        if let Some(rt) = grant.refresh_token.filter(|rt| !rt.is_empty()) {
            next.refresh_token = rt;
        }
        if let Some(tt) = grant.token_type.filter(|tt| !tt.is_empty()) {
            next.token_type = tt;
        }
        next.obtained_at = now;
        next.expires_at = grant.expires_in.map(|ei| now + ei);
        next
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Token endpoint response for a refresh grant.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_credential() {
        let cred = Credential::new("access", "refresh");
        assert_eq!(cred.token_type, "Bearer");
        assert_eq!(cred.access_token, "access");
        assert_eq!(cred.refresh_token, "refresh");
        assert!(cred.expires_at.is_none());
        assert!(cred.obtained_at > 0);
        assert_eq!(cred.authorization_header(), "Bearer access");
    }

    #[test]
    fn test_refreshed_keeps_refresh_token_when_absent() {
        let cred = Credential::new("old", "refresh-1").with_metadata("user", "u1".into());
        let next = cred.refreshed(TokenGrant {
            access_token: "new".into(),
            refresh_token: None,
            expires_in: Some(3600),
            token_type: None,
        });
        assert_eq!(next.access_token, "new");
        assert_eq!(next.refresh_token, "refresh-1");
        assert_eq!(next.token_type, "Bearer");
        assert_eq!(next.metadata.get("user"), Some(&serde_json::json!("u1")));
        assert!(next.expires_at.is_some());
    }

    #[test]
    fn test_refreshed_rotates_refresh_token() {
        let cred = Credential::new("old", "refresh-1");
        let next = cred.refreshed(TokenGrant {
            access_token: "new".into(),
            refresh_token: Some("refresh-2".into()),
            expires_in: None,
            token_type: Some("DPoP".into()),
        });
        assert_eq!(next.refresh_token, "refresh-2");
        assert_eq!(next.authorization_header(), "DPoP new");
        assert!(next.expires_at.is_none());
    }

    #[test]
    fn test_refreshed_ignores_empty_refresh_token() {
        let cred = Credential::new("old", "refresh-1");
        let next = cred.refreshed(TokenGrant {
            access_token: "new".into(),
            refresh_token: Some(String::new()),
            expires_in: None,
            token_type: None,
        });
        assert_eq!(next.refresh_token, "refresh-1");
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let cred = Credential::new("super-secret-access", "super-secret-refresh");
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_minimal() {
        let cred: Credential =
            serde_json::from_str(r#"{"access_token":"a","refresh_token":"r"}"#).unwrap();
        assert_eq!(cred.token_type, "Bearer");
        assert!(cred.metadata.is_empty());
    }

    #[test]
    fn test_grant_parses_standard_response() {
        let grant: TokenGrant = serde_json::from_str(
            r#"{"access_token":"a","token_type":"Bearer","expires_in":3600}"#,
        )
        .unwrap();
        assert_eq!(grant.access_token, "a");
        assert_eq!(grant.expires_in, Some(3600));
        assert!(grant.refresh_token.is_none());
    }
}
