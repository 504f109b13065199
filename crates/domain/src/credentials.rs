//! OAuth credential blobs stored per MCP server.
//!
//! The credentials column on a server config row is a JSON document that
//! embeds everything needed to refresh the token without any external
//! lookup — including the `oauth_config` captured at consent time.

use serde::{Deserialize, Serialize};

/// Stored OAuth credentials for one MCP server.
///
/// `Debug` is manually implemented to redact secrets.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when the access token expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// OAuth endpoints and client credentials captured at consent time,
    /// so refreshes never need re-discovery.
    #[serde(default)]
    pub oauth_config: Option<OAuthConfig>,
}

impl OAuthCredentials {
    /// Leniently parse a stored credentials blob. Corrupt JSON is treated
    /// as absence (the caller demands re-auth when the token is needed).
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("oauth_config", &self.oauth_config)
            .finish()
    }
}

/// OAuth client configuration for one MCP server.
///
/// `Debug` is manually implemented to redact the client secret.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("authorization_url", &self.authorization_url)
            .field("token_url", &self.token_url)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Response from an OAuth token endpoint (both initial grant and refresh).
///
/// `Debug` is manually implemented to redact secrets.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_blob() {
        let raw = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "expires_at": 1700000000,
            "token_type": "Bearer",
            "oauth_config": {
                "client_id": "cid",
                "token_url": "https://auth.example.com/token"
            }
        }"#;
        let creds = OAuthCredentials::parse(raw).unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("at"));
        assert_eq!(creds.expires_at, Some(1_700_000_000));
        assert_eq!(creds.oauth_config.unwrap().client_id, "cid");
    }

    #[test]
    fn parse_corrupt_blob_is_none() {
        assert!(OAuthCredentials::parse("{not json").is_none());
        assert!(OAuthCredentials::parse("").is_none());
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = OAuthCredentials {
            access_token: Some("very-secret".into()),
            refresh_token: Some("also-secret".into()),
            ..Default::default()
        };
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(!dbg.contains("also-secret"));
        assert!(dbg.contains("[REDACTED]"));
    }
}
