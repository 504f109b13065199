//! OAuth token lifecycle for MCP servers.
//!
//! Stored credentials carry a Unix expiry; we refresh proactively inside a
//! 5-minute window so a token never expires mid-request. The refresh grant
//! goes straight to the `token_url` embedded in the credentials blob, so no
//! discovery round-trip is ever needed.

use std::time::Duration;

use chrono::Utc;

use tb_domain::credentials::{OAuthConfig, OAuthCredentials, TokenResponse};

/// Proactive refresh window: refresh when less than 5 minutes remain.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;

/// Default `expires_in` when the token response omits it.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Check if the access token is expired or about to expire.
///
/// Missing expiry info means the token is assumed valid — the call will
/// fail naturally if it is not.
pub fn is_token_expired(credentials: &OAuthCredentials) -> bool {
    let Some(expires_at) = credentials.expires_at else {
        return false;
    };
    let now = Utc::now().timestamp();
    now >= expires_at - TOKEN_REFRESH_BUFFER_SECS
}

/// Refresh an expired OAuth token using the refresh_token grant.
///
/// Uses HTTP Basic auth when a `client_secret` is configured; otherwise the
/// `client_id` travels in the form body (public client). Returns the
/// updated credentials — with the previous `refresh_token` preserved when
/// the provider did not rotate it, and `oauth_config` carried over so later
/// refreshes need no external lookup — or `None` on any failure.
pub async fn refresh_oauth_token(
    client: &reqwest::Client,
    server_name: &str,
    credentials: &OAuthCredentials,
    oauth_config: &OAuthConfig,
    timeout: Duration,
) -> Option<OAuthCredentials> {
    let Some(refresh_token) = credentials.refresh_token.as_deref() else {
        tracing::warn!(server = server_name, "no refresh_token available");
        return None;
    };
    let Some(token_url) = oauth_config.token_url.as_deref() else {
        tracing::warn!(server = server_name, "no token_url configured");
        return None;
    };
    if oauth_config.client_id.is_empty() {
        tracing::warn!(server = server_name, "no client_id configured");
        return None;
    }

    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    let mut request = client
        .post(token_url)
        .header("Accept", "application/json")
        .timeout(timeout);

    match oauth_config.client_secret.as_deref() {
        Some(secret) => {
            request = request.basic_auth(&oauth_config.client_id, Some(secret));
        }
        None => {
            form.push(("client_id", oauth_config.client_id.as_str()));
        }
    }

    tracing::info!(server = server_name, "refreshing OAuth token");

    let response = match request.form(&form).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(server = server_name, error = %e, "token refresh request failed");
            return None;
        }
    };

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            server = server_name,
            status = status.as_u16(),
            body = %body,
            "token refresh rejected"
        );
        return None;
    }

    let token: TokenResponse = match response.json().await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(server = server_name, error = %e, "token response was not valid JSON");
            return None;
        }
    };

    let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let expires_at = Utc::now().timestamp() + expires_in as i64;

    tracing::info!(server = server_name, expires_at, "OAuth token refreshed");

    Some(OAuthCredentials {
        access_token: Some(token.access_token),
        // Keep the old refresh token when the provider did not rotate it.
        refresh_token: token
            .refresh_token
            .or_else(|| credentials.refresh_token.clone()),
        expires_at: Some(expires_at),
        token_type: token.token_type.or(Some("Bearer".into())),
        oauth_config: credentials
            .oauth_config
            .clone()
            .or_else(|| Some(oauth_config.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds_expiring_at(offset_secs: i64) -> OAuthCredentials {
        OAuthCredentials {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            expires_at: Some(Utc::now().timestamp() + offset_secs),
            token_type: Some("Bearer".into()),
            oauth_config: None,
        }
    }

    #[test]
    fn missing_expiry_is_valid() {
        let creds = OAuthCredentials::default();
        assert!(!is_token_expired(&creds));
    }

    #[test]
    fn already_expired() {
        assert!(is_token_expired(&creds_expiring_at(-10)));
    }

    #[test]
    fn inside_refresh_window_is_expired() {
        // 299 s left < 300 s buffer.
        assert!(is_token_expired(&creds_expiring_at(299)));
    }

    #[test]
    fn outside_refresh_window_is_valid() {
        // 301 s left > 300 s buffer.
        assert!(!is_token_expired(&creds_expiring_at(301)));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_returns_none() {
        let client = reqwest::Client::new();
        let creds = OAuthCredentials {
            refresh_token: None,
            ..creds_expiring_at(-10)
        };
        let cfg = OAuthConfig {
            client_id: "cid".into(),
            token_url: Some("http://127.0.0.1:9/token".into()),
            ..Default::default()
        };
        let out =
            refresh_oauth_token(&client, "Test", &creds, &cfg, Duration::from_secs(1)).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn refresh_without_token_url_returns_none() {
        let client = reqwest::Client::new();
        let creds = creds_expiring_at(-10);
        let cfg = OAuthConfig {
            client_id: "cid".into(),
            token_url: None,
            ..Default::default()
        };
        let out =
            refresh_oauth_token(&client, "Test", &creds, &cfg, Duration::from_secs(1)).await;
        assert!(out.is_none());
    }
}
