//! Backend REST client and OAuth token store
//!
//! Two endpoints matter to the agent: `POST /oauth/token` with the
//! `authorization_code` and `refresh_token` grants. Tokens live in a
//! readers-writer-guarded cache; every mutation funnels through one setter
//! that fires the `on_update` hook (the orchestrator binds it to the disk
//! writer) before the new tokens become visible to any caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AppError, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached OAuth tokens with their expiries.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    pub access_token: String,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token: String,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    pub fn access_valid(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && self
                .access_token_expires_at
                .map(|at| at > now)
                .unwrap_or(false)
    }

    pub fn refresh_valid(&self, now: DateTime<Utc>) -> bool {
        !self.refresh_token.is_empty()
            && self
                .refresh_token_expires_at
                .map(|at| at > now)
                .unwrap_or(false)
    }
}

/// Hook invoked with the new token set on every mutation.
pub type OnUpdateToken = Arc<dyn Fn(&TokenSet) + Send + Sync>;

/// Token endpoint response envelope.
#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<OAuthTokenData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthTokenData {
    access_token: String,
    access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh_token: String,
    refresh_token_expires_at: Option<DateTime<Utc>>,
}

/// Client for the device backend.
pub struct ServeApi {
    base_url: Url,
    client_id: String,
    client: Client,
    tokens: RwLock<TokenSet>,
    on_update: std::sync::RwLock<Option<OnUpdateToken>>,
}

impl ServeApi {
    pub fn new(base_url: &str, client_id: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid backend url {base_url}: {e}")))?;

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            base_url,
            client_id: client_id.into(),
            client,
            tokens: RwLock::new(TokenSet::default()),
            on_update: std::sync::RwLock::new(None),
        })
    }

    /// Bind the persistence hook. The hook runs inside the token write lock
    /// so on-disk state reflects a refresh before the caller sees it.
    pub fn set_on_update(&self, hook: OnUpdateToken) {
        *self.on_update.write().unwrap() = Some(hook);
    }

    /// Replace the cached tokens. A new set with an empty refresh token
    /// keeps the previous refresh token and its expiry.
    pub async fn set_tokens(&self, new_tokens: TokenSet) {
        let mut tokens = self.tokens.write().await;
        apply_tokens(&mut tokens, new_tokens);
        self.notify(&tokens);
    }

    /// Return a usable access token, refreshing it transparently.
    ///
    /// The fast path only takes the read lock. When a refresh is needed the
    /// read lock is released first, the write lock re-checks (another caller
    /// may have refreshed in between), and the refresh runs under the write
    /// lock so concurrent readers never observe half-updated state.
    pub async fn get_access_token(&self) -> Result<String> {
        let now = Utc::now();
        {
            let tokens = self.tokens.read().await;
            if tokens.access_valid(now) {
                return Ok(tokens.access_token.clone());
            }
            if !tokens.refresh_valid(now) {
                return Err(AppError::NoAuth);
            }
        }

        let mut tokens = self.tokens.write().await;
        let now = Utc::now();
        if tokens.access_valid(now) {
            return Ok(tokens.access_token.clone());
        }
        if !tokens.refresh_valid(now) {
            return Err(AppError::NoAuth);
        }

        debug!("access token expired, refreshing");
        let refresh_token = tokens.refresh_token.clone();
        match self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .await
        {
            Ok(new_tokens) => {
                apply_tokens(&mut tokens, new_tokens);
                self.notify(&tokens);
                Ok(tokens.access_token.clone())
            }
            Err(e) => {
                warn!("token refresh failed: {}", e);
                *tokens = TokenSet::default();
                self.notify(&tokens);
                Err(e)
            }
        }
    }

    /// Exchange an authorization code for tokens.
    pub async fn post_oauth_token_code(&self, code: &str, state: &str) -> Result<()> {
        let new_tokens = self
            .request_token(&[
                ("code", code),
                ("state", state),
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
            ])
            .await?;

        self.set_tokens(new_tokens).await;
        Ok(())
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenSet> {
        let url = self
            .base_url
            .join("/oauth/token")
            .map_err(|e| AppError::Config(format!("oauth token url: {e}")))?;

        let response = self.client.post(url).form(form).send().await?;
        if !response.status().is_success() {
            warn!("oauth token endpoint returned {}", response.status());
            return Err(AppError::NoAuth);
        }

        let body: OAuthTokenResponse = response.json().await?;
        let Some(data) = body.data else {
            warn!("oauth token response without data: {} {}", body.code, body.msg);
            return Err(AppError::NoAuth);
        };

        Ok(TokenSet {
            access_token: data.access_token,
            access_token_expires_at: data.access_token_expires_at,
            refresh_token: data.refresh_token,
            refresh_token_expires_at: data.refresh_token_expires_at,
        })
    }

    fn notify(&self, tokens: &TokenSet) {
        let hook = self.on_update.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(tokens);
        }
    }

    /// WebSocket endpoint carrying signaling replies.
    pub fn device_response_url(&self, id: &str) -> Result<Url> {
        self.ws_url(&format!("/ws/device/{id}/response"))
    }

    /// WebSocket endpoint receiving PCM audio and returning transcripts.
    pub fn device_stt_url(&self, id: &str) -> Result<Url> {
        self.ws_url(&format!("/ws/device/{id}/stt"))
    }

    fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(AppError::Config(format!(
                    "cannot derive websocket url from scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::Config("websocket scheme rejected".to_string()))?;
        url.set_path(path);

        Ok(url)
    }
}

/// The access token is always replaced; the refresh token only when the new
/// set actually carries one.
fn apply_tokens(tokens: &mut TokenSet, new_tokens: TokenSet) {
    tokens.access_token = new_tokens.access_token;
    tokens.access_token_expires_at = new_tokens.access_token_expires_at;

    if !new_tokens.refresh_token.is_empty() {
        tokens.refresh_token = new_tokens.refresh_token;
        tokens.refresh_token_expires_at = new_tokens.refresh_token_expires_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn valid_tokens() -> TokenSet {
        let now = Utc::now();
        TokenSet {
            access_token: "access".to_string(),
            access_token_expires_at: Some(now + ChronoDuration::hours(1)),
            refresh_token: "refresh".to_string(),
            refresh_token_expires_at: Some(now + ChronoDuration::days(30)),
        }
    }

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        let tokens = valid_tokens();
        assert!(tokens.access_valid(now));
        assert!(tokens.refresh_valid(now));

        let expired = TokenSet {
            access_token_expires_at: Some(now - ChronoDuration::seconds(1)),
            ..valid_tokens()
        };
        assert!(!expired.access_valid(now));

        let empty = TokenSet::default();
        assert!(!empty.access_valid(now));
        assert!(!empty.refresh_valid(now));

        let no_expiry = TokenSet {
            access_token: "x".to_string(),
            ..Default::default()
        };
        assert!(!no_expiry.access_valid(now));
    }

    #[tokio::test]
    async fn test_cached_token_returned_without_refresh() {
        let api = ServeApi::new("https://backend.example", "device").unwrap();
        api.set_tokens(valid_tokens()).await;

        assert_eq!(api.get_access_token().await.unwrap(), "access");
    }

    #[tokio::test]
    async fn test_no_auth_when_both_tokens_stale() {
        let api = ServeApi::new("https://backend.example", "device").unwrap();
        let now = Utc::now();
        api.set_tokens(TokenSet {
            access_token: "a".to_string(),
            access_token_expires_at: Some(now - ChronoDuration::hours(1)),
            refresh_token: "r".to_string(),
            refresh_token_expires_at: Some(now - ChronoDuration::hours(1)),
        })
        .await;

        assert!(matches!(
            api.get_access_token().await,
            Err(AppError::NoAuth)
        ));
    }

    #[tokio::test]
    async fn test_setter_fires_update_hook() {
        let api = ServeApi::new("https://backend.example", "device").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in_hook = calls.clone();
        api.set_on_update(Arc::new(move |tokens| {
            assert_eq!(tokens.access_token, "access");
            calls_in_hook.fetch_add(1, Ordering::SeqCst);
        }));

        api.set_tokens(valid_tokens()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_refresh_keeps_previous() {
        let api = ServeApi::new("https://backend.example", "device").unwrap();
        api.set_tokens(valid_tokens()).await;

        api.set_tokens(TokenSet {
            access_token: "new-access".to_string(),
            access_token_expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            ..Default::default()
        })
        .await;

        let tokens = api.tokens.read().await;
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token, "refresh");
    }

    #[test]
    fn test_ws_url_scheme_coercion() {
        let api = ServeApi::new("https://backend.example:8443/base", "device").unwrap();
        let url = api.device_response_url("dev-1").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/ws/device/dev-1/response");

        let api = ServeApi::new("http://backend.example", "device").unwrap();
        let url = api.device_stt_url("dev-1").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ws/device/dev-1/stt");
    }
}
