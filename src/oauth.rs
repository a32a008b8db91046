use crate::config::AppDefaults;
use crate::errors::{AppError, AppResult, AuthError};
use crate::types::now_ms;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Google omits `expires_in` only in broken responses; assume its usual lifetime.
const FALLBACK_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// The session's OAuth grant. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    access_token: String,
    refresh_token: Option<String>,
    pub expires_at_ms: i64,
    #[serde(default)]
    pub last_error: Option<AuthError>,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at_ms", &self.expires_at_ms)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl TokenRecord {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at_ms: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at_ms,
            last_error: None,
        }
    }

    /// Build a record from a fresh grant (`expires_in` relative to now).
    pub fn from_grant(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<Duration>,
    ) -> Self {
        Self::new(
            access_token,
            refresh_token,
            expiry_from(now_ms(), expires_in),
        )
    }

    /// The access token for an upstream call. Refuses when the record carries a
    /// lifecycle error, since the token is then stale.
    pub fn bearer(&self) -> Result<&str, AuthError> {
        if let Some(err) = self.last_error {
            return Err(err);
        }
        if self.access_token.is_empty() {
            return Err(AuthError::NotAuthenticated);
        }
        Ok(&self.access_token)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }

    fn with_error(&self, err: AuthError) -> Self {
        let mut next = self.clone();
        next.last_error = Some(err);
        next
    }
}

fn expiry_from(now_ms: i64, expires_in: Option<Duration>) -> i64 {
    let lifetime = expires_in.unwrap_or(FALLBACK_EXPIRES_IN);
    now_ms.saturating_add(i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX))
}

pub(crate) fn build_client(
    client_id: &str,
    client_secret: Option<&str>,
    auth_url: &str,
    token_url: &str,
) -> AppResult<BasicClient> {
    let auth_url = AuthUrl::new(auth_url.to_string())
        .map_err(|e| AppError::Config(format!("invalid auth url {auth_url}: {e}")))?;
    let token_url = TokenUrl::new(token_url.to_string())
        .map_err(|e| AppError::Config(format!("invalid token url {token_url}: {e}")))?;

    Ok(BasicClient::new(
        ClientId::new(client_id.to_string()),
        client_secret.map(|s| ClientSecret::new(s.to_string())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(oauth2::AuthType::RequestBody))
}

/// Keeps a `TokenRecord` usable: fast path when unexpired, refresh otherwise.
#[derive(Clone)]
pub struct TokenManager {
    client: BasicClient,
    timeout: Duration,
}

impl TokenManager {
    pub fn new(
        client_id: &str,
        client_secret: Option<&str>,
        auth_url: &str,
        token_url: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            client: build_client(client_id, client_secret, auth_url, token_url)?,
            timeout,
        })
    }

    pub fn from_defaults(defaults: &AppDefaults) -> AppResult<Self> {
        let client_id = defaults
            .client_id
            .as_deref()
            .ok_or_else(|| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;
        Self::new(
            client_id,
            defaults.client_secret.as_deref(),
            &defaults.auth_url,
            &defaults.token_url,
            defaults.request_timeout,
        )
    }

    pub async fn get_valid_token(&self, record: &TokenRecord) -> Result<TokenRecord, AuthError> {
        self.get_valid_token_at(record, now_ms()).await
    }

    /// Refresh failures do not fail the call: the returned record carries
    /// `last_error` and keeps the stale access token.
    pub async fn get_valid_token_at(
        &self,
        record: &TokenRecord,
        now_ms: i64,
    ) -> Result<TokenRecord, AuthError> {
        if record.access_token.is_empty() && record.refresh_token.is_none() {
            return Err(AuthError::NotAuthenticated);
        }

        if record.is_valid_at(now_ms) {
            return Ok(record.clone());
        }

        let Some(refresh) = record.refresh_token.as_deref() else {
            warn!("Access token expired and no refresh token is stored");
            return Ok(record.with_error(AuthError::NoRefreshToken));
        };

        debug!(expired_at_ms = record.expires_at_ms, "Refreshing access token");
        match self.exchange_refresh(refresh).await {
            Ok(grant) => {
                info!("Access token refreshed");
                Ok(TokenRecord {
                    access_token: grant.access_token,
                    refresh_token: grant
                        .refresh_token
                        .or_else(|| record.refresh_token.clone()),
                    expires_at_ms: expiry_from(now_ms, grant.expires_in),
                    last_error: None,
                })
            }
            Err(err) => {
                warn!(error = %err, "Refresh token exchange failed");
                Ok(record.with_error(AuthError::RefreshFailed))
            }
        }
    }

    async fn exchange_refresh(&self, refresh: &str) -> Result<RefreshedGrant, String> {
        let refresh = RefreshToken::new(refresh.to_string());
        let request = self
            .client
            .exchange_refresh_token(&refresh)
            .request_async(async_http_client);

        let token_res = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| format!("token endpoint timed out after {:?}", self.timeout))?
            .map_err(|e| e.to_string())?;

        Ok(RefreshedGrant {
            access_token: token_res.access_token().secret().to_string(),
            refresh_token: token_res.refresh_token().map(|r| r.secret().to_string()),
            expires_in: token_res.expires_in(),
        })
    }
}

struct RefreshedGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<Duration>,
}
