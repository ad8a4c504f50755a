//! Identity and login
//!
//! Login is delegated to an external email-link provider; this module only
//! requests the link, records the resulting identity, and notifies anyone
//! watching when the identity changes.
//!
//! The authenticated session is persisted to `<data_dir>/auth.json` so a
//! restarted host resumes where it left off.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::local::atomic_write;

/// Default wait suggested when the provider rate-limits without a hint
const DEFAULT_LOGIN_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Stable identifier of a logged-in user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Returns `None` for empty or whitespace-only ids
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate and normalize an email address
pub fn normalize_email(email: &str) -> SyncResult<String> {
    let trimmed = email.trim();
    let invalid = || SyncError::InvalidEmail {
        email: email.to_string(),
    };

    let (local, domain) = trimmed.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || trimmed.chars().any(char::is_whitespace)
    {
        return Err(invalid());
    }

    Ok(trimmed.to_lowercase())
}

/// Persisted login session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: UserId,
    pub email: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub signed_in_at: DateTime<Utc>,
}

/// Session/identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Ask the provider to email a login link
    async fn request_login_link(&self, email: &str) -> SyncResult<()>;

    /// The identity currently logged in, if any
    fn current_identity(&self) -> Option<UserId>;

    /// Observe identity changes (login, logout, switch)
    fn subscribe(&self) -> watch::Receiver<Option<UserId>>;

    /// Forget the current identity
    async fn sign_out(&self) -> SyncResult<()>;
}

/// Bearer tokens for requests made on behalf of the logged-in user
#[async_trait]
pub trait AccessTokens: Send + Sync {
    /// Token of the current session, if any
    fn access_token(&self) -> Option<String>;

    /// Exchange the refresh token for a new access token
    ///
    /// `rejected` is the token the backend just refused. When the session
    /// already holds a different one, that token is returned without a new
    /// exchange. Fails with `NotLoggedIn` when the session cannot be renewed.
    async fn refresh_access_token(&self, rejected: Option<&str>) -> SyncResult<String>;
}

/// Shared identity bookkeeping: current session, watchers, persistence
struct IdentityState {
    tx: watch::Sender<Option<UserId>>,
    session: std::sync::Mutex<Option<AuthSession>>,
    session_path: Option<PathBuf>,
}

impl IdentityState {
    fn new(session_path: Option<PathBuf>) -> Self {
        let session = session_path.as_ref().and_then(|p| load_session(p));
        let (tx, _rx) = watch::channel(session.as_ref().map(|s| s.user_id.clone()));
        Self {
            tx,
            session: std::sync::Mutex::new(session),
            session_path,
        }
    }

    fn session(&self) -> Option<AuthSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn current(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    fn sign_in(&self, session: AuthSession) -> SyncResult<UserId> {
        if let Some(ref path) = self.session_path {
            let json = serde_json::to_vec_pretty(&session)?;
            atomic_write(path, &json).map_err(|e| SyncError::from_io(e, path.clone()))?;
        }

        let user_id = session.user_id.clone();
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
        self.tx.send_replace(Some(user_id.clone()));
        info!("Signed in as {}", user_id);
        Ok(user_id)
    }

    /// Replace the tokens of the current session without changing identity
    fn update_tokens(&self, access_token: String, refresh_token: Option<String>) -> SyncResult<()> {
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(ref mut session) = *guard else {
            return Err(SyncError::NotLoggedIn);
        };

        session.access_token = Some(access_token);
        if refresh_token.is_some() {
            session.refresh_token = refresh_token;
        }
        if let Some(ref path) = self.session_path {
            let json = serde_json::to_vec_pretty(&*session)?;
            atomic_write(path, &json).map_err(|e| SyncError::from_io(e, path.clone()))?;
        }
        Ok(())
    }

    fn sign_out(&self) -> SyncResult<()> {
        if let Some(ref path) = self.session_path {
            if path.exists() {
                fs::remove_file(path).map_err(|e| SyncError::from_io(e, path.clone()))?;
            }
        }

        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        if self.tx.send_replace(None).is_some() {
            info!("Signed out");
        }
        Ok(())
    }
}

fn load_session(path: &PathBuf) -> Option<AuthSession> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!("Ignoring unreadable login session {:?}: {}", path, e);
            None
        }
    }
}

/// Identity provider for the self-hosted backend
///
/// There is no mail server to send a link through, so requesting a link
/// signs in immediately. The normalized email is the identity, which lets
/// every device using the same address converge on one remote record.
pub struct LocalIdentityProvider {
    state: IdentityState,
}

impl LocalIdentityProvider {
    /// Provider without persistence
    pub fn new() -> Self {
        Self {
            state: IdentityState::new(None),
        }
    }

    /// Provider that persists the session to `path` and resumes it on startup
    pub fn with_session_file(path: PathBuf) -> Self {
        Self {
            state: IdentityState::new(Some(path)),
        }
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.state.session()
    }
}

impl Default for LocalIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn request_login_link(&self, email: &str) -> SyncResult<()> {
        let email = normalize_email(email)?;
        let user_id = UserId::new(email.clone()).ok_or(SyncError::InvalidEmail {
            email: email.clone(),
        })?;

        self.state.sign_in(AuthSession {
            user_id,
            email,
            access_token: None,
            refresh_token: None,
            signed_in_at: Utc::now(),
        })?;
        Ok(())
    }

    fn current_identity(&self) -> Option<UserId> {
        self.state.current()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.state.tx.subscribe()
    }

    async fn sign_out(&self) -> SyncResult<()> {
        self.state.sign_out()
    }
}

#[derive(Debug, Serialize)]
struct OtpRequest<'a> {
    email: &'a str,
    create_user: bool,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Passwordless email-link login against a hosted auth service
pub struct EmailLinkProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    state: IdentityState,
    /// Serializes token refreshes so a rotated refresh token is used once
    refresh_lock: tokio::sync::Mutex<()>,
}

impl EmailLinkProvider {
    pub fn new(base_url: &str, api_key: &str, session_path: Option<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            state: IdentityState::new(session_path),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.state.session()
    }

    fn otp_url(&self) -> String {
        format!("{}/auth/v1/otp", self.base_url)
    }

    fn user_url(&self) -> String {
        format!("{}/auth/v1/user", self.base_url)
    }

    fn token_url(&self) -> String {
        format!("{}/auth/v1/token", self.base_url)
    }

    /// Finish a login with the tokens carried by the emailed link
    ///
    /// Without a refresh token the session ends when the access token expires.
    pub async fn complete_login(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> SyncResult<UserId> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(SyncError::NotLoggedIn);
        }

        debug!("Resolving user for login token");
        let response = self
            .client
            .get(self.user_url())
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::backend(format!(
                "login callback rejected (HTTP {})",
                status.as_u16()
            )));
        }

        let user: ProviderUser = response.json().await?;
        let user_id = UserId::new(user.id)
            .ok_or_else(|| SyncError::backend("login callback returned an empty user id"))?;

        self.state.sign_in(AuthSession {
            user_id,
            email: user.email.unwrap_or_default(),
            access_token: Some(access_token.to_string()),
            refresh_token: refresh_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            signed_in_at: Utc::now(),
        })
    }
}

#[async_trait]
impl AccessTokens for EmailLinkProvider {
    fn access_token(&self) -> Option<String> {
        self.state.session().and_then(|s| s.access_token)
    }

    async fn refresh_access_token(&self, rejected: Option<&str>) -> SyncResult<String> {
        let _refreshing = self.refresh_lock.lock().await;

        let session = self.state.session().ok_or(SyncError::NotLoggedIn)?;
        if let Some(current) = session.access_token {
            if rejected != Some(current.as_str()) {
                return Ok(current);
            }
        }
        let Some(refresh_token) = session.refresh_token else {
            warn!("Access token expired and no refresh token is stored");
            return Err(SyncError::NotLoggedIn);
        };

        debug!("Refreshing access token for {}", session.user_id);
        let response = self
            .client
            .post(self.token_url())
            .header("apikey", &self.api_key)
            .query(&[("grant_type", "refresh_token")])
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            warn!("Token refresh rejected (HTTP {})", status.as_u16());
            return Err(SyncError::NotLoggedIn);
        }
        if !status.is_success() {
            return Err(SyncError::backend(format!(
                "token refresh failed (HTTP {})",
                status.as_u16()
            )));
        }

        let tokens: TokenResponse = response.json().await?;
        self.state
            .update_tokens(tokens.access_token.clone(), tokens.refresh_token)?;
        info!("Access token refreshed for {}", session.user_id);
        Ok(tokens.access_token)
    }
}

#[async_trait]
impl IdentityProvider for EmailLinkProvider {
    async fn request_login_link(&self, email: &str) -> SyncResult<()> {
        let email = normalize_email(email)?;

        let response = self
            .client
            .post(self.otp_url())
            .header("apikey", &self.api_key)
            .json(&OtpRequest {
                email: &email,
                create_user: true,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LOGIN_RETRY_AFTER);
            return Err(SyncError::LoginRateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(SyncError::backend(format!(
                "login link request failed (HTTP {})",
                status.as_u16()
            )));
        }

        info!("Login link sent to {}", email);
        Ok(())
    }

    fn current_identity(&self) -> Option<UserId> {
        self.state.current()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.state.tx.subscribe()
    }

    async fn sign_out(&self) -> SyncResult<()> {
        self.state.sign_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn signed_in(
        server: &MockServer,
        refresh_token: Option<&str>,
        session_path: Option<PathBuf>,
    ) -> EmailLinkProvider {
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "user-1", "email": "me@example.com"})),
            )
            .mount(server)
            .await;

        let provider = EmailLinkProvider::new(&server.uri(), "anon-key", session_path);
        provider
            .complete_login("old-token", refresh_token)
            .await
            .unwrap();
        provider
    }

    #[test]
    fn test_user_id_rejects_blank() {
        assert!(UserId::new("").is_none());
        assert!(UserId::new("   ").is_none());
        assert_eq!(UserId::new(" abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email("  Jane.Doe@Example.COM ").unwrap(),
            "jane.doe@example.com"
        );
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("jane@").is_err());
        assert!(normalize_email("jane@localhost").is_err());
        assert!(normalize_email("jane@a@b.com").is_err());
        assert!(normalize_email("ja ne@example.com").is_err());
    }

    #[tokio::test]
    async fn test_local_login_notifies_subscribers() {
        let provider = LocalIdentityProvider::new();
        let mut rx = provider.subscribe();
        assert!(rx.borrow().is_none());

        provider.request_login_link("Me@Example.com").await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().as_ref().map(UserId::as_str),
            Some("me@example.com")
        );
        assert_eq!(
            provider.current_identity().unwrap().as_str(),
            "me@example.com"
        );
    }

    #[tokio::test]
    async fn test_local_login_rejects_invalid_email() {
        let provider = LocalIdentityProvider::new();
        let err = provider.request_login_link("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidEmail { .. }));
        assert!(provider.current_identity().is_none());
    }

    #[tokio::test]
    async fn test_session_persists_across_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth.json");

        {
            let provider = LocalIdentityProvider::with_session_file(path.clone());
            provider.request_login_link("me@example.com").await.unwrap();
        }

        let resumed = LocalIdentityProvider::with_session_file(path.clone());
        assert_eq!(
            resumed.current_identity().unwrap().as_str(),
            "me@example.com"
        );

        resumed.sign_out().await.unwrap();
        assert!(resumed.current_identity().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_unreadable_session_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth.json");
        fs::write(&path, "{ broken").unwrap();

        let provider = LocalIdentityProvider::with_session_file(path);
        assert!(provider.current_identity().is_none());
    }

    #[test]
    fn test_email_link_urls() {
        let provider = EmailLinkProvider::new("https://auth.example.com/", "anon-key", None);
        assert_eq!(provider.otp_url(), "https://auth.example.com/auth/v1/otp");
        assert_eq!(provider.user_url(), "https://auth.example.com/auth/v1/user");
        assert_eq!(provider.token_url(), "https://auth.example.com/auth/v1/token");
        assert!(provider.access_token().is_none());
    }

    #[tokio::test]
    async fn test_email_link_rejects_invalid_email_without_request() {
        // Unroutable URL: validation must fail before any request is made
        let provider = EmailLinkProvider::new("http://127.0.0.1:9", "anon-key", None);
        let err = provider.request_login_link("bad").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidEmail { .. }));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_persists_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(json!({"refresh_token": "refresh-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-token",
                "refresh_token": "refresh-2",
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let session_path = temp_dir.path().join("auth.json");
        let provider = signed_in(&server, Some("refresh-1"), Some(session_path.clone())).await;
        assert_eq!(provider.access_token().as_deref(), Some("old-token"));

        let token = provider
            .refresh_access_token(Some("old-token"))
            .await
            .unwrap();
        assert_eq!(token, "new-token");

        // A caller still holding the old token gets the new one without another exchange
        let token = provider
            .refresh_access_token(Some("old-token"))
            .await
            .unwrap();
        assert_eq!(token, "new-token");

        let resumed = EmailLinkProvider::new(&server.uri(), "anon-key", Some(session_path));
        let session = resumed.session().unwrap();
        assert_eq!(session.user_id.as_str(), "user-1");
        assert_eq!(session.access_token.as_deref(), Some("new-token"));
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_not_logged_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let provider = signed_in(&server, Some("refresh-1"), None).await;
        let err = provider
            .refresh_access_token(Some("old-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_refresh_needs_refresh_token() {
        let server = MockServer::start().await;
        let provider = signed_in(&server, None, None).await;

        let err = provider
            .refresh_access_token(Some("old-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
    }

    #[test]
    fn test_session_without_refresh_token_still_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth.json");
        fs::write(
            &path,
            r#"{"user_id":"user-1","email":"me@example.com","access_token":"t","signed_in_at":"2026-03-01T12:00:00Z"}"#,
        )
        .unwrap();

        let provider = EmailLinkProvider::new("https://auth.example.com", "anon-key", Some(path));
        let session = provider.session().unwrap();
        assert_eq!(session.access_token.as_deref(), Some("t"));
        assert!(session.refresh_token.is_none());
    }
}
