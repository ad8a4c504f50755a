//! Hosted remote store over a PostgREST-style HTTP API
//!
//! Row-level security on the backend restricts each row to its owner, so
//! every request carries the logged-in user's access token. A request the
//! backend rejects as unauthorized is retried once with a refreshed token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RemoteStore, REMOTE_TABLE};
use crate::error::{SyncError, SyncResult};
use crate::identity::{AccessTokens, UserId};
use crate::payload::{RemoteRecord, SyncedPayload};

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    user_id: String,
    payload: SyncedPayload,
    updated_at: DateTime<Utc>,
}

/// Remote store on a hosted database REST endpoint
pub struct RestRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    tokens: Option<Arc<dyn AccessTokens>>,
}

impl RestRemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            tokens: None,
        }
    }

    /// Authenticate requests as the logged-in user
    pub fn with_tokens(mut self, tokens: Arc<dyn AccessTokens>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, REMOTE_TABLE)
    }

    fn headers(&self, access_token: Option<&str>) -> SyncResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&self.api_key)?);
        let bearer = access_token.unwrap_or(&self.api_key);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            header_value(&format!("Bearer {}", bearer))?,
        );
        Ok(headers)
    }

    /// Send a request built by `build`, refreshing the access token once on 401
    async fn send<F>(&self, build: F) -> SyncResult<reqwest::Response>
    where
        F: Fn(HeaderMap) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.as_ref().and_then(|t| t.access_token());
        let response = build(self.headers(token.as_deref())?).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(ref tokens) = self.tokens else {
            return Ok(response);
        };

        debug!("Access token rejected, refreshing");
        let fresh = tokens.refresh_access_token(token.as_deref()).await?;
        let response = build(self.headers(Some(&fresh))?).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::NotLoggedIn);
        }
        Ok(response)
    }
}

fn header_value(value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SyncError::backend("credentials contain characters not allowed in headers"))
}

async fn check_status(response: reqwest::Response, action: &str) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SyncError::backend(format!(
        "{} failed (HTTP {}): {}",
        action,
        status.as_u16(),
        body.trim()
    )))
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn fetch_record(&self, user_id: &UserId) -> SyncResult<Option<RemoteRecord>> {
        debug!("Fetching remote record for {}", user_id);
        let url = self.table_url();
        let query = [
            ("user_id", format!("eq.{}", user_id)),
            ("select", "*".to_string()),
        ];
        let response = self
            .send(|headers| self.client.get(&url).headers(headers).query(&query))
            .await?;

        let rows: Vec<Row> = check_status(response, "fetch").await?.json().await?;
        Ok(rows.into_iter().next().map(|row| RemoteRecord {
            user_id: user_id.clone(),
            payload: row.payload,
            updated_at: row.updated_at,
        }))
    }

    async fn upsert_record(
        &self,
        user_id: &UserId,
        payload: &SyncedPayload,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        debug!("Upserting remote record for {}", user_id);
        let row = Row {
            user_id: user_id.to_string(),
            payload: payload.clone(),
            updated_at,
        };

        let url = self.table_url();
        let response = self
            .send(|headers| {
                self.client
                    .post(&url)
                    .headers(headers)
                    .header(CONTENT_TYPE, "application/json")
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .query(&[("on_conflict", "user_id")])
                    .json(&row)
            })
            .await?;

        check_status(response, "upsert").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EmailLinkProvider;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Backend that knows one user and answers `old-token` with 401
    async fn backend(refresh: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "user-1", "email": "me@example.com"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(refresh)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/user_state"))
            .and(header("authorization", "Bearer old-token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_table_url() {
        let store = RestRemoteStore::new("https://db.example.com/", "anon-key");
        assert_eq!(store.table_url(), "https://db.example.com/rest/v1/user_state");
    }

    #[test]
    fn test_headers_prefer_access_token() {
        let store = RestRemoteStore::new("https://db.example.com", "anon-key");
        let headers = store.headers(Some("user-token")).unwrap();

        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer user-token"
        );
    }

    #[test]
    fn test_headers_fall_back_to_api_key() {
        let store = RestRemoteStore::new("https://db.example.com", "anon-key");
        let headers = store.headers(None).unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer anon-key"
        );
    }

    #[test]
    fn test_row_wire_format() {
        let json = r#"{
            "user_id": "0b7c",
            "payload": {"bankAccounts": "[]"},
            "updated_at": "2026-03-01T12:00:00+00:00"
        }"#;
        let row: Row = serde_json::from_str(json).unwrap();
        assert_eq!(row.user_id, "0b7c");
        assert_eq!(row.payload.get("bankAccounts"), Some("[]"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let store = RestRemoteStore::new("http://127.0.0.1:9", "anon-key");
        let err = store
            .fetch_record(&UserId::new("user-1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_retried() {
        let server = backend(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-token",
            "refresh_token": "refresh-2"
        })))
        .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/user_state"))
            .and(header("authorization", "Bearer new-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "user_id": "user-1",
                "payload": {"bankAccounts": "[]"},
                "updated_at": "2026-03-01T12:00:00+00:00"
            }])))
            .expect(1)
            .mount(&server)
            .await;

        let provider = Arc::new(EmailLinkProvider::new(&server.uri(), "anon-key", None));
        let user = provider
            .complete_login("old-token", Some("refresh-1"))
            .await
            .unwrap();
        let store = RestRemoteStore::new(&server.uri(), "anon-key").with_tokens(provider.clone());

        let record = store.fetch_record(&user).await.unwrap().unwrap();
        assert_eq!(record.payload.get("bankAccounts"), Some("[]"));
        assert_eq!(provider.access_token().as_deref(), Some("new-token"));
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_not_logged_in() {
        let server = backend(ResponseTemplate::new(400)).await;

        let provider = Arc::new(EmailLinkProvider::new(&server.uri(), "anon-key", None));
        let user = provider
            .complete_login("old-token", Some("refresh-1"))
            .await
            .unwrap();
        let store = RestRemoteStore::new(&server.uri(), "anon-key").with_tokens(provider);

        let err = store.fetch_record(&user).await.unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
        assert!(!err.is_transient());
    }
}
