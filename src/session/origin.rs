//! HTTP calls against the origin site.
//!
//! The broker never interprets a session token. It only asks the origin
//! for one (cached session lookup, or a fresh login with stored
//! credentials) and tells the origin to drop one on logout.

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderMap, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::broker::config::{OriginSettings, join_url};

use super::store::Credentials;

/// Result of a successful origin login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginLogin {
    pub token: Vec<u8>,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("origin request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("origin returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("origin login response carried no `{0}` cookie")]
    MissingCookie(String),
    #[error("invalid logout method {0:?}")]
    InvalidMethod(String),
    #[error("session token is not valid cookie text")]
    InvalidToken,
}

#[async_trait]
pub trait OriginSiteClient: Send + Sync {
    /// Current session token the origin holds for `username`, if any.
    async fn fetch_session(&self, username: &str) -> Result<Option<Vec<u8>>, OriginError>;

    async fn login(&self, credentials: &Credentials) -> Result<OriginLogin, OriginError>;

    /// Best-effort invalidation of `token` on the origin.
    async fn logout(&self, token: &[u8]) -> Result<(), OriginError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

/// [`OriginSiteClient`] over the origin's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpOriginClient {
    client: Client,
    settings: OriginSettings,
}

impl HttpOriginClient {
    pub fn new(settings: OriginSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.settings.root_url, path)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, OriginError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OriginError::Status { status, body })
}

#[async_trait]
impl OriginSiteClient for HttpOriginClient {
    async fn fetch_session(&self, username: &str) -> Result<Option<Vec<u8>>, OriginError> {
        let response = self
            .client
            .get(self.url("/api/session"))
            .query(&[("username", username)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let session: SessionResponse = ensure_success(response).await?.json().await?;
        Ok(Some(session.token.into_bytes()))
    }

    async fn login(&self, credentials: &Credentials) -> Result<OriginLogin, OriginError> {
        let response = self
            .client
            .post(self.url("/login"))
            .json(&LoginRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let cookie_name = &self.settings.session_cookie;
        let token = session_cookie(response.headers(), cookie_name)
            .ok_or_else(|| OriginError::MissingCookie(cookie_name.clone()))?;
        // Identity in the body is optional; fall back to the login name.
        let body: LoginResponse = response.json().await.unwrap_or(LoginResponse {
            user_id: None,
            username: None,
        });
        let username = body
            .username
            .unwrap_or_else(|| credentials.username.clone());
        Ok(OriginLogin {
            token: token.into_bytes(),
            user_id: body.user_id.unwrap_or_else(|| username.clone()),
            username,
        })
    }

    async fn logout(&self, token: &[u8]) -> Result<(), OriginError> {
        let method = Method::from_bytes(self.settings.logout_method.as_bytes())
            .map_err(|_| OriginError::InvalidMethod(self.settings.logout_method.clone()))?;
        let token = std::str::from_utf8(token).map_err(|_| OriginError::InvalidToken)?;
        let response = self
            .client
            .request(method, self.settings.logout_url())
            .header(COOKIE, format!("{}={}", self.settings.session_cookie, token))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Value of the `name` cookie set by a response, if any.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().to_owned())
}
