//! Abstraction over the code-forge API (§4.4, §4.13).
//!
//! Business logic (outbox retry/classification, OAuth code-for-token exchange) depends
//! only on the `ForgeClient` trait, so it is fully testable against `FakeForgeClient`.
//! `GithubForgeClient` is the real `reqwest`-based implementation, grounded in the
//! request/header/error-status conventions of the teacher's device-flow client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const USER_AGENT: &str = "conductor";

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Signs a short-lived GitHub App JWT (RS256, §4.4 "acquire an installation token"). GitHub
/// rejects JWTs older than 10 minutes; this mints one with a small clock-skew allowance.
fn sign_app_jwt(app_id: &str, private_key_pem: &str) -> Result<String, ForgeError> {
    let now = chrono::Utc::now().timestamp();
    let claims = AppJwtClaims { iat: now - 60, exp: now + 9 * 60, iss: app_id.to_string() };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| ForgeError::Permanent(format!("invalid GitHub App private key: {e}")))?;
    jsonwebtoken::encode(&jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256), &claims, &key)
        .map_err(|e| ForgeError::Permanent(format!("failed to sign app jwt: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl From<ForgeError> for crate::errors::ConductorError {
    fn from(err: ForgeError) -> Self {
        match err {
            ForgeError::Transient(msg) => Self::TransientExternal(msg),
            ForgeError::Permanent(msg) => Self::PermanentExternal(msg),
        }
    }
}

/// Classifies an HTTP status the way the outbox consumer needs to (§4.4: "transient
/// network, 5xx, rate limit" vs. "permanent 4xx invalid payload").
fn classify_status(status: reqwest::StatusCode, body: impl Into<String>) -> ForgeError {
    let body = body.into();
    if status.is_server_error() || status.as_u16() == 429 {
        ForgeError::Transient(format!("forge returned {status}: {body}"))
    } else {
        ForgeError::Permanent(format!("forge returned {status}: {body}"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePrRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgeWriteResult {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgeTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgeUser {
    pub id: i64,
    pub login: String,
}

#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn create_pr(
        &self,
        installation_token: &str,
        owner: &str,
        repo: &str,
        req: CreatePrRequest<'_>,
    ) -> Result<ForgeWriteResult, ForgeError>;

    async fn post_comment(
        &self,
        installation_token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<ForgeWriteResult, ForgeError>;

    async fn exchange_code(&self, code: &str) -> Result<ForgeTokenResponse, ForgeError>;

    async fn fetch_user(&self, access_token: &str) -> Result<ForgeUser, ForgeError>;

    /// Exchanges a signed App JWT for a short-lived installation access token (§4.4, §4.10).
    async fn fetch_installation_token(
        &self,
        app_id: &str,
        private_key_pem: &str,
        installation_id: i64,
    ) -> Result<String, ForgeError>;
}

pub struct GithubForgeClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl GithubForgeClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self { http: reqwest::Client::new(), client_id, client_secret }
    }

    async fn map_response<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, ForgeError> {
        let status = resp.status();
        if status.is_success() {
            resp.json::<T>()
                .await
                .map_err(|e| ForgeError::Permanent(format!("failed to parse forge response: {e}")))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }
}

#[async_trait]
impl ForgeClient for GithubForgeClient {
    async fn create_pr(
        &self,
        installation_token: &str,
        owner: &str,
        repo: &str,
        req: CreatePrRequest<'_>,
    ) -> Result<ForgeWriteResult, ForgeError> {
        let url = format!("https://api.github.com/repos/{owner}/{repo}/pulls");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {installation_token}"))
            .header("User-Agent", USER_AGENT)
            .json(&req)
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("request to forge failed: {e}")))?;
        #[derive(Deserialize)]
        struct PrResponse {
            number: i64,
            html_url: String,
        }
        let parsed: PrResponse = Self::map_response(resp).await?;
        Ok(ForgeWriteResult { id: parsed.number.to_string(), url: parsed.html_url })
    }

    async fn post_comment(
        &self,
        installation_token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<ForgeWriteResult, ForgeError> {
        let url = format!("https://api.github.com/repos/{owner}/{repo}/issues/{issue_number}/comments");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {installation_token}"))
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("request to forge failed: {e}")))?;
        #[derive(Deserialize)]
        struct CommentResponse {
            id: i64,
            html_url: String,
        }
        let parsed: CommentResponse = Self::map_response(resp).await?;
        Ok(ForgeWriteResult { id: parsed.id.to_string(), url: parsed.html_url })
    }

    async fn exchange_code(&self, code: &str) -> Result<ForgeTokenResponse, ForgeError> {
        let resp = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("code exchange request failed: {e}")))?;
        Self::map_response(resp).await
    }

    async fn fetch_user(&self, access_token: &str) -> Result<ForgeUser, ForgeError> {
        let resp = self
            .http
            .get("https://api.github.com/user")
            .header("Authorization", format!("Bearer {access_token}"))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("user fetch failed: {e}")))?;
        Self::map_response(resp).await
    }

    async fn fetch_installation_token(
        &self,
        app_id: &str,
        private_key_pem: &str,
        installation_id: i64,
    ) -> Result<String, ForgeError> {
        let jwt = sign_app_jwt(app_id, private_key_pem)?;
        let url = format!("https://api.github.com/app/installations/{installation_id}/access_tokens");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(format!("installation token request failed: {e}")))?;
        #[derive(Deserialize)]
        struct InstallationTokenResponse {
            token: String,
        }
        let parsed: InstallationTokenResponse = Self::map_response(resp).await?;
        Ok(parsed.token)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_classify_as_transient() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            ForgeError::Transient(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ForgeError::Transient(_)
        ));
    }

    #[test]
    fn client_errors_classify_as_permanent() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad payload"),
            ForgeError::Permanent(_)
        ));
    }
}
