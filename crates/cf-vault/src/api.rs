//! Cloudflare API client
//!
//! Only three endpoints are needed: the caller's own user record, the
//! permission group catalog, and token creation. The client is an explicit
//! value built from a set of credentials through a [`Connector`], so tests
//! can swap in a fake without touching the network.

use chrono::{DateTime, Utc};
use cf_vault_core::{AuthType, Effect, PermissionGroup, Policy};
use std::collections::BTreeMap;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Base URL override
pub const BASE_URL_ENV: &str = "CF_VAULT_API_URL";

/// Remote API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to the Cloudflare API failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Cloudflare API rejected the request (HTTP {status}): {}", format_messages(.messages))]
    Rejected { status: u16, messages: Vec<ApiMessage> },

    #[error("unexpected response from the Cloudflare API (HTTP {status}): {message}")]
    Decode { status: u16, message: String },

    #[error("Cloudflare API returned no result for {0}")]
    EmptyResult(&'static str),
}

fn format_messages(messages: &[ApiMessage]) -> String {
    if messages.is_empty() {
        return "no error details".to_string();
    }
    messages
        .iter()
        .map(|m| format!("{} ({})", m.message, m.code))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Credentials used to authenticate API calls
#[derive(Clone)]
pub enum Credentials {
    /// Bearer token
    ApiToken(String),
    /// Global API key + account email
    ApiKey { key: String, email: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiToken(_) => f.write_str("ApiToken(..)"),
            Self::ApiKey { email, .. } => write!(f, "ApiKey {{ email: {:?}, .. }}", email),
        }
    }
}

impl Credentials {
    /// Credentials for a stored secret of the given auth type
    pub fn new(auth_type: AuthType, secret: String, email: &str) -> Self {
        match auth_type {
            AuthType::ApiToken => Self::ApiToken(secret),
            AuthType::ApiKey => Self::ApiKey {
                key: secret,
                email: email.to_string(),
            },
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiToken(token) => request.bearer_auth(token),
            Self::ApiKey { key, email } => request
                .header("X-Auth-Key", key)
                .header("X-Auth-Email", email),
        }
    }
}

/// A grantable permission group as listed by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Body of a token creation request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRequest {
    pub name: String,
    #[serde(with = "rfc3339_seconds")]
    pub not_before: DateTime<Utc>,
    #[serde(with = "rfc3339_seconds")]
    pub expires_on: DateTime<Utc>,
    #[serde(serialize_with = "serialize_policies")]
    pub policies: Vec<Policy>,
}

/// Policy as sent to the API. Config-only keys stay local.
#[derive(Serialize)]
struct WirePolicy<'a> {
    effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    resources: &'a BTreeMap<String, String>,
    permission_groups: Vec<WireGroup<'a>>,
}

#[derive(Serialize)]
struct WireGroup<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a Policy> for WirePolicy<'a> {
    fn from(policy: &'a Policy) -> Self {
        Self {
            effect: policy.effect,
            id: policy.id.as_deref(),
            resources: &policy.resources,
            permission_groups: policy.permission_groups.iter().map(WireGroup::from).collect(),
        }
    }
}

impl<'a> From<&'a PermissionGroup> for WireGroup<'a> {
    fn from(group: &'a PermissionGroup) -> Self {
        Self {
            id: &group.id,
            name: group.name.as_deref(),
        }
    }
}

#[allow(clippy::ptr_arg)]
fn serialize_policies<S: serde::Serializer>(
    policies: &Vec<Policy>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(policies.iter().map(WirePolicy::from))
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Message attached to an API response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Standard v4 response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedToken {
    value: String,
}

/// Operations cf-vault needs from the API
pub trait CloudflareApi {
    /// ID of the authenticated user
    fn user_id(&self) -> Result<String, ApiError>;

    /// Every permission group the caller may grant
    fn permission_groups(&self) -> Result<Vec<CatalogEntry>, ApiError>;

    /// Create a token and return its secret value
    fn create_token(&self, request: &TokenRequest) -> Result<String, ApiError>;
}

/// Builds an authenticated client
pub trait Connector {
    fn connect(&self, credentials: Credentials) -> Result<Box<dyn CloudflareApi>, ApiError>;
}

/// HTTP implementation of [`CloudflareApi`]
pub struct HttpClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("cf-vault/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, ApiError> {
        let response = self.credentials.apply(request).send()?;
        let status = response.status();
        let body = response.text()?;
        decode(status, &body)
    }
}

impl CloudflareApi for HttpClient {
    fn user_id(&self) -> Result<String, ApiError> {
        debug!("fetching user details");
        let user: Option<UserRecord> = self.send(self.http.get(self.url("/user")))?;
        user.map(|u| u.id).ok_or(ApiError::EmptyResult("/user"))
    }

    fn permission_groups(&self) -> Result<Vec<CatalogEntry>, ApiError> {
        debug!("fetching permission group catalog");
        let groups: Option<Vec<CatalogEntry>> =
            self.send(self.http.get(self.url("/user/tokens/permission_groups")))?;
        Ok(groups.unwrap_or_default())
    }

    fn create_token(&self, request: &TokenRequest) -> Result<String, ApiError> {
        debug!(
            "creating token {} with {} policies",
            request.name,
            request.policies.len()
        );
        let token: Option<CreatedToken> =
            self.send(self.http.post(self.url("/user/tokens")).json(request))?;
        token.map(|t| t.value).ok_or(ApiError::EmptyResult("/user/tokens"))
    }
}

/// Connector producing [`HttpClient`]s against a fixed base URL
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl HttpConnector {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }

    /// Honour `CF_VAULT_API_URL` when set
    pub fn from_env() -> Self {
        match std::env::var(BASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, credentials: Credentials) -> Result<Box<dyn CloudflareApi>, ApiError> {
        Ok(Box::new(HttpClient::new(&self.base_url, credentials)?))
    }
}

/// Decode a v4 envelope, turning unsuccessful responses into errors
fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<Option<T>, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| ApiError::Decode {
        status: status.as_u16(),
        message: e.to_string(),
    })?;

    if !status.is_success() || !envelope.success {
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            messages: envelope.errors,
        });
    }

    Ok(envelope.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_success() {
        let body = r#"{"success": true, "errors": [], "messages": [], "result": {"id": "7c5dae5552338874e5053f2534d2767a", "email": "a@b.com"}}"#;
        let user: Option<UserRecord> = decode(StatusCode::OK, body).unwrap();
        assert_eq!(user.unwrap().id, "7c5dae5552338874e5053f2534d2767a");
    }

    #[test]
    fn test_decode_rejected() {
        let body = r#"{"success": false, "errors": [{"code": 9109, "message": "Invalid access token"}], "result": null}"#;
        let result: Result<Option<UserRecord>, _> = decode(StatusCode::FORBIDDEN, body);
        match result {
            Err(ApiError::Rejected { status, messages }) => {
                assert_eq!(status, 403);
                assert_eq!(messages[0].code, 9109);
                assert_eq!(messages[0].message, "Invalid access token");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unsuccessful_envelope_with_ok_status() {
        let body = r#"{"success": false, "errors": [], "result": null}"#;
        let result: Result<Option<UserRecord>, _> = decode(StatusCode::OK, body);
        assert!(matches!(result, Err(ApiError::Rejected { status: 200, .. })));
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<Option<UserRecord>, _> = decode(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(result, Err(ApiError::Decode { status: 502, .. })));
    }

    #[test]
    fn test_decode_catalog() {
        let body = r#"{"success": true, "errors": [], "result": [
            {"id": "c8fed203ed3043cba015a93ad1616f1f", "name": "Zone Read", "scopes": ["com.cloudflare.api.account.zone"]},
            {"id": "legacy", "name": "Legacy Read"}
        ]}"#;
        let groups: Option<Vec<CatalogEntry>> = decode(StatusCode::OK, body).unwrap();
        let groups = groups.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].scopes, vec!["com.cloudflare.api.account.zone"]);
        assert!(groups[1].scopes.is_empty());
    }

    #[test]
    fn test_token_request_body() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let request = TokenRequest {
            name: "cf-vault-1704114000".to_string(),
            not_before: now,
            expires_on: now + chrono::Duration::hours(1),
            policies: vec![Policy::allow(
                "com.cloudflare.api.account.*",
                vec![cf_vault_core::PermissionGroup::new("abc", "DNS Read")],
            )],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["not_before"], "2024-01-01T12:00:00Z");
        assert_eq!(json["expires_on"], "2024-01-01T13:00:00Z");
        assert_eq!(json["policies"][0]["effect"], "allow");
        assert_eq!(
            json["policies"][0]["resources"]["com.cloudflare.api.account.*"],
            "*"
        );
        assert_eq!(json["policies"][0]["permission_groups"][0]["id"], "abc");
    }

    #[test]
    fn test_token_request_omits_config_only_keys() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut group = cf_vault_core::PermissionGroup::new("abc", "DNS Read");
        group.extra.insert("meta".to_string(), toml::Value::from("local"));
        let mut policy = Policy::allow("com.cloudflare.api.account.*", vec![group]);
        policy.extra.insert("note".to_string(), toml::Value::from("local"));

        let request = TokenRequest {
            name: "cf-vault-1704114000".to_string(),
            not_before: now,
            expires_on: now + chrono::Duration::hours(1),
            policies: vec![policy],
        };

        let json = serde_json::to_value(&request).unwrap();
        let policy = json["policies"][0].as_object().unwrap();
        assert!(!policy.contains_key("note"));
        assert_eq!(policy["effect"], "allow");
        let group = json["policies"][0]["permission_groups"][0].as_object().unwrap();
        assert!(!group.contains_key("meta"));
        assert_eq!(group["id"], "abc");
        assert_eq!(group["name"], "DNS Read");
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::ApiKey {
            key: "supersecret".to_string(),
            email: "a@b.com".to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("supersecret"));
        assert!(shown.contains("a@b.com"));

        let shown = format!("{:?}", Credentials::ApiToken("tok".to_string()));
        assert!(!shown.contains("tok\""));
    }
}
