//! REST client for the PNC Panic backend.
//!
//! Thin glue over `reqwest`: bearer auth from the shared [`TokenStore`], one
//! transparent refresh-and-retry on 401 per request, and tolerant decoding of
//! the two list shapes the API has shipped over its lifetime (bare array and
//! `{items, page, total}` envelope).

use log::{debug, error, warn};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;

use crate::auth::{CurrentUser, LoginResponse, RefreshResponse, TokenStore};
use crate::config::ApiConfig;
use crate::types::{
    AccountStatus, AdminUser, AuditEntry, Incident, IncidentDetail, IncidentStatus, Kpis,
    Settings, Simulation, SimulationStatus, Unit, UnitStatus, UnitType,
};

#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials rejected and not recoverable by a token refresh
    #[error("authentication failed")]
    Unauthorized,

    /// Backend answered with a non-success status
    #[error("api error ({status}): {message}")]
    Api {
        status: StatusCode,
        message: String,
    },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Normalized list response
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: Option<u32>,
    pub total: Option<u64>,
}

// The backend returned bare arrays before pagination was introduced; both
// shapes are still live on different endpoints
#[derive(Deserialize)]
#[serde(untagged)]
enum ListEnvelope<T> {
    Envelope {
        items: Vec<T>,
        #[serde(default)]
        page: Option<u32>,
        #[serde(default)]
        total: Option<u64>,
    },
    Bare(Vec<T>),
}

impl<T> From<ListEnvelope<T>> for Page<T> {
    fn from(envelope: ListEnvelope<T>) -> Self {
        match envelope {
            ListEnvelope::Envelope { items, page, total } => Self { items, page, total },
            ListEnvelope::Bare(items) => Self {
                items,
                page: None,
                total: None,
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IncidentQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl IncidentQuery {
    /// Filter on the statuses shown in the active queue
    pub fn active(limit: u32) -> Self {
        Self {
            status: Some("NEW,ACK,DISPATCHED,IN_PROGRESS".to_string()),
            limit: Some(limit),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UnitQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitStatus>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub unit_type: Option<UnitType>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NewUnit {
    pub name: String,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UnitUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub unit_type: Option<UnitType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitStatus>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UserQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Client over the backend REST API at `{base_url}/api/v1`
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    tokens: TokenStore,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, tokens: TokenStore) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            tokens,
        })
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    // ----- auth -----

    /// Log in and store the issued session
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let response: LoginResponse = self
            .request(
                Method::POST,
                "/api/v1/auth/login",
                &[],
                Some(json!({"email": email, "password": password})),
            )
            .await?;

        if let Err(e) = self.tokens.set_session(
            response.access_token.clone(),
            response.refresh_token.clone(),
            response.role,
        ) {
            warn!("failed to persist session: {e:#}");
        }

        Ok(response)
    }

    /// Revoke the refresh token server-side and drop the local session.
    /// A failed revoke still clears locally; the token expires on its own.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.tokens.refresh_token()
            && let Err(e) = self
                .request_no_content(
                    Method::POST,
                    "/api/v1/auth/logout",
                    &[],
                    Some(json!({"refreshToken": refresh_token})),
                )
                .await
        {
            warn!("logout request failed: {e}");
        }
        self.tokens.clear();
    }

    pub async fn current_user(&self) -> Result<CurrentUser, ApiError> {
        self.request(Method::GET, "/api/v1/me", &[], None).await
    }

    /// Change the password; the backend revokes all tokens afterwards
    pub async fn change_password(&self, current: &str, new: &str) -> Result<(), ApiError> {
        self.request_no_content(
            Method::POST,
            "/api/v1/auth/change-password",
            &[],
            Some(json!({"current_password": current, "new_password": new})),
        )
        .await?;
        self.tokens.clear();
        Ok(())
    }

    // ----- ops: incidents -----

    pub async fn incidents(&self, query: &IncidentQuery) -> Result<Page<Incident>, ApiError> {
        self.request_list("/api/v1/ops/incidents", query).await
    }

    pub async fn incident_detail(&self, id: &str) -> Result<IncidentDetail, ApiError> {
        self.request(
            Method::GET,
            &format!("/api/v1/ops/incidents/{id}"),
            &[],
            None,
        )
        .await
    }

    pub async fn ack_incident(&self, id: &str) -> Result<(), ApiError> {
        self.request_no_content(
            Method::PATCH,
            &format!("/api/v1/ops/incidents/{id}/ack"),
            &[],
            None,
        )
        .await
    }

    pub async fn assign_incident(
        &self,
        id: &str,
        unit_id: i64,
        note: Option<&str>,
    ) -> Result<(), ApiError> {
        self.request_no_content(
            Method::PATCH,
            &format!("/api/v1/ops/incidents/{id}/assign"),
            &[],
            Some(json!({"unit_id": unit_id, "note": note})),
        )
        .await
    }

    pub async fn update_incident_status(
        &self,
        id: &str,
        status: IncidentStatus,
        reason: Option<&str>,
    ) -> Result<(), ApiError> {
        self.request_no_content(
            Method::PATCH,
            &format!("/api/v1/ops/incidents/{id}/status"),
            &[],
            Some(json!({"status": status, "reason": reason})),
        )
        .await
    }

    pub async fn add_incident_note(&self, id: &str, text: &str) -> Result<(), ApiError> {
        self.request_no_content(
            Method::POST,
            &format!("/api/v1/ops/incidents/{id}/notes"),
            &[],
            Some(json!({"text": text})),
        )
        .await
    }

    // ----- ops: units -----

    pub async fn units(&self, query: &UnitQuery) -> Result<Page<Unit>, ApiError> {
        self.request_list("/api/v1/ops/units", query).await
    }

    pub async fn create_unit(&self, unit: &NewUnit) -> Result<Unit, ApiError> {
        self.request(
            Method::POST,
            "/api/v1/ops/units",
            &[],
            Some(serde_json::to_value(unit)?),
        )
        .await
    }

    pub async fn update_unit(&self, id: i64, update: &UnitUpdate) -> Result<(), ApiError> {
        self.request_no_content(
            Method::PATCH,
            &format!("/api/v1/ops/units/{id}"),
            &[],
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    // ----- ops: reports, settings, audit -----

    pub async fn kpis(&self, from: Option<&str>, to: Option<&str>) -> Result<Kpis, ApiError> {
        let mut query = Vec::new();
        if let Some(from) = from {
            query.push(("from", from.to_string()));
        }
        if let Some(to) = to {
            query.push(("to", to.to_string()));
        }
        self.request(Method::GET, "/api/v1/ops/reports/kpis", &query, None)
            .await
    }

    pub async fn settings(&self) -> Result<Settings, ApiError> {
        self.request(Method::GET, "/api/v1/ops/settings", &[], None)
            .await
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<Settings, ApiError> {
        self.request(
            Method::PATCH,
            "/api/v1/ops/settings",
            &[],
            Some(serde_json::to_value(settings)?),
        )
        .await
    }

    pub async fn audit_logs(&self, query: &AuditQuery) -> Result<Page<AuditEntry>, ApiError> {
        self.request_list("/api/v1/ops/audit", query).await
    }

    // ----- admin: users -----

    pub async fn users(&self, query: &UserQuery) -> Result<Page<AdminUser>, ApiError> {
        self.request_list("/api/v1/admin/users", query).await
    }

    pub async fn create_user(&self, user: &NewUser) -> Result<AdminUser, ApiError> {
        self.request(
            Method::POST,
            "/api/v1/admin/users",
            &[],
            Some(serde_json::to_value(user)?),
        )
        .await
    }

    pub async fn reset_user_password(&self, id: i64) -> Result<(), ApiError> {
        self.request_no_content(
            Method::POST,
            &format!("/api/v1/admin/users/{id}/reset-password"),
            &[],
            None,
        )
        .await
    }

    pub async fn update_user_status(&self, id: i64, status: AccountStatus) -> Result<(), ApiError> {
        self.request_no_content(
            Method::PATCH,
            &format!("/api/v1/admin/users/{id}/status"),
            &[],
            Some(json!({"status": status})),
        )
        .await
    }

    // ----- simulations -----

    pub async fn create_simulation(&self) -> Result<Simulation, ApiError> {
        self.request(Method::POST, "/api/v1/simulations", &[], None)
            .await
    }

    pub async fn update_simulation_status(
        &self,
        id: &str,
        status: SimulationStatus,
    ) -> Result<Simulation, ApiError> {
        self.request(
            Method::PATCH,
            &format!("/api/v1/simulations/{id}/status"),
            &[],
            Some(json!({"status": status})),
        )
        .await
    }

    // ----- plumbing -----

    async fn request_list<T, Q>(&self, path: &str, query: &Q) -> Result<Page<T>, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize,
    {
        // Serialize the typed query into pairs so None fields vanish
        let pairs = match serde_json::to_value(query)? {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, rendered)
                })
                .collect(),
            _ => Vec::new(),
        };
        let pairs: Vec<(&str, String)> = pairs.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let envelope: ListEnvelope<T> = self.request(Method::GET, path, &pairs, None).await?;
        Ok(envelope.into())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let text = self.request_text(method, path, query, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn request_no_content(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        self.request_text(method, path, query, body).await.map(|_| ())
    }

    async fn request_text(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<String, ApiError> {
        debug!("{method} {path}");

        let response = self
            .execute(method.clone(), path, query, body.as_ref())
            .await?;

        // One transparent refresh-and-retry per request on 401
        let response = if response.status() == StatusCode::UNAUTHORIZED
            && self.tokens.refresh_token().is_some()
        {
            if self.refresh_access_token().await {
                self.execute(method, path, query, body.as_ref()).await?
            } else {
                self.tokens.clear();
                return Err(ApiError::Unauthorized);
            }
        } else {
            response
        };

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                return Err(ApiError::Unauthorized);
            }
            let message = extract_error_message(&text).unwrap_or_else(|| {
                if text.is_empty() {
                    format!("HTTP {status}")
                } else {
                    text.clone()
                }
            });
            error!("{path} failed: {message}");
            return Err(ApiError::Api { status, message });
        }

        Ok(text)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("Accept", "application/json");

        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = self.tokens.access_token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await
    }

    async fn refresh_access_token(&self) -> bool {
        let Some(refresh_token) = self.tokens.refresh_token() else {
            return false;
        };

        debug!("access token rejected, attempting refresh");

        let result = self
            .http
            .post(format!("{}/api/v1/auth/refresh", self.base_url))
            .json(&json!({"refreshToken": refresh_token}))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<RefreshResponse>().await {
                    Ok(refreshed) => {
                        if let Err(e) = self.tokens.set_access_token(refreshed.access_token) {
                            warn!("failed to persist refreshed token: {e:#}");
                        }
                        true
                    }
                    Err(e) => {
                        error!("failed to decode refresh response: {e}");
                        false
                    }
                }
            }
            Ok(response) => {
                debug!("refresh token rejected: HTTP {}", response.status());
                false
            }
            Err(e) => {
                error!("token refresh failed: {e}");
                false
            }
        }
    }
}

// The backend reports errors as {"message": ...} or, on older routes,
// {"error": ...}
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_list_normalizes() {
        let page: Page<Incident> = serde_json::from_str::<ListEnvelope<Incident>>(
            r#"{"items":[{"id":"a","status":"NEW","created_at":"2025-03-01T12:00:00Z","lat":1.0,"lng":2.0}],"page":1,"total":42}"#,
        )
        .unwrap()
        .into();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.page, Some(1));
        assert_eq!(page.total, Some(42));
    }

    #[test]
    fn bare_array_list_normalizes() {
        let page: Page<Incident> = serde_json::from_str::<ListEnvelope<Incident>>(
            r#"[{"id":"a","status":"NEW","created_at":"2025-03-01T12:00:00Z","lat":1.0,"lng":2.0}]"#,
        )
        .unwrap()
        .into();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.page, None);
        assert_eq!(page.total, None);
    }

    #[test]
    fn error_message_prefers_message_field() {
        assert_eq!(
            extract_error_message(r#"{"message":"no such incident"}"#).as_deref(),
            Some("no such incident")
        );
        assert_eq!(
            extract_error_message(r#"{"error":"bad request"}"#).as_deref(),
            Some("bad request")
        );
        assert_eq!(extract_error_message("<html>oops</html>"), None);
    }

    use crate::auth::UserRole;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn http_response(status: u16, body: &str) -> String {
        let reason = if status == 200 { "OK" } else { "Unauthorized" };
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// One-connection-per-response stub backend; records the request lines
    /// it saw so tests can assert the retry order
    async fn stub_server(responses: Vec<String>) -> (std::net::SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };

                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                        let content_length = head
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if buf.len() >= head_end + 4 + content_length {
                            break;
                        }
                    }
                }

                let request_line = String::from_utf8_lossy(&buf)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches(" HTTP/1.1")
                    .to_string();
                seen.lock().unwrap().push(request_line);

                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (addr, requests)
    }

    fn store_with_session(dir: &tempfile::TempDir) -> TokenStore {
        let tokens = TokenStore::open(dir.path().join("session.json"));
        tokens
            .set_session("stale".into(), "refresh".into(), UserRole::Operator)
            .unwrap();
        tokens
    }

    fn client_for(addr: std::net::SocketAddr, tokens: TokenStore) -> ApiClient {
        let config = ApiConfig {
            base_url: format!("http://{addr}"),
            request_timeout: Duration::from_secs(5),
        };
        ApiClient::new(&config, tokens).unwrap()
    }

    #[tokio::test]
    async fn expired_token_refreshes_and_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store_with_session(&dir);

        let (addr, requests) = stub_server(vec![
            http_response(401, r#"{"message":"token expired"}"#),
            http_response(200, r#"{"accessToken":"fresh"}"#),
            http_response(200, r#"{"user_id":7,"role":"operator","must_change":false}"#),
        ])
        .await;

        let api = client_for(addr, tokens.clone());
        let user = api.current_user().await.unwrap();

        assert_eq!(user.user_id, 7);
        assert_eq!(tokens.access_token().as_deref(), Some("fresh"));
        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                "GET /api/v1/me",
                "POST /api/v1/auth/refresh",
                "GET /api/v1/me",
            ]
        );
    }

    #[tokio::test]
    async fn rejected_refresh_clears_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store_with_session(&dir);

        let (addr, requests) = stub_server(vec![
            http_response(401, r#"{"message":"token expired"}"#),
            http_response(401, r#"{"message":"refresh token revoked"}"#),
        ])
        .await;

        let api = client_for(addr, tokens.clone());
        let err = api.current_user().await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized));
        assert!(!tokens.has_session());
        // No third request: the original call is not retried
        assert_eq!(
            *requests.lock().unwrap(),
            vec!["GET /api/v1/me", "POST /api/v1/auth/refresh"]
        );
    }

    #[test]
    fn incident_query_serializes_only_present_fields() {
        let value = serde_json::to_value(IncidentQuery::active(10)).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(
            object.get("status").and_then(|s| s.as_str()),
            Some("NEW,ACK,DISPATCHED,IN_PROGRESS")
        );
        assert_eq!(object.get("limit").and_then(|l| l.as_u64()), Some(10));
    }
}
