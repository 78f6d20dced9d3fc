//! Session and role types for the bearer-token auth flow.

mod token;

pub use token::TokenStore;

use serde::{Deserialize, Serialize};

/// Roles the backend issues; authorization itself is enforced server-side
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Operator,
    Supervisor,
    Unit,
}

/// Response of `POST /api/v1/auth/login`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    pub role: UserRole,
    pub must_change: bool,
}

/// Response of `POST /api/v1/auth/refresh`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RefreshResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

/// Response of `GET /api/v1/me`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CurrentUser {
    pub user_id: i64,
    pub role: UserRole,
    #[serde(default)]
    pub email: Option<String>,
    pub must_change: bool,
}
