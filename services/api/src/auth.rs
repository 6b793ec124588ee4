//! Cookie-session auth.
//!
//! POST /auth/signup   create tenant + owner account, start a session
//! POST /auth/signin   verify credentials, start a session
//! POST /auth/logout   delete the current session
//! GET  /auth/me       current user profile
//! GET  /auth/status   lightweight signed-in check for the shell
//!
//! Sessions are opaque UUID tokens in an HttpOnly cookie, stored server-side
//! in auth.user_session with a 30-day expiry. Passwords are bcrypt hashes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{HeaderMap, SET_COOKIE};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub const SESSION_COOKIE: &str = "valora_session";
const SESSION_TTL_DAYS: i64 = 30;
const BCRYPT_COST: u32 = 10;
const MIN_PASSWORD_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

pub fn build_full_name(first: &str, last: &str) -> String {
    let first = first.trim();
    let last = last.trim();
    match (first.is_empty(), last.is_empty()) {
        (false, false) => format!("{first} {last}"),
        (false, true) => first.to_string(),
        (true, false) => last.to_string(),
        (true, true) => String::new(),
    }
}

fn session_cookie(token: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Expires={}",
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Expires=Thu, 01 Jan 1970 00:00:00 GMT")
}

/// Pull the session token out of the Cookie header, if any.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

fn with_cookie(body: serde_json::Value, cookie: String) -> Response {
    let mut resp = Json(body).into_response();
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().insert(SET_COOKIE, v);
    }
    resp
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct SessionUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub restaurant_name: Option<String>,
    pub onboarding_status: Option<String>,
}

async fn create_session(pool: &PgPool, user_id: Uuid) -> ApiResult<(Uuid, DateTime<Utc>)> {
    let token = Uuid::new_v4();
    let expires_at = Utc::now() + Duration::days(SESSION_TTL_DAYS);
    sqlx::query(
        r#"
        insert into auth.user_session (token, user_id, expires_at)
        values ($1, $2, $3)
        "#,
    )
    .bind(token)
    .bind(user_id)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok((token, expires_at))
}

/// Resolve a session token to its user. Expired sessions are deleted
/// best-effort and treated as absent.
pub async fn get_session_user(pool: &PgPool, token: &str) -> ApiResult<Option<SessionUser>> {
    let Ok(token) = Uuid::parse_str(token) else {
        return Ok(None);
    };

    #[derive(sqlx::FromRow)]
    struct SessionRow {
        expires_at: DateTime<Utc>,
        user_id: Uuid,
        tenant_id: Uuid,
        email: String,
        full_name: Option<String>,
        restaurant_name: Option<String>,
        onboarding_status: Option<String>,
    }

    let row: Option<SessionRow> = sqlx::query_as(
        r#"
        select s.expires_at, u.user_id, u.tenant_id, u.email, u.full_name,
               t.restaurant_name, t.onboarding_status
        from auth.user_session s
        join auth.app_user u on u.user_id = s.user_id
        join public.tenant t on t.tenant_id = u.tenant_id
        where s.token = $1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    if row.expires_at <= Utc::now() {
        if let Err(e) = sqlx::query("delete from auth.user_session where token = $1")
            .bind(token)
            .execute(pool)
            .await
        {
            tracing::warn!(error = %e, "failed to delete expired session");
        }
        return Ok(None);
    }

    Ok(Some(SessionUser {
        user_id: row.user_id,
        tenant_id: row.tenant_id,
        email: row.email,
        full_name: row.full_name,
        restaurant_name: row.restaurant_name,
        onboarding_status: row.onboarding_status,
    }))
}

/// Best-effort mirror into public.app_user for dashboard joins. Runs after
/// the signup transaction commits so a mirror failure never loses the signup.
async fn mirror_app_user(pool: &PgPool, user_id: Uuid, tenant_id: Uuid, email: &str) {
    let res = sqlx::query(
        r#"
        insert into public.app_user (user_id, tenant_id, email)
        values ($1, $2, $3)
        on conflict (user_id) do update
        set tenant_id = excluded.tenant_id, email = excluded.email
        "#,
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(email)
    .execute(pool)
    .await;
    if let Err(e) = res {
        tracing::warn!(error = %e, %user_id, "app_user mirror write failed");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignupPayload {
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub restaurant_name: String,
}

/// POST /auth/signup
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SignupPayload>,
) -> ApiResult<Response> {
    let email = normalize_email(payload.email.as_deref().unwrap_or_default());
    if !valid_email(&email) {
        return Err(ApiError::BadRequest("Valid email required".to_string()));
    }
    let password = payload.password.unwrap_or_default();
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let exists: Option<(Uuid,)> =
        sqlx::query_as("select user_id from auth.app_user where email = $1")
            .bind(&email)
            .fetch_optional(&state.pool)
            .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(
            "An account with this email already exists".to_string(),
        ));
    }

    let password_hash =
        bcrypt::hash(&password, BCRYPT_COST).map_err(anyhow::Error::from)?;
    let full_name = build_full_name(&payload.first_name, &payload.last_name);
    let restaurant_name = payload.restaurant_name.trim();

    let user_id = Uuid::new_v4();
    let tenant_id = Uuid::new_v4();

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        r#"
        insert into public.tenant (tenant_id, restaurant_name, onboarding_status)
        values ($1, $2, 'pending')
        "#,
    )
    .bind(tenant_id)
    .bind(if restaurant_name.is_empty() {
        None::<&str>
    } else {
        Some(restaurant_name)
    })
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        insert into auth.app_user (user_id, tenant_id, email, password_hash, full_name)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(&email)
    .bind(&password_hash)
    .bind(if full_name.is_empty() {
        None::<&str>
    } else {
        Some(full_name.as_str())
    })
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    mirror_app_user(&state.pool, user_id, tenant_id, &email).await;

    let (token, expires_at) = create_session(&state.pool, user_id).await?;
    tracing::info!(%user_id, %tenant_id, "account created");

    Ok(with_cookie(
        json!({ "ok": true, "redirect": "/onboarding" }),
        session_cookie(&token.to_string(), expires_at),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SigninPayload {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// POST /auth/signin
pub async fn signin_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SigninPayload>,
) -> ApiResult<Response> {
    let email = normalize_email(payload.email.as_deref().unwrap_or_default());
    let password = payload.password.unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return Err(ApiError::BadRequest(
            "Email and password required".to_string(),
        ));
    }

    let row: Option<(Uuid, String)> =
        sqlx::query_as("select user_id, password_hash from auth.app_user where email = $1")
            .bind(&email)
            .fetch_optional(&state.pool)
            .await?;

    let Some((user_id, password_hash)) = row else {
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    };
    let verified = bcrypt::verify(&password, &password_hash).map_err(anyhow::Error::from)?;
    if !verified {
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    }

    let (token, expires_at) = create_session(&state.pool, user_id).await?;
    tracing::info!(%user_id, "signed in");

    Ok(with_cookie(
        json!({ "ok": true, "redirect": "/dashboard" }),
        session_cookie(&token.to_string(), expires_at),
    ))
}

/// POST /auth/logout
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if let Some(token) = session_token(&headers) {
        if let Ok(token) = Uuid::parse_str(&token) {
            sqlx::query("delete from auth.user_session where token = $1")
                .bind(token)
                .execute(&state.pool)
                .await?;
        }
    }
    Ok(with_cookie(json!({ "ok": true }), clear_cookie()))
}

/// GET /auth/me
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let token = session_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("Not signed in".to_string()))?;
    let user = get_session_user(&state.pool, &token)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Session expired".to_string()))?;

    Ok(Json(json!({
        "ok": true,
        "user": {
            "user_id": user.user_id,
            "tenant_id": user.tenant_id,
            "email": user.email,
            "full_name": user.full_name,
            "restaurant_name": user.restaurant_name,
            "onboarding_status": user.onboarding_status,
        },
    })))
}

/// GET /auth/status
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let signed_in = match session_token(&headers) {
        Some(token) => get_session_user(&state.pool, &token).await?.is_some(),
        None => false,
    };
    Ok(Json(json!({ "ok": true, "signed_in": signed_in })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization_and_validation() {
        assert_eq!(normalize_email("  Owner@Example.COM "), "owner@example.com");
        assert!(valid_email("owner@example.com"));
        assert!(!valid_email("owner@localhost"));
        assert!(!valid_email("@example.com"));
        assert!(!valid_email("plainaddress"));
    }

    #[test]
    fn full_name_joins_and_trims() {
        assert_eq!(build_full_name(" Ada ", " Lovelace "), "Ada Lovelace");
        assert_eq!(build_full_name("Ada", ""), "Ada");
        assert_eq!(build_full_name("", "Lovelace"), "Lovelace");
        assert_eq!(build_full_name("  ", ""), "");
    }

    #[test]
    fn cookie_round_trip() {
        let expires = Utc::now() + Duration::days(30);
        let cookie = session_cookie("abc123", expires);
        assert!(cookie.starts_with("valora_session=abc123;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; valora_session=abc123; other=1"),
        );
        assert_eq!(session_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn missing_or_empty_cookie_yields_none() {
        let headers = HeaderMap::new();
        assert_eq!(session_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("valora_session="),
        );
        assert_eq!(session_token(&headers), None);
    }

    #[test]
    fn clear_cookie_expires_in_the_past() {
        assert!(clear_cookie().contains("Expires=Thu, 01 Jan 1970"));
    }

    #[test]
    fn bcrypt_hash_verifies() {
        let hash = bcrypt::hash("hunter2hunter2", 4).unwrap();
        assert!(bcrypt::verify("hunter2hunter2", &hash).unwrap());
        assert!(!bcrypt::verify("wrong-password", &hash).unwrap());
    }
}
