use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{
        password,
        tokens::{generate_token, hash_token},
        AuthenticatedUser,
    },
    config::AppConfig,
    error::{AppError, AppResult},
    models::{NewUser, User},
    response::ApiResponse,
    schema::users::dsl,
    state::AppState,
    types::UserRole,
};

use super::users::UserProfile;

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(serde::Serialize)]
pub struct TokenData {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserProfile,
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<UserProfile>>)> {
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("a valid email is required"));
    }
    if payload.password.len() < 8 {
        return Err(AppError::bad_request(
            "password must be at least 8 characters",
        ));
    }
    let first_name = payload.first_name.trim();
    let last_name = payload.last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(AppError::bad_request("first and last name are required"));
    }

    let password_hash = password::hash_password(&payload.password)?;
    let new_user = NewUser {
        id: Uuid::new_v4(),
        email,
        password_hash,
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        role: UserRole::default().as_str().to_string(),
        notification_preferences: serde_json::json!({ "email": true, "in_app": true }),
    };

    let mut conn = state.db()?;
    match diesel::insert_into(dsl::users)
        .values(&new_user)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("email already registered"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    let user: User = dsl::users.find(new_user.id).first(&mut conn)?;
    tracing::info!(user_id = %user.id, "registered new user");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("account created", UserProfile::from(user))),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<ApiResponse<TokenData>>)> {
    let email = payload.email.trim().to_lowercase();
    let mut conn = state.db()?;

    let user: User = dsl::users
        .filter(dsl::email.eq(&email))
        .first(&mut conn)
        .map_err(|_| AppError::unauthorized())?;

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::unauthorized());
    }
    if !user.is_active {
        return Err(AppError::unauthorized());
    }

    let (headers, data) = issue_tokens(&state, &mut conn, &user)?;
    Ok((headers, Json(ApiResponse::ok("logged in", data))))
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<ApiResponse<TokenData>>)> {
    let cookies = jar.ok_or_else(AppError::unauthorized)?;
    let refresh_value = cookies
        .get(REFRESH_COOKIE_NAME)
        .ok_or_else(AppError::unauthorized)?;

    let hashed = hash_token(refresh_value);
    let mut conn = state.db()?;

    let user: User = match dsl::users
        .filter(dsl::refresh_token.eq(&hashed))
        .filter(dsl::is_active.eq(true))
        .first(&mut conn)
    {
        Ok(user) => user,
        Err(diesel::result::Error::NotFound) => return Err(AppError::unauthorized()),
        Err(err) => return Err(AppError::from(err)),
    };

    let (headers, data) = issue_tokens(&state, &mut conn, &user)?;
    Ok((headers, Json(ApiResponse::ok("token refreshed", data))))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<(HeaderMap, Json<ApiResponse<()>>)> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    diesel::update(dsl::users.find(user.user_id))
        .set((
            dsl::refresh_token.eq::<Option<String>>(None),
            dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_refresh_cookie(&state.config)?);
    Ok((headers, Json(ApiResponse::message("logged out"))))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<UserProfile>>> {
    let mut conn = state.db()?;
    let record: User = dsl::users.find(user.user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::ok("profile", UserProfile::from(record))))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> AppResult<Json<ApiResponse<()>>> {
    let email = payload.email.trim().to_lowercase();
    let mut conn = state.db()?;

    // Same response whether or not the account exists.
    let user: Option<User> = dsl::users
        .filter(dsl::email.eq(&email))
        .filter(dsl::is_active.eq(true))
        .first(&mut conn)
        .optional()?;

    if let Some(user) = user {
        let reset_value = generate_token();
        let expires = Utc::now()
            + ChronoDuration::minutes(state.config.reset_token_expiry_minutes);

        diesel::update(dsl::users.find(user.id))
            .set((
                dsl::reset_token.eq(Some(hash_token(&reset_value))),
                dsl::reset_token_expires.eq(Some(expires.naive_utc())),
                dsl::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;

        // No mailer is wired up; the token is surfaced in the logs for the
        // operator to relay.
        tracing::info!(user_id = %user.id, reset_token = %reset_value, "password reset requested");
    }

    Ok(Json(ApiResponse::message(
        "if the account exists, a reset token has been issued",
    )))
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<Json<ApiResponse<()>>> {
    if payload.password.len() < 8 {
        return Err(AppError::bad_request(
            "password must be at least 8 characters",
        ));
    }

    let hashed = hash_token(payload.token.trim());
    let now = Utc::now().naive_utc();
    let mut conn = state.db()?;

    let user: User = dsl::users
        .filter(dsl::reset_token.eq(&hashed))
        .filter(dsl::reset_token_expires.gt(now))
        .first(&mut conn)
        .map_err(|_| AppError::bad_request("invalid or expired reset token"))?;

    let password_hash = password::hash_password(&payload.password)?;
    diesel::update(dsl::users.find(user.id))
        .set((
            dsl::password_hash.eq(password_hash),
            dsl::reset_token.eq::<Option<String>>(None),
            dsl::reset_token_expires.eq::<Option<chrono::NaiveDateTime>>(None),
            // Changing the password revokes the outstanding refresh token.
            dsl::refresh_token.eq::<Option<String>>(None),
            dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    tracing::info!(user_id = %user.id, "password reset completed");
    Ok(Json(ApiResponse::message("password updated")))
}

/// Issues an access token and rotates the stored refresh token, returning the
/// Set-Cookie header for the new value.
fn issue_tokens(
    state: &AppState,
    conn: &mut PgConnection,
    user: &User,
) -> AppResult<(HeaderMap, TokenData)> {
    let access_token = state
        .jwt
        .generate_token(user.id, &user.email, &user.role)
        .map_err(AppError::from)?;

    let now = Utc::now();
    let refresh_value = generate_token();
    let refresh_expires = now + ChronoDuration::days(state.config.refresh_token_expiry_days);

    diesel::update(dsl::users.find(user.id))
        .set((
            dsl::refresh_token.eq(Some(hash_token(&refresh_value))),
            dsl::updated_at.eq(now.naive_utc()),
        ))
        .execute(conn)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_refresh_cookie(&state.config, &refresh_value, refresh_expires)?,
    );

    let data = TokenData {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.config.jwt_expiry_minutes * 60,
        user: UserProfile::from(user.clone()),
    };

    Ok((headers, data))
}

fn build_refresh_cookie(
    config: &AppConfig,
    token: &str,
    expires_at: chrono::DateTime<Utc>,
) -> AppResult<HeaderValue> {
    let max_age = ChronoDuration::days(config.refresh_token_expiry_days).num_seconds();

    let mut parts = vec![format!("{}={}", REFRESH_COOKIE_NAME, token)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Strict".into());
    parts.push(format!("Max-Age={}", max_age));
    parts.push(format!("Expires={}", expires_at.to_rfc2822()));
    if config.refresh_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &config.refresh_cookie_domain {
        parts.push(format!("Domain={}", domain));
    }

    finish_cookie(parts)
}

fn build_clear_refresh_cookie(config: &AppConfig) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{}=", REFRESH_COOKIE_NAME)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Strict".into());
    parts.push("Max-Age=0".into());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());
    if config.refresh_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &config.refresh_cookie_domain {
        parts.push(format!("Domain={}", domain));
    }

    finish_cookie(parts)
}

// A configured cookie domain is the only segment that can carry
// header-unsafe characters.
fn finish_cookie(parts: Vec<String>) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("refresh cookie is not header-safe: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_domain(domain: Option<&str>) -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/db".to_string(),
            database_max_pool_size: 1,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "secret".to_string(),
            jwt_issuer: "issuer".to_string(),
            jwt_audience: "audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            refresh_cookie_secure: true,
            refresh_cookie_domain: domain.map(str::to_string),
            reset_token_expiry_minutes: 60,
            cors_allowed_origin: None,
            rate_limit_enabled: false,
            rate_limit_max_requests: 120,
            rate_limit_window_seconds: 60,
        }
    }

    #[test]
    fn refresh_cookie_carries_configured_attributes() {
        let config = config_with_domain(Some("example.com"));
        let value = build_refresh_cookie(&config, "tok", Utc::now()).unwrap();
        let cookie = value.to_str().unwrap();
        assert!(cookie.starts_with("refresh_token=tok"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("Domain=example.com"));
    }

    #[test]
    fn header_unsafe_domain_is_an_error_not_a_panic() {
        let config = config_with_domain(Some("bad\ndomain"));
        assert!(build_refresh_cookie(&config, "tok", Utc::now()).is_err());
        assert!(build_clear_refresh_cookie(&config).is_err());
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let config = config_with_domain(None);
        let value = build_clear_refresh_cookie(&config).unwrap();
        let cookie = value.to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));
        assert!(!cookie.contains("Domain="));
    }
}
