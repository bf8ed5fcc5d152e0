use std::str::FromStr;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::User,
    response::ApiResponse,
    schema::users,
    state::AppState,
    types::UserRole,
    utils::json::{classify_nullable, NullableValue},
};

use super::to_iso;

#[derive(Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub notification_preferences: Value,
    pub created_at: String,
    pub updated_at: String,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            avatar: user.avatar,
            role: user.role,
            is_active: user.is_active,
            email_verified: user.email_verified,
            notification_preferences: user.notification_preferences,
            created_at: to_iso(user.created_at),
            updated_at: to_iso(user.updated_at),
        }
    }
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = users)]
struct ProfileChangeset<'a> {
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    avatar: Option<Option<&'a str>>,
    notification_preferences: Option<&'a Value>,
}

#[derive(Deserialize)]
pub struct AdminUpdateUserRequest {
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<Vec<UserProfile>>>> {
    user.require_admin()?;

    let mut conn = state.db()?;
    let records: Vec<User> = users::table.order(users::email.asc()).load(&mut conn)?;

    let profiles = records.into_iter().map(UserProfile::from).collect();
    Ok(Json(ApiResponse::ok("users", profiles)))
}

pub async fn get_user(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<UserProfile>>> {
    let mut conn = state.db()?;
    let record: User = users::table.find(user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::ok("user", UserProfile::from(record))))
}

pub async fn update_me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<ApiResponse<UserProfile>>> {
    let mut conn = state.db()?;
    let existing: User = users::table.find(user.user_id).first(&mut conn)?;

    let mut first_name: Option<String> = None;
    if let Some(value) = body.get("first_name") {
        let candidate = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::bad_request("first_name must be a non-empty string"))?;
        if candidate != existing.first_name {
            first_name = Some(candidate.to_string());
        }
    }

    let mut last_name: Option<String> = None;
    if let Some(value) = body.get("last_name") {
        let candidate = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::bad_request("last_name must be a non-empty string"))?;
        if candidate != existing.last_name {
            last_name = Some(candidate.to_string());
        }
    }

    let mut avatar_change: Option<Option<String>> = None;
    match classify_nullable(body.get("avatar")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => avatar_change = Some(None),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::bad_request("avatar must not be empty"));
            }
            avatar_change = Some(Some(trimmed.to_string()));
        }
    }

    let mut preferences: Option<Value> = None;
    if let Some(value) = body.get("notification_preferences") {
        if !value.is_object() {
            return Err(AppError::bad_request(
                "notification_preferences must be an object",
            ));
        }
        preferences = Some(value.clone());
    }

    if first_name.is_none()
        && last_name.is_none()
        && avatar_change.is_none()
        && preferences.is_none()
    {
        return Ok(Json(ApiResponse::ok("profile", UserProfile::from(existing))));
    }

    let changeset = ProfileChangeset {
        first_name: first_name.as_deref(),
        last_name: last_name.as_deref(),
        avatar: avatar_change
            .as_ref()
            .map(|opt| opt.as_ref().map(|value| value.as_str())),
        notification_preferences: preferences.as_ref(),
    };

    let now = Utc::now().naive_utc();
    diesel::update(users::table.find(user.user_id))
        .set((&changeset, users::updated_at.eq(now)))
        .execute(&mut conn)?;

    let updated: User = users::table.find(user.user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::ok(
        "profile updated",
        UserProfile::from(updated),
    )))
}

pub async fn update_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<AdminUpdateUserRequest>,
) -> AppResult<Json<ApiResponse<UserProfile>>> {
    user.require_admin()?;

    let mut conn = state.db()?;
    let existing: User = users::table.find(user_id).first(&mut conn)?;

    let mut role: Option<String> = None;
    if let Some(ref candidate) = payload.role {
        let parsed = UserRole::from_str(candidate)?;
        if parsed.as_str() != existing.role {
            role = Some(parsed.as_str().to_string());
        }
    }

    if role.is_none() && payload.is_active.is_none() {
        return Ok(Json(ApiResponse::ok("user", UserProfile::from(existing))));
    }

    let now = Utc::now().naive_utc();
    diesel::update(users::table.find(user_id))
        .set((
            role.map(|r| users::role.eq(r)),
            payload.is_active.map(|a| users::is_active.eq(a)),
            users::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    // Deactivation also revokes the refresh token.
    if payload.is_active == Some(false) {
        diesel::update(users::table.find(user_id))
            .set(users::refresh_token.eq::<Option<String>>(None))
            .execute(&mut conn)?;
    }

    let updated: User = users::table.find(user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::ok(
        "user updated",
        UserProfile::from(updated),
    )))
}

pub async fn delete_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<()>>> {
    user.require_admin()?;
    if user.user_id == user_id {
        return Err(AppError::bad_request("cannot delete your own account"));
    }

    let mut conn = state.db()?;
    let deleted = diesel::delete(users::table.find(user_id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }

    tracing::info!(%user_id, "deleted user");
    Ok(Json(ApiResponse::message("user deleted")))
}
