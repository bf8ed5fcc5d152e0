use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use diesel::{dsl::count_star, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::Notification,
    response::ApiResponse,
    schema::notifications,
    state::AppState,
};

use super::to_iso;

#[derive(Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct UnreadCount {
    pub unread: i64,
}

#[derive(Deserialize)]
pub struct NotificationListQuery {
    #[serde(default)]
    pub unread: bool,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<NotificationListQuery>,
) -> AppResult<Json<ApiResponse<Vec<NotificationResponse>>>> {
    let mut conn = state.db()?;

    let mut query = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .order(notifications::created_at.desc())
        .into_boxed();
    if params.unread {
        query = query.filter(notifications::read.eq(false));
    }

    let rows: Vec<Notification> = query.load(&mut conn)?;
    let response = rows.into_iter().map(build_response).collect();
    Ok(Json(ApiResponse::ok("notifications", response)))
}

pub async fn unread_count(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<UnreadCount>>> {
    let mut conn = state.db()?;
    let unread: i64 = notifications::table
        .filter(notifications::user_id.eq(user.user_id))
        .filter(notifications::read.eq(false))
        .select(count_star())
        .first(&mut conn)?;

    Ok(Json(ApiResponse::ok("unread count", UnreadCount { unread })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(notification_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<NotificationResponse>>> {
    let mut conn = state.db()?;

    let updated = diesel::update(
        notifications::table
            .find(notification_id)
            .filter(notifications::user_id.eq(user.user_id)),
    )
    .set(notifications::read.eq(true))
    .execute(&mut conn)?;

    if updated == 0 {
        return Err(AppError::not_found());
    }

    let notification: Notification = notifications::table
        .find(notification_id)
        .first(&mut conn)?;
    Ok(Json(ApiResponse::ok(
        "notification read",
        build_response(notification),
    )))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<UnreadCount>>> {
    let mut conn = state.db()?;

    diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(user.user_id))
            .filter(notifications::read.eq(false)),
    )
    .set(notifications::read.eq(true))
    .execute(&mut conn)?;

    Ok(Json(ApiResponse::ok(
        "all notifications read",
        UnreadCount { unread: 0 },
    )))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(notification_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;

    let deleted = diesel::delete(
        notifications::table
            .find(notification_id)
            .filter(notifications::user_id.eq(user.user_id)),
    )
    .execute(&mut conn)?;

    if deleted == 0 {
        return Err(AppError::not_found());
    }

    Ok(StatusCode::NO_CONTENT)
}

fn build_response(notification: Notification) -> NotificationResponse {
    NotificationResponse {
        id: notification.id,
        kind: notification.kind,
        title: notification.title,
        message: notification.message,
        read: notification.read,
        metadata: notification.metadata,
        created_at: to_iso(notification.created_at),
    }
}
