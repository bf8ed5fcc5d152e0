use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{Comment, NewComment, Task},
    notify::notify_users,
    response::ApiResponse,
    schema::{comments, tasks, users},
    state::AppState,
    types::NotificationKind,
};

use super::{tasks::ensure_can_view, to_iso};

#[derive(Serialize)]
pub struct CommentResponse {
    pub id: Uuid,
    pub content: String,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub author_name: String,
    pub mentions: Vec<Uuid>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Deserialize)]
pub struct CreateCommentRequest {
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
}

pub async fn list_comments(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Vec<CommentResponse>>>> {
    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &task)?;

    let rows: Vec<(Comment, String, String)> = comments::table
        .inner_join(users::table)
        .filter(comments::task_id.eq(task_id))
        .order(comments::created_at.asc())
        .select((
            comments::all_columns,
            users::first_name,
            users::last_name,
        ))
        .load(&mut conn)?;

    let response = rows
        .into_iter()
        .map(|(comment, first_name, last_name)| {
            build_response(comment, format!("{first_name} {last_name}"))
        })
        .collect();

    Ok(Json(ApiResponse::ok("comments", response)))
}

pub async fn create_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
    Json(payload): Json<CreateCommentRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CommentResponse>>)> {
    let content = payload.content.trim();
    if content.is_empty() {
        return Err(AppError::bad_request("content must not be empty"));
    }

    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &task)?;

    let mut mentions = payload.mentions;
    mentions.sort();
    mentions.dedup();
    if !mentions.is_empty() {
        ensure_users_exist(&mut conn, &mentions)?;
    }

    let new_comment = NewComment {
        id: Uuid::new_v4(),
        content: content.to_string(),
        task_id,
        user_id: user.user_id,
        mentions: if mentions.is_empty() {
            None
        } else {
            Some(json!(mentions))
        },
    };

    diesel::insert_into(comments::table)
        .values(&new_comment)
        .execute(&mut conn)?;

    let comment: Comment = comments::table.find(new_comment.id).first(&mut conn)?;

    // Task participants and mentioned users hear about the comment.
    let mut recipients: Vec<Uuid> = mentions.clone();
    recipients.push(task.created_by_id);
    if let Some(assignee_id) = task.assignee_id {
        recipients.push(assignee_id);
    }
    notify_users(
        &mut conn,
        &recipients,
        user.user_id,
        NotificationKind::TaskCommented,
        "New comment",
        &format!("New comment on '{}'", task.title),
        Some(json!({ "task_id": task.id, "comment_id": comment.id })),
    );

    let author_name = author_display_name(&mut conn, user.user_id)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "comment created",
            build_response(comment, author_name),
        )),
    ))
}

pub async fn delete_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(comment_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<()>>> {
    let mut conn = state.db()?;
    let comment: Comment = comments::table.find(comment_id).first(&mut conn)?;

    if !user.is_admin() && comment.user_id != user.user_id {
        return Err(AppError::forbidden());
    }

    diesel::delete(comments::table.find(comment_id)).execute(&mut conn)?;
    Ok(Json(ApiResponse::message("comment deleted")))
}

fn ensure_users_exist(conn: &mut PgConnection, user_ids: &[Uuid]) -> AppResult<()> {
    let found: i64 = users::table
        .filter(users::id.eq_any(user_ids))
        .count()
        .first(conn)?;
    if found != user_ids.len() as i64 {
        return Err(AppError::bad_request(
            "one or more mentioned users do not exist",
        ));
    }
    Ok(())
}

fn author_display_name(conn: &mut PgConnection, user_id: Uuid) -> AppResult<String> {
    let (first_name, last_name): (String, String) = users::table
        .find(user_id)
        .select((users::first_name, users::last_name))
        .first(conn)?;
    Ok(format!("{first_name} {last_name}"))
}

fn build_response(comment: Comment, author_name: String) -> CommentResponse {
    let mentions = comment
        .mentions
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default();

    CommentResponse {
        id: comment.id,
        content: comment.content,
        task_id: comment.task_id,
        user_id: comment.user_id,
        author_name,
        mentions,
        created_at: to_iso(comment.created_at),
        updated_at: to_iso(comment.updated_at),
    }
}
