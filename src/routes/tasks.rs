use std::collections::HashMap;
use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{NewTask, NewTaskTag, Project, Tag, Task, User},
    notify::notify_users,
    response::ApiResponse,
    schema::{comments, projects, tags, task_tags, tasks},
    state::AppState,
    types::{NotificationKind, TaskPriority, TaskStatus},
    utils::json::{classify_nullable, NullableValue},
};

use super::to_iso;

#[derive(Serialize, Clone)]
pub struct TagRef {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub due_date: Option<String>,
    pub project_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub created_by_id: Uuid,
    pub tags: Vec<TagRef>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: TaskResponse,
    pub comment_count: i64,
}

#[derive(Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub project_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<String>,
    pub project_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct AssignTagsRequest {
    pub tag_ids: Vec<Uuid>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = tasks)]
struct TaskChangeset<'a> {
    title: Option<&'a str>,
    description: Option<Option<&'a str>>,
    status: Option<&'a str>,
    priority: Option<&'a str>,
    due_date: Option<Option<NaiveDateTime>>,
    project_id: Option<Option<Uuid>>,
    assignee_id: Option<Option<Uuid>>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<TaskListQuery>,
) -> AppResult<Json<ApiResponse<Vec<TaskResponse>>>> {
    let mut conn = state.db()?;

    let mut query = tasks::table.order(tasks::created_at.desc()).into_boxed();

    if let Some(ref status) = params.status {
        let status = TaskStatus::from_str(status)?;
        query = query.filter(tasks::status.eq(status.as_str()));
    }
    if let Some(ref priority) = params.priority {
        let priority = TaskPriority::from_str(priority)?;
        query = query.filter(tasks::priority.eq(priority.as_str()));
    }
    if let Some(project_id) = params.project_id {
        query = query.filter(tasks::project_id.eq(project_id));
    }
    if let Some(assignee_id) = params.assignee_id {
        query = query.filter(tasks::assignee_id.eq(assignee_id));
    }
    if let Some(created_by) = params.created_by {
        query = query.filter(tasks::created_by_id.eq(created_by));
    }

    if !user.is_admin() {
        let owned_projects: Vec<Uuid> = projects::table
            .filter(projects::owner_id.eq(user.user_id))
            .select(projects::id)
            .load(&mut conn)?;
        query = query.filter(
            tasks::created_by_id
                .eq(user.user_id)
                .or(tasks::assignee_id.eq(user.user_id))
                .or(tasks::project_id.eq_any(owned_projects)),
        );
    }

    let task_list: Vec<Task> = query.load(&mut conn)?;
    let tag_map = load_tags_for_tasks(&mut conn, &task_list)?;

    let response = task_list
        .into_iter()
        .map(|task| {
            let task_tags = tag_map.get(&task.id).cloned().unwrap_or_default();
            build_response(task, task_tags)
        })
        .collect();

    Ok(Json(ApiResponse::ok("tasks", response)))
}

pub async fn create_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateTaskRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<TaskResponse>>)> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }

    let status = match payload.status.as_deref() {
        Some(value) => TaskStatus::from_str(value)?,
        None => TaskStatus::default(),
    };
    let priority = match payload.priority.as_deref() {
        Some(value) => TaskPriority::from_str(value)?,
        None => TaskPriority::default(),
    };
    let due_date = payload.due_date.as_deref().map(parse_due_date).transpose()?;

    let mut conn = state.db()?;

    if let Some(project_id) = payload.project_id {
        let project: Project = projects::table
            .find(project_id)
            .first(&mut conn)
            .map_err(|_| AppError::bad_request("project does not exist"))?;
        if !user.is_admin() && project.owner_id != user.user_id {
            return Err(AppError::forbidden());
        }
    }

    if let Some(assignee_id) = payload.assignee_id {
        ensure_assignable(&mut conn, assignee_id)?;
    }

    if !payload.tag_ids.is_empty() {
        ensure_tags_exist(&mut conn, &payload.tag_ids)?;
    }

    let new_task = NewTask {
        id: Uuid::new_v4(),
        title: title.to_string(),
        description: payload
            .description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        status: status.as_str().to_string(),
        priority: priority.as_str().to_string(),
        due_date,
        project_id: payload.project_id,
        assignee_id: payload.assignee_id,
        created_by_id: user.user_id,
    };

    diesel::insert_into(tasks::table)
        .values(&new_task)
        .execute(&mut conn)?;

    if !payload.tag_ids.is_empty() {
        let rows: Vec<NewTaskTag> = payload
            .tag_ids
            .iter()
            .map(|tag_id| NewTaskTag {
                task_id: new_task.id,
                tag_id: *tag_id,
            })
            .collect();
        diesel::insert_into(task_tags::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
    }

    let task: Task = tasks::table.find(new_task.id).first(&mut conn)?;

    if let Some(assignee_id) = task.assignee_id {
        notify_users(
            &mut conn,
            &[assignee_id],
            user.user_id,
            NotificationKind::TaskAssigned,
            "Task assigned to you",
            &format!("You have been assigned '{}'", task.title),
            Some(json!({ "task_id": task.id })),
        );
    }

    let tag_map = load_tags_for_tasks(&mut conn, std::slice::from_ref(&task))?;
    let task_tag_refs = tag_map.get(&task.id).cloned().unwrap_or_default();
    tracing::info!(task_id = %task.id, "created task");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "task created",
            build_response(task, task_tag_refs),
        )),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<TaskDetail>>> {
    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &task)?;

    let tag_map = load_tags_for_tasks(&mut conn, std::slice::from_ref(&task))?;
    let task_tag_refs = tag_map.get(&task.id).cloned().unwrap_or_default();

    let comment_count: i64 = comments::table
        .filter(comments::task_id.eq(task_id))
        .select(count_star())
        .first(&mut conn)?;

    Ok(Json(ApiResponse::ok(
        "task",
        TaskDetail {
            task: build_response(task, task_tag_refs),
            comment_count,
        },
    )))
}

pub async fn update_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<ApiResponse<TaskResponse>>> {
    let mut conn = state.db()?;
    let existing: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &existing)?;

    let mut new_title: Option<String> = None;
    if let Some(value) = body.get("title") {
        let candidate = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::bad_request("title must be a non-empty string"))?;
        if candidate != existing.title {
            new_title = Some(candidate.to_string());
        }
    }

    let mut description_change: Option<Option<String>> = None;
    match classify_nullable(body.get("description")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => description_change = Some(None),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if existing.description.as_deref() != Some(trimmed) {
                description_change = Some(Some(trimmed.to_string()));
            }
        }
    }

    let mut new_status: Option<TaskStatus> = None;
    if let Some(value) = body.get("status") {
        let candidate = value
            .as_str()
            .ok_or_else(|| AppError::bad_request("status must be a string"))?;
        let parsed = TaskStatus::from_str(candidate)?;
        if parsed.as_str() != existing.status {
            new_status = Some(parsed);
        }
    }

    let mut new_priority: Option<TaskPriority> = None;
    if let Some(value) = body.get("priority") {
        let candidate = value
            .as_str()
            .ok_or_else(|| AppError::bad_request("priority must be a string"))?;
        let parsed = TaskPriority::from_str(candidate)?;
        if parsed.as_str() != existing.priority {
            new_priority = Some(parsed);
        }
    }

    let mut due_date_change: Option<Option<NaiveDateTime>> = None;
    match classify_nullable(body.get("due_date")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => due_date_change = Some(None),
        NullableValue::String(value) => {
            let parsed = parse_due_date(&value)?;
            if existing.due_date != Some(parsed) {
                due_date_change = Some(Some(parsed));
            }
        }
    }

    let mut project_change: Option<Option<Uuid>> = None;
    if let Some(value) = body.get("project_id") {
        match value {
            Value::Null => {
                if existing.project_id.is_some() {
                    project_change = Some(None);
                }
            }
            Value::String(raw) => {
                let project_id = Uuid::parse_str(raw)
                    .map_err(|_| AppError::bad_request("project_id must be a UUID"))?;
                let project: Project = projects::table
                    .find(project_id)
                    .first(&mut conn)
                    .map_err(|_| AppError::bad_request("project does not exist"))?;
                if !user.is_admin() && project.owner_id != user.user_id {
                    return Err(AppError::forbidden());
                }
                if existing.project_id != Some(project_id) {
                    project_change = Some(Some(project_id));
                }
            }
            _ => return Err(AppError::bad_request("project_id must be a UUID or null")),
        }
    }

    let mut assignee_change: Option<Option<Uuid>> = None;
    if let Some(value) = body.get("assignee_id") {
        match value {
            Value::Null => {
                if existing.assignee_id.is_some() {
                    assignee_change = Some(None);
                }
            }
            Value::String(raw) => {
                let assignee_id = Uuid::parse_str(raw)
                    .map_err(|_| AppError::bad_request("assignee_id must be a UUID"))?;
                ensure_assignable(&mut conn, assignee_id)?;
                if existing.assignee_id != Some(assignee_id) {
                    assignee_change = Some(Some(assignee_id));
                }
            }
            _ => return Err(AppError::bad_request("assignee_id must be a UUID or null")),
        }
    }

    let changed = new_title.is_some()
        || description_change.is_some()
        || new_status.is_some()
        || new_priority.is_some()
        || due_date_change.is_some()
        || project_change.is_some()
        || assignee_change.is_some();

    if !changed {
        let tag_map = load_tags_for_tasks(&mut conn, std::slice::from_ref(&existing))?;
        let task_tag_refs = tag_map.get(&existing.id).cloned().unwrap_or_default();
        return Ok(Json(ApiResponse::ok(
            "task",
            build_response(existing, task_tag_refs),
        )));
    }

    let changeset = TaskChangeset {
        title: new_title.as_deref(),
        description: description_change
            .as_ref()
            .map(|opt| opt.as_ref().map(|value| value.as_str())),
        status: new_status.map(|s| s.as_str()),
        priority: new_priority.map(|p| p.as_str()),
        due_date: due_date_change,
        project_id: project_change,
        assignee_id: assignee_change,
    };

    let now = Utc::now().naive_utc();
    diesel::update(tasks::table.find(task_id))
        .set((&changeset, tasks::updated_at.eq(now)))
        .execute(&mut conn)?;

    let updated: Task = tasks::table.find(task_id).first(&mut conn)?;

    // A fresh assignee gets an assignment notification; otherwise the current
    // assignee hears about the update.
    if let Some(Some(new_assignee)) = assignee_change {
        notify_users(
            &mut conn,
            &[new_assignee],
            user.user_id,
            NotificationKind::TaskAssigned,
            "Task assigned to you",
            &format!("You have been assigned '{}'", updated.title),
            Some(json!({ "task_id": updated.id })),
        );
    } else if let Some(assignee_id) = updated.assignee_id {
        notify_users(
            &mut conn,
            &[assignee_id],
            user.user_id,
            NotificationKind::TaskUpdated,
            "Task updated",
            &format!("'{}' was updated", updated.title),
            Some(json!({ "task_id": updated.id })),
        );
    }

    let tag_map = load_tags_for_tasks(&mut conn, std::slice::from_ref(&updated))?;
    let task_tag_refs = tag_map.get(&updated.id).cloned().unwrap_or_default();
    Ok(Json(ApiResponse::ok(
        "task updated",
        build_response(updated, task_tag_refs),
    )))
}

pub async fn delete_task(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<()>>> {
    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_delete(&mut conn, &user, &task)?;

    diesel::delete(tasks::table.find(task_id)).execute(&mut conn)?;
    tracing::info!(%task_id, "deleted task");
    Ok(Json(ApiResponse::message("task deleted")))
}

pub async fn assign_tags(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(task_id): Path<Uuid>,
    Json(payload): Json<AssignTagsRequest>,
) -> AppResult<StatusCode> {
    if payload.tag_ids.is_empty() {
        return Err(AppError::bad_request("tag_ids must not be empty"));
    }

    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &task)?;

    ensure_tags_exist(&mut conn, &payload.tag_ids)?;

    let rows: Vec<NewTaskTag> = payload
        .tag_ids
        .iter()
        .map(|tag_id| NewTaskTag {
            task_id,
            tag_id: *tag_id,
        })
        .collect();

    diesel::insert_into(task_tags::table)
        .values(&rows)
        .on_conflict_do_nothing()
        .execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_tag(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((task_id, tag_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let task: Task = tasks::table.find(task_id).first(&mut conn)?;
    ensure_can_view(&mut conn, &user, &task)?;

    diesel::delete(
        task_tags::table
            .filter(task_tags::task_id.eq(task_id))
            .filter(task_tags::tag_id.eq(tag_id)),
    )
    .execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn ensure_can_view(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
    task: &Task,
) -> AppResult<()> {
    if user.is_admin()
        || task.created_by_id == user.user_id
        || task.assignee_id == Some(user.user_id)
    {
        return Ok(());
    }
    if let Some(project_id) = task.project_id {
        let owner: Uuid = projects::table
            .find(project_id)
            .select(projects::owner_id)
            .first(conn)?;
        if owner == user.user_id {
            return Ok(());
        }
    }
    Err(AppError::not_found())
}

fn ensure_can_delete(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
    task: &Task,
) -> AppResult<()> {
    if user.is_admin() || task.created_by_id == user.user_id {
        return Ok(());
    }
    if let Some(project_id) = task.project_id {
        let owner: Uuid = projects::table
            .find(project_id)
            .select(projects::owner_id)
            .first(conn)?;
        if owner == user.user_id {
            return Ok(());
        }
    }
    Err(AppError::forbidden())
}

fn ensure_assignable(conn: &mut PgConnection, assignee_id: Uuid) -> AppResult<()> {
    let assignee: User = crate::schema::users::table
        .find(assignee_id)
        .first(conn)
        .map_err(|_| AppError::bad_request("assignee does not exist"))?;
    if !assignee.is_active {
        return Err(AppError::bad_request("assignee is deactivated"));
    }
    Ok(())
}

fn ensure_tags_exist(conn: &mut PgConnection, tag_ids: &[Uuid]) -> AppResult<()> {
    let existing: Vec<Tag> = tags::table.filter(tags::id.eq_any(tag_ids)).load(conn)?;
    if existing.len() != tag_ids.len() {
        return Err(AppError::bad_request("one or more tags do not exist"));
    }
    Ok(())
}

fn load_tags_for_tasks(
    conn: &mut PgConnection,
    task_list: &[Task],
) -> AppResult<HashMap<Uuid, Vec<TagRef>>> {
    let task_ids: Vec<Uuid> = task_list.iter().map(|task| task.id).collect();
    if task_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Uuid, Tag)> = task_tags::table
        .inner_join(tags::table)
        .filter(task_tags::task_id.eq_any(&task_ids))
        .select((task_tags::task_id, tags::all_columns))
        .order(tags::name.asc())
        .load(conn)?;

    let mut map: HashMap<Uuid, Vec<TagRef>> = HashMap::new();
    for (task_id, tag) in rows {
        map.entry(task_id).or_default().push(TagRef {
            id: tag.id,
            name: tag.name,
            color: tag.color,
        });
    }
    Ok(map)
}

fn parse_due_date(raw: &str) -> Result<NaiveDateTime, AppError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .map_err(|_| AppError::bad_request("due_date must be an RFC 3339 timestamp"))
}

fn build_response(task: Task, task_tags: Vec<TagRef>) -> TaskResponse {
    TaskResponse {
        id: task.id,
        title: task.title,
        description: task.description,
        status: task.status,
        priority: task.priority,
        due_date: task.due_date.map(to_iso),
        project_id: task.project_id,
        assignee_id: task.assignee_id,
        created_by_id: task.created_by_id,
        tags: task_tags,
        created_at: to_iso(task.created_at),
        updated_at: to_iso(task.updated_at),
    }
}
