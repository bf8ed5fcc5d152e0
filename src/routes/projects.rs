use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{NewProject, Project},
    response::ApiResponse,
    schema::{projects, tasks},
    state::AppState,
    utils::json::{classify_nullable, NullableValue},
};

use super::to_iso;

#[derive(Serialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub owner_id: Uuid,
    pub task_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub summary: ProjectSummary,
    pub tasks_by_status: HashMap<String, i64>,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = projects)]
struct ProjectChangeset<'a> {
    name: Option<&'a str>,
    description: Option<Option<&'a str>>,
    color: Option<Option<&'a str>>,
}

pub async fn list_projects(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<Vec<ProjectSummary>>>> {
    let mut conn = state.db()?;

    let mut query = projects::table.order(projects::name.asc()).into_boxed();
    if !user.is_admin() {
        query = query.filter(projects::owner_id.eq(user.user_id));
    }
    let project_list: Vec<Project> = query.load(&mut conn)?;

    let counts: Vec<(Option<Uuid>, i64)> = tasks::table
        .filter(tasks::project_id.is_not_null())
        .group_by(tasks::project_id)
        .select((tasks::project_id, count_star()))
        .load(&mut conn)?;
    let count_map: HashMap<Uuid, i64> = counts
        .into_iter()
        .filter_map(|(id, count)| id.map(|id| (id, count)))
        .collect();

    let response = project_list
        .into_iter()
        .map(|project| {
            let task_count = *count_map.get(&project.id).unwrap_or(&0);
            build_summary(project, task_count)
        })
        .collect();

    Ok(Json(ApiResponse::ok("projects", response)))
}

pub async fn create_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateProjectRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<ProjectSummary>>)> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }

    let new_project = NewProject {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: payload
            .description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        color: payload
            .color
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        owner_id: user.user_id,
    };

    let mut conn = state.db()?;
    diesel::insert_into(projects::table)
        .values(&new_project)
        .execute(&mut conn)?;

    let project: Project = projects::table.find(new_project.id).first(&mut conn)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("project created", build_summary(project, 0))),
    ))
}

pub async fn get_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ProjectDetail>>> {
    let mut conn = state.db()?;
    let project: Project = projects::table.find(project_id).first(&mut conn)?;
    ensure_can_view(&user, &project)?;

    let status_rows: Vec<(String, i64)> = tasks::table
        .filter(tasks::project_id.eq(project_id))
        .group_by(tasks::status)
        .select((tasks::status, count_star()))
        .load(&mut conn)?;

    let tasks_by_status: HashMap<String, i64> = status_rows.into_iter().collect();
    let task_count = tasks_by_status.values().copied().sum();

    Ok(Json(ApiResponse::ok(
        "project",
        ProjectDetail {
            summary: build_summary(project, task_count),
            tasks_by_status,
        },
    )))
}

pub async fn update_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(project_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<ApiResponse<ProjectSummary>>> {
    let mut conn = state.db()?;
    let existing: Project = projects::table.find(project_id).first(&mut conn)?;
    ensure_can_modify(&user, &existing)?;

    let mut new_name: Option<String> = None;
    if let Some(value) = body.get("name") {
        let candidate = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::bad_request("name must be a non-empty string"))?;
        if candidate != existing.name {
            new_name = Some(candidate.to_string());
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

    let mut color_change: Option<Option<String>> = None;
    match classify_nullable(body.get("color")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => color_change = Some(None),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::bad_request("color must not be empty"));
            }
            if existing.color.as_deref() != Some(trimmed) {
                color_change = Some(Some(trimmed.to_string()));
            }
        }
    }

    if new_name.is_none() && description_change.is_none() && color_change.is_none() {
        let task_count = count_tasks(&mut conn, project_id)?;
        return Ok(Json(ApiResponse::ok(
            "project",
            build_summary(existing, task_count),
        )));
    }

    let changeset = ProjectChangeset {
        name: new_name.as_deref(),
        description: description_change
            .as_ref()
            .map(|opt| opt.as_ref().map(|value| value.as_str())),
        color: color_change
            .as_ref()
            .map(|opt| opt.as_ref().map(|value| value.as_str())),
    };

    let now = Utc::now().naive_utc();
    diesel::update(projects::table.find(project_id))
        .set((&changeset, projects::updated_at.eq(now)))
        .execute(&mut conn)?;

    let updated: Project = projects::table.find(project_id).first(&mut conn)?;
    let task_count = count_tasks(&mut conn, project_id)?;
    Ok(Json(ApiResponse::ok(
        "project updated",
        build_summary(updated, task_count),
    )))
}

pub async fn delete_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<()>>> {
    let mut conn = state.db()?;
    let existing: Project = projects::table.find(project_id).first(&mut conn)?;
    ensure_can_modify(&user, &existing)?;

    // Tasks under the project go with it (FK cascade).
    diesel::delete(projects::table.find(project_id)).execute(&mut conn)?;
    tracing::info!(%project_id, "deleted project");
    Ok(Json(ApiResponse::message("project deleted")))
}

fn ensure_can_view(user: &AuthenticatedUser, project: &Project) -> AppResult<()> {
    if user.is_admin() || project.owner_id == user.user_id {
        Ok(())
    } else {
        Err(AppError::not_found())
    }
}

fn ensure_can_modify(user: &AuthenticatedUser, project: &Project) -> AppResult<()> {
    if user.is_admin() || project.owner_id == user.user_id {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

fn count_tasks(conn: &mut PgConnection, project_id: Uuid) -> AppResult<i64> {
    let count = tasks::table
        .filter(tasks::project_id.eq(project_id))
        .select(count_star())
        .first(conn)?;
    Ok(count)
}

fn build_summary(project: Project, task_count: i64) -> ProjectSummary {
    ProjectSummary {
        id: project.id,
        name: project.name,
        description: project.description,
        color: project.color,
        owner_id: project.owner_id,
        task_count,
        created_at: to_iso(project.created_at),
        updated_at: to_iso(project.updated_at),
    }
}
