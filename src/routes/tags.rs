use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use diesel::{dsl::count_star, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{NewTag, Tag},
    response::ApiResponse,
    schema::{tags, task_tags},
    state::AppState,
    utils::json::{classify_nullable, NullableValue},
};

#[derive(Deserialize)]
pub struct CreateTagRequest {
    pub name: String,
    pub color: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = tags)]
struct TagChangeset<'a> {
    name: Option<&'a str>,
    color: Option<Option<&'a str>>,
}

#[derive(Serialize)]
pub struct TagCatalogEntry {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub usage_count: i64,
}

pub async fn list_tags(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<TagCatalogEntry>>>> {
    let mut conn = state.db()?;

    let tag_list: Vec<Tag> = tags::table.order(tags::name.asc()).load(&mut conn)?;

    let usage_rows: Vec<(Uuid, i64)> = task_tags::table
        .group_by(task_tags::tag_id)
        .select((task_tags::tag_id, count_star()))
        .load(&mut conn)?;

    let usage_map: HashMap<Uuid, i64> = usage_rows.into_iter().collect();

    let response = tag_list
        .into_iter()
        .map(|tag| TagCatalogEntry {
            id: tag.id,
            name: tag.name,
            color: tag.color,
            usage_count: *usage_map.get(&tag.id).unwrap_or(&0),
        })
        .collect();

    Ok(Json(ApiResponse::ok("tags", response)))
}

pub async fn create_tag(
    State(state): State<AppState>,
    Json(payload): Json<CreateTagRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<TagCatalogEntry>>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }

    let mut conn = state.db()?;
    let new_tag = NewTag {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        color: payload
            .color
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    };

    match diesel::insert_into(tags::table)
        .values(&new_tag)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("tag name already exists"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    let tag: Tag = tags::table.find(new_tag.id).first(&mut conn)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "tag created",
            TagCatalogEntry {
                id: tag.id,
                name: tag.name,
                color: tag.color,
                usage_count: 0,
            },
        )),
    ))
}

pub async fn update_tag(
    State(state): State<AppState>,
    Path(tag_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<ApiResponse<TagCatalogEntry>>> {
    let mut conn = state.db()?;
    let existing: Tag = tags::table.find(tag_id).first(&mut conn)?;

    let mut new_name: Option<String> = None;
    match classify_nullable(body.get("name")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => {
            return Err(AppError::bad_request("name cannot be null"));
        }
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::bad_request("name must not be empty"));
            }
            if trimmed != existing.name {
                let duplicate = tags::table
                    .filter(tags::name.eq(trimmed))
                    .filter(tags::id.ne(tag_id))
                    .first::<Tag>(&mut conn)
                    .optional()?;
                if duplicate.is_some() {
                    return Err(AppError::bad_request("tag name already exists"));
                }
                new_name = Some(trimmed.to_string());
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

    if new_name.is_none() && color_change.is_none() {
        let usage_count = usage_for_tag(&mut conn, tag_id)?;
        return Ok(Json(ApiResponse::ok(
            "tag",
            TagCatalogEntry {
                id: existing.id,
                name: existing.name,
                color: existing.color,
                usage_count,
            },
        )));
    }

    let changeset = TagChangeset {
        name: new_name.as_deref(),
        color: color_change
            .as_ref()
            .map(|opt| opt.as_ref().map(|value| value.as_str())),
    };

    diesel::update(tags::table.find(tag_id))
        .set(&changeset)
        .execute(&mut conn)?;

    let updated: Tag = tags::table.find(tag_id).first(&mut conn)?;
    let usage_count = usage_for_tag(&mut conn, tag_id)?;

    Ok(Json(ApiResponse::ok(
        "tag updated",
        TagCatalogEntry {
            id: updated.id,
            name: updated.name,
            color: updated.color,
            usage_count,
        },
    )))
}

pub async fn delete_tag(
    State(state): State<AppState>,
    Path(tag_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;

    let usage = usage_for_tag(&mut conn, tag_id)?;
    if usage > 0 {
        return Err(AppError::bad_request(
            "cannot delete tag that is still assigned to tasks",
        ));
    }

    let deleted = diesel::delete(tags::table.find(tag_id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }

    Ok(StatusCode::NO_CONTENT)
}

fn usage_for_tag(conn: &mut diesel::PgConnection, tag_id: Uuid) -> AppResult<i64> {
    let usage = task_tags::table
        .filter(task_tags::tag_id.eq(tag_id))
        .select(count_star())
        .first(conn)?;
    Ok(usage)
}
