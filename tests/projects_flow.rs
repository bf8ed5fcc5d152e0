mod common;

use std::collections::HashMap;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, parse_envelope_data, TestApp};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct ProjectSummary {
    id: Uuid,
    name: String,
    description: Option<String>,
    color: Option<String>,
    owner_id: Uuid,
    task_count: i64,
}

#[derive(Deserialize)]
struct ProjectDetail {
    id: Uuid,
    task_count: i64,
    tasks_by_status: HashMap<String, i64>,
}

#[tokio::test]
async fn project_crud_flow() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let owner_id = app
        .insert_user("owner@example.com", "ownerpass", "user")
        .await?;
    let token = app.login_token("owner@example.com", "ownerpass").await?;

    let create = app
        .post_json(
            "/api/projects",
            &serde_json::json!({
                "name": "  Website Redesign  ",
                "description": "New landing pages",
                "color": "#3366FF"
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(create.status(), StatusCode::CREATED);
    let body = body_to_vec(create.into_body()).await?;
    let project: ProjectSummary = parse_envelope_data(&body)?;
    assert_eq!(project.name, "Website Redesign");
    assert_eq!(project.description.as_deref(), Some("New landing pages"));
    assert_eq!(project.owner_id, owner_id);
    assert_eq!(project.task_count, 0);

    // Two tasks in the project, one of them done.
    for status in ["todo", "done"] {
        let task = app
            .post_json(
                "/api/tasks",
                &serde_json::json!({
                    "title": format!("task {status}"),
                    "status": status,
                    "project_id": project.id
                }),
                Some(&token),
            )
            .await?;
        assert_eq!(task.status(), StatusCode::CREATED);
    }

    let detail = app
        .get(&format!("/api/projects/{}", project.id), Some(&token))
        .await?;
    assert_eq!(detail.status(), StatusCode::OK);
    let body = body_to_vec(detail.into_body()).await?;
    let detail: ProjectDetail = parse_envelope_data(&body)?;
    assert_eq!(detail.id, project.id);
    assert_eq!(detail.task_count, 2);
    assert_eq!(detail.tasks_by_status.get("todo"), Some(&1));
    assert_eq!(detail.tasks_by_status.get("done"), Some(&1));

    let list = app.get("/api/projects", Some(&token)).await?;
    assert_eq!(list.status(), StatusCode::OK);
    let body = body_to_vec(list.into_body()).await?;
    let listed: Vec<ProjectSummary> = parse_envelope_data(&body)?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task_count, 2);

    let update = app
        .patch_json(
            &format!("/api/projects/{}", project.id),
            &serde_json::json!({
                "name": "Website Relaunch",
                "description": null
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(update.status(), StatusCode::OK);
    let body = body_to_vec(update.into_body()).await?;
    let updated: ProjectSummary = parse_envelope_data(&body)?;
    assert_eq!(updated.name, "Website Relaunch");
    assert_eq!(updated.description, None);
    assert_eq!(updated.color.as_deref(), Some("#3366FF"));

    let delete = app
        .delete(&format!("/api/projects/{}", project.id), Some(&token))
        .await?;
    assert_eq!(delete.status(), StatusCode::OK);

    // Tasks went with the project.
    let tasks = app.get("/api/tasks", Some(&token)).await?;
    let body = body_to_vec(tasks.into_body()).await?;
    let remaining: Vec<serde_json::Value> = parse_envelope_data(&body)?;
    assert!(remaining.is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn projects_are_scoped_to_their_owner() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("first@example.com", "firstpass", "user")
        .await?;
    app.insert_user("second@example.com", "secondpass", "user")
        .await?;
    app.insert_user("admin@example.com", "adminpass", "admin")
        .await?;
    let first_token = app.login_token("first@example.com", "firstpass").await?;
    let second_token = app.login_token("second@example.com", "secondpass").await?;
    let admin_token = app.login_token("admin@example.com", "adminpass").await?;

    let create = app
        .post_json(
            "/api/projects",
            &serde_json::json!({ "name": "Private" }),
            Some(&first_token),
        )
        .await?;
    assert_eq!(create.status(), StatusCode::CREATED);
    let body = body_to_vec(create.into_body()).await?;
    let project: ProjectSummary = parse_envelope_data(&body)?;

    // Another user cannot even learn the project exists.
    let peek = app
        .get(&format!("/api/projects/{}", project.id), Some(&second_token))
        .await?;
    assert_eq!(peek.status(), StatusCode::NOT_FOUND);

    let list = app.get("/api/projects", Some(&second_token)).await?;
    let body = body_to_vec(list.into_body()).await?;
    let visible: Vec<ProjectSummary> = parse_envelope_data(&body)?;
    assert!(visible.is_empty());

    // Admins see everything.
    let admin_view = app
        .get(&format!("/api/projects/{}", project.id), Some(&admin_token))
        .await?;
    assert_eq!(admin_view.status(), StatusCode::OK);

    app.cleanup().await?;
    Ok(())
}
