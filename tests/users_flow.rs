mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, parse_envelope_data, TestApp};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct UserProfile {
    #[allow(dead_code)]
    id: Uuid,
    email: String,
    role: String,
    is_active: bool,
    avatar: Option<String>,
    first_name: String,
}

#[tokio::test]
async fn admin_manages_accounts() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let admin_id = app
        .insert_user("root@example.com", "rootpass1", "admin")
        .await?;
    let member_id = app
        .insert_user("member@example.com", "memberpass", "user")
        .await?;
    let admin_token = app.login_token("root@example.com", "rootpass1").await?;
    let member_token = app.login_token("member@example.com", "memberpass").await?;

    // Listing is admin-only.
    let forbidden = app.get("/api/users", Some(&member_token)).await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let list = app.get("/api/users", Some(&admin_token)).await?;
    assert_eq!(list.status(), StatusCode::OK);
    let body = body_to_vec(list.into_body()).await?;
    let listed: Vec<UserProfile> = parse_envelope_data(&body)?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].email, "member@example.com");
    assert_eq!(listed[1].email, "root@example.com");

    let promote = app
        .patch_json(
            &format!("/api/users/{member_id}"),
            &serde_json::json!({ "role": "admin" }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(promote.status(), StatusCode::OK);
    let body = body_to_vec(promote.into_body()).await?;
    let promoted: UserProfile = parse_envelope_data(&body)?;
    assert_eq!(promoted.role, "admin");

    let bad_role = app
        .patch_json(
            &format!("/api/users/{member_id}"),
            &serde_json::json!({ "role": "superuser" }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(bad_role.status(), StatusCode::BAD_REQUEST);

    let deactivate = app
        .patch_json(
            &format!("/api/users/{member_id}"),
            &serde_json::json!({ "is_active": false }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(deactivate.status(), StatusCode::OK);
    let body = body_to_vec(deactivate.into_body()).await?;
    let deactivated: UserProfile = parse_envelope_data(&body)?;
    assert!(!deactivated.is_active);

    // A deactivated account cannot log back in.
    let login = app
        .post_json(
            "/api/auth/login",
            &serde_json::json!({
                "email": "member@example.com",
                "password": "memberpass"
            }),
            None,
        )
        .await?;
    assert_eq!(login.status(), StatusCode::UNAUTHORIZED);

    let self_delete = app
        .delete(&format!("/api/users/{admin_id}"), Some(&admin_token))
        .await?;
    assert_eq!(self_delete.status(), StatusCode::BAD_REQUEST);

    let delete = app
        .delete(&format!("/api/users/{member_id}"), Some(&admin_token))
        .await?;
    assert_eq!(delete.status(), StatusCode::OK);

    let gone = app
        .get(&format!("/api/users/{member_id}"), Some(&admin_token))
        .await?;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn profile_updates_are_self_service() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("profile@example.com", "profilepass", "user")
        .await?;
    let token = app.login_token("profile@example.com", "profilepass").await?;

    let update = app
        .patch_json(
            "/api/users/me",
            &serde_json::json!({
                "first_name": "Renamed",
                "avatar": "https://cdn.example.com/a.png"
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(update.status(), StatusCode::OK);
    let body = body_to_vec(update.into_body()).await?;
    let profile: UserProfile = parse_envelope_data(&body)?;
    assert_eq!(profile.first_name, "Renamed");
    assert_eq!(
        profile.avatar.as_deref(),
        Some("https://cdn.example.com/a.png")
    );

    let clear_avatar = app
        .patch_json(
            "/api/users/me",
            &serde_json::json!({ "avatar": null }),
            Some(&token),
        )
        .await?;
    assert_eq!(clear_avatar.status(), StatusCode::OK);
    let body = body_to_vec(clear_avatar.into_body()).await?;
    let cleared: UserProfile = parse_envelope_data(&body)?;
    assert_eq!(cleared.avatar, None);

    let bad_name = app
        .patch_json(
            "/api/users/me",
            &serde_json::json!({ "first_name": "   " }),
            Some(&token),
        )
        .await?;
    assert_eq!(bad_name.status(), StatusCode::BAD_REQUEST);

    // Plain users cannot touch the admin-only fields of other accounts.
    let other_id = app
        .insert_user("target@example.com", "targetpass", "user")
        .await?;
    let meddle = app
        .patch_json(
            &format!("/api/users/{other_id}"),
            &serde_json::json!({ "role": "admin" }),
            Some(&token),
        )
        .await?;
    assert_eq!(meddle.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn deleting_a_user_cascades_their_records() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("admin2@example.com", "adminpass2", "admin")
        .await?;
    let leaver_id = app
        .insert_user("leaver@example.com", "leaverpass", "user")
        .await?;
    let admin_token = app.login_token("admin2@example.com", "adminpass2").await?;
    let leaver_token = app.login_token("leaver@example.com", "leaverpass").await?;

    #[derive(Deserialize)]
    struct Created {
        id: Uuid,
    }

    let project = app
        .post_json(
            "/api/projects",
            &serde_json::json!({ "name": "Leaver project" }),
            Some(&leaver_token),
        )
        .await?;
    assert_eq!(project.status(), StatusCode::CREATED);
    let body = body_to_vec(project.into_body()).await?;
    let project: Created = parse_envelope_data(&body)?;

    let task = app
        .post_json(
            "/api/tasks",
            &serde_json::json!({
                "title": "Leaver task",
                "project_id": project.id
            }),
            Some(&leaver_token),
        )
        .await?;
    assert_eq!(task.status(), StatusCode::CREATED);
    let body = body_to_vec(task.into_body()).await?;
    let task: Created = parse_envelope_data(&body)?;

    // An admin-owned task that merely points at the leaver must survive.
    let assigned = app
        .post_json(
            "/api/tasks",
            &serde_json::json!({
                "title": "Handover checklist",
                "assignee_id": leaver_id
            }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(assigned.status(), StatusCode::CREATED);
    let body = body_to_vec(assigned.into_body()).await?;
    let assigned: Created = parse_envelope_data(&body)?;

    let delete = app
        .delete(&format!("/api/users/{leaver_id}"), Some(&admin_token))
        .await?;
    assert_eq!(delete.status(), StatusCode::OK);

    let project_gone = app
        .get(&format!("/api/projects/{}", project.id), Some(&admin_token))
        .await?;
    assert_eq!(project_gone.status(), StatusCode::NOT_FOUND);

    let task_gone = app
        .get(&format!("/api/tasks/{}", task.id), Some(&admin_token))
        .await?;
    assert_eq!(task_gone.status(), StatusCode::NOT_FOUND);

    // The assignee reference was nulled, not cascaded.
    #[derive(Deserialize)]
    struct TaskAssignment {
        assignee_id: Option<Uuid>,
    }

    let survivor = app
        .get(&format!("/api/tasks/{}", assigned.id), Some(&admin_token))
        .await?;
    assert_eq!(survivor.status(), StatusCode::OK);
    let body = body_to_vec(survivor.into_body()).await?;
    let survivor: TaskAssignment = parse_envelope_data(&body)?;
    assert_eq!(survivor.assignee_id, None);

    app.cleanup().await?;
    Ok(())
}
