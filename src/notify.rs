//! In-process notification emission.
//!
//! Handlers call these helpers after the triggering write has succeeded; a
//! notification failure is logged, never surfaced to the request.

use diesel::prelude::*;
use diesel::PgConnection;
use serde_json::Value;
use uuid::Uuid;

use crate::models::NewNotification;
use crate::schema::{notifications, users};
use crate::types::NotificationKind;

/// Inserts a notification for `user_id` unless their preferences opt out of
/// in-app delivery. Returns whether a row was created.
pub fn notify_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    kind: NotificationKind,
    title: &str,
    message: &str,
    metadata: Option<Value>,
) -> Result<bool, diesel::result::Error> {
    let preferences: Value = users::table
        .find(user_id)
        .select(users::notification_preferences)
        .first(conn)?;

    if !in_app_enabled(&preferences) {
        return Ok(false);
    }

    let new_notification = NewNotification {
        id: Uuid::new_v4(),
        user_id,
        kind: kind.as_str().to_string(),
        title: title.to_string(),
        message: message.to_string(),
        metadata,
    };

    diesel::insert_into(notifications::table)
        .values(&new_notification)
        .execute(conn)?;

    Ok(true)
}

/// Notifies every recipient, skipping duplicates and the acting user, and
/// logging (not propagating) per-recipient failures.
pub fn notify_users(
    conn: &mut PgConnection,
    recipients: &[Uuid],
    actor_id: Uuid,
    kind: NotificationKind,
    title: &str,
    message: &str,
    metadata: Option<Value>,
) {
    let mut seen: Vec<Uuid> = Vec::with_capacity(recipients.len());
    for &recipient in recipients {
        if recipient == actor_id || seen.contains(&recipient) {
            continue;
        }
        seen.push(recipient);
        if let Err(err) = notify_user(conn, recipient, kind, title, message, metadata.clone()) {
            tracing::warn!(%recipient, kind = %kind, error = %err, "failed to create notification");
        }
    }
}

/// Missing or malformed preferences default to delivering.
fn in_app_enabled(preferences: &Value) -> bool {
    preferences
        .get("in_app")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}
