use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Action;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    authorize, db_conn, now_rfc3339, optional_str, parse_params, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const ROLES: [&str; 3] = ["admin", "teacher", "student"];

fn validate_role(raw: &str) -> Result<(), HandlerErr> {
    if ROLES.contains(&raw) {
        Ok(())
    } else {
        Err(HandlerErr::new(
            "validation_failed",
            "role must be one of: admin, teacher, student",
        ))
    }
}

fn user_json(row: (String, String, String, String, i64)) -> serde_json::Value {
    let (id, name, email, role, active) = row;
    json!({
        "id": id,
        "name": name,
        "email": email,
        "role": role,
        "active": active != 0,
    })
}

fn fetch_user(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<(String, String, String, String, i64)>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, email, role, active FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?)
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::UserRead, None)?;
    let conn = db_conn(state)?;
    let role = optional_str(req, "role");
    if let Some(ref role) = role {
        validate_role(role)?;
    }

    let mut users = Vec::new();
    match role {
        Some(role) => {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role, active FROM users WHERE role = ? ORDER BY name",
            )?;
            let rows = stmt
                .query_map([role], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
            users.extend(rows.into_iter().map(user_json));
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT id, name, email, role, active FROM users ORDER BY name")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
            users.extend(rows.into_iter().map(user_json));
        }
    }

    Ok(json!({ "users": users }))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user_id = required_str(req, "userId")?;
    authorize(req, Action::UserRead, Some(&user_id))?;
    let conn = db_conn(state)?;
    let row = fetch_user(conn, &user_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "user not found"))?;
    Ok(json!({ "user": user_json(row) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserInput {
    name: String,
    email: String,
    role: String,
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::UserWrite, None)?;
    let conn = db_conn(state)?;
    let input: CreateUserInput = parse_params(req)?;
    validate_role(&input.role)?;

    let existing: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&input.email], |r| {
            r.get(0)
        })
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::new(
            "validation_failed",
            "a user with this email already exists",
        ));
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, name, email, role, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&user_id, &input.name, &input.email, &input.role, now_rfc3339()),
    )?;

    let row = fetch_user(conn, &user_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "user row missing after insert"))?;
    Ok(json!({ "user": user_json(row) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserInput {
    user_id: String,
    name: Option<String>,
    email: Option<String>,
    active: Option<bool>,
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let input: UpdateUserInput = parse_params(req)?;
    authorize(req, Action::UserUpdate, Some(&input.user_id))?;
    let conn = db_conn(state)?;

    let row = fetch_user(conn, &input.user_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "user not found"))?;
    let (_, name, email, _, active) = row;

    conn.execute(
        "UPDATE users SET name = ?, email = ?, active = ? WHERE id = ?",
        (
            input.name.as_deref().unwrap_or(&name),
            input.email.as_deref().unwrap_or(&email),
            input.active.map(i64::from).unwrap_or(active),
            &input.user_id,
        ),
    )?;

    let row = fetch_user(conn, &input.user_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "user row missing after update"))?;
    Ok(json!({ "user": user_json(row) }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::UserWrite, None)?;
    let user_id = required_str(req, "userId")?;
    let conn = db_conn(state)?;
    let deleted = conn.execute("DELETE FROM users WHERE id = ?", [&user_id])?;
    if deleted == 0 {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => handle_list(state, req),
        "users.get" => handle_get(state, req),
        "users.create" => handle_create(state, req),
        "users.update" => handle_update(state, req),
        "users.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
