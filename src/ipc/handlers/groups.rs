use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Action;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    authorize, db_conn, now_rfc3339, parse_params, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

type GroupRowTuple = (String, String, String, String, i64);

fn member_ids(conn: &Connection, group_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT student_id FROM group_members WHERE group_id = ? ORDER BY student_id")?;
    Ok(stmt
        .query_map([group_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?)
}

fn group_json(conn: &Connection, row: GroupRowTuple) -> Result<serde_json::Value, HandlerErr> {
    let (id, name, grade_label, director_id, active) = row;
    let students = member_ids(conn, &id)?;
    Ok(json!({
        "id": id,
        "name": name,
        "gradeLabel": grade_label,
        "directorId": director_id,
        "active": active != 0,
        "studentIds": students,
    }))
}

fn fetch_group(conn: &Connection, group_id: &str) -> Result<Option<GroupRowTuple>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, grade_label, director_id, active FROM groups WHERE id = ?",
            [group_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?)
}

fn students_all_exist(conn: &Connection, student_ids: &[String]) -> Result<(), HandlerErr> {
    for student_id in student_ids {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ? AND role = 'student'",
                [student_id],
                |r| r.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id })));
        }
    }
    Ok(())
}

fn replace_members(
    conn: &Connection,
    group_id: &str,
    student_ids: &[String],
) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM group_members WHERE group_id = ?", [group_id])?;
    for student_id in student_ids {
        conn.execute(
            "INSERT OR IGNORE INTO group_members(group_id, student_id) VALUES(?, ?)",
            (group_id, student_id),
        )?;
    }
    Ok(())
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GroupRead, None)?;
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name, grade_label, director_id, active FROM groups ORDER BY name")?;
    let rows: Vec<GroupRowTuple> = stmt
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        groups.push(group_json(conn, row)?);
    }
    Ok(json!({ "groups": groups }))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GroupRead, None)?;
    let group_id = required_str(req, "groupId")?;
    let conn = db_conn(state)?;
    let row = fetch_group(conn, &group_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "group not found"))?;
    Ok(json!({ "group": group_json(conn, row)? }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupInput {
    name: String,
    grade_label: String,
    director_id: String,
    #[serde(default)]
    student_ids: Vec<String>,
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GroupWrite, None)?;
    let conn = db_conn(state)?;
    let input: CreateGroupInput = parse_params(req)?;

    let clash: Option<String> = conn
        .query_row("SELECT id FROM groups WHERE name = ?", [&input.name], |r| {
            r.get(0)
        })
        .optional()?;
    if clash.is_some() {
        return Err(HandlerErr::new(
            "validation_failed",
            "a group with this name already exists",
        ));
    }

    let director: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE id = ? AND role = 'teacher'",
            [&input.director_id],
            |r| r.get(0),
        )
        .optional()?;
    if director.is_none() {
        return Err(HandlerErr::new("not_found", "director not found"));
    }
    students_all_exist(conn, &input.student_ids)?;

    let group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO groups(id, name, grade_label, director_id, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            &group_id,
            &input.name,
            &input.grade_label,
            &input.director_id,
            now_rfc3339(),
        ),
    )?;
    replace_members(conn, &group_id, &input.student_ids)?;

    let row = fetch_group(conn, &group_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "group row missing after insert"))?;
    Ok(json!({ "group": group_json(conn, row)? }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupInput {
    group_id: String,
    name: Option<String>,
    grade_label: Option<String>,
    director_id: Option<String>,
    student_ids: Option<Vec<String>>,
    active: Option<bool>,
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GroupWrite, None)?;
    let conn = db_conn(state)?;
    let input: UpdateGroupInput = parse_params(req)?;

    let row = fetch_group(conn, &input.group_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "group not found"))?;
    let (_, name, grade_label, director_id, active) = row;

    if let Some(ref new_name) = input.name {
        let clash: Option<String> = conn
            .query_row(
                "SELECT id FROM groups WHERE name = ? AND id != ?",
                (new_name, &input.group_id),
                |r| r.get(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(HandlerErr::new(
                "validation_failed",
                "a group with this name already exists",
            ));
        }
    }
    if let Some(ref students) = input.student_ids {
        students_all_exist(conn, students)?;
    }

    conn.execute(
        "UPDATE groups SET name = ?, grade_label = ?, director_id = ?, active = ? WHERE id = ?",
        (
            input.name.as_deref().unwrap_or(&name),
            input.grade_label.as_deref().unwrap_or(&grade_label),
            input.director_id.as_deref().unwrap_or(&director_id),
            input.active.map(i64::from).unwrap_or(active),
            &input.group_id,
        ),
    )?;
    if let Some(ref students) = input.student_ids {
        replace_members(conn, &input.group_id, students)?;
    }

    let row = fetch_group(conn, &input.group_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "group row missing after update"))?;
    Ok(json!({ "group": group_json(conn, row)? }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GroupWrite, None)?;
    let group_id = required_str(req, "groupId")?;
    let conn = db_conn(state)?;
    conn.execute("DELETE FROM group_members WHERE group_id = ?", [&group_id])?;
    let deleted = conn.execute("DELETE FROM groups WHERE id = ?", [&group_id])?;
    if deleted == 0 {
        return Err(HandlerErr::new("not_found", "group not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "groups.list" => handle_list(state, req),
        "groups.get" => handle_get(state, req),
        "groups.create" => handle_create(state, req),
        "groups.update" => handle_update(state, req),
        "groups.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
