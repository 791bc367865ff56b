use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Action;
use crate::calc::SubjectType;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    authorize, db_conn, now_rfc3339, optional_str, parse_params, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

type SubjectRowTuple = (String, String, String, Option<String>, String, i64);

fn subject_json(row: SubjectRowTuple) -> serde_json::Value {
    let (id, name, subject_type, description, teacher_id, active) = row;
    json!({
        "id": id,
        "name": name,
        "type": subject_type,
        "description": description,
        "teacherId": teacher_id,
        "active": active != 0,
    })
}

fn fetch_subject(
    conn: &rusqlite::Connection,
    subject_id: &str,
) -> Result<Option<SubjectRowTuple>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, name, type, description, teacher_id, active
             FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()?)
}

fn teacher_exists(conn: &rusqlite::Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE id = ? AND role = 'teacher'",
            [teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::SubjectRead, None)?;
    let conn = db_conn(state)?;
    let type_filter = optional_str(req, "type");
    if let Some(ref t) = type_filter {
        SubjectType::parse(t)?;
    }

    let mut subjects = Vec::new();
    match type_filter {
        Some(t) => {
            let mut stmt = conn.prepare(
                "SELECT id, name, type, description, teacher_id, active
                 FROM subjects WHERE type = ? ORDER BY name",
            )?;
            let rows = stmt
                .query_map([t], |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
            subjects.extend(rows.into_iter().map(subject_json));
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, name, type, description, teacher_id, active
                 FROM subjects ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
            subjects.extend(rows.into_iter().map(subject_json));
        }
    }

    Ok(json!({ "subjects": subjects }))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::SubjectRead, None)?;
    let subject_id = required_str(req, "subjectId")?;
    let conn = db_conn(state)?;
    let row = fetch_subject(conn, &subject_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "subject not found"))?;
    Ok(json!({ "subject": subject_json(row) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubjectInput {
    name: String,
    #[serde(rename = "type")]
    subject_type: String,
    description: Option<String>,
    teacher_id: String,
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::SubjectWrite, None)?;
    let conn = db_conn(state)?;
    let input: CreateSubjectInput = parse_params(req)?;
    let subject_type = SubjectType::parse(&input.subject_type)?;
    if !teacher_exists(conn, &input.teacher_id)? {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, type, description, teacher_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &subject_id,
            &input.name,
            subject_type.as_str(),
            &input.description,
            &input.teacher_id,
            now_rfc3339(),
        ),
    )?;

    let row = fetch_subject(conn, &subject_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "subject row missing after insert"))?;
    Ok(json!({ "subject": subject_json(row) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSubjectInput {
    subject_id: String,
    name: Option<String>,
    #[serde(rename = "type")]
    subject_type: Option<String>,
    description: Option<String>,
    teacher_id: Option<String>,
    active: Option<bool>,
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::SubjectWrite, None)?;
    let conn = db_conn(state)?;
    let input: UpdateSubjectInput = parse_params(req)?;

    let row = fetch_subject(conn, &input.subject_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "subject not found"))?;
    let (_, name, subject_type, description, teacher_id, active) = row;

    if let Some(ref t) = input.subject_type {
        SubjectType::parse(t)?;
    }
    if let Some(ref t) = input.teacher_id {
        if !teacher_exists(conn, t)? {
            return Err(HandlerErr::new("not_found", "teacher not found"));
        }
    }

    conn.execute(
        "UPDATE subjects SET name = ?, type = ?, description = ?, teacher_id = ?, active = ?
         WHERE id = ?",
        (
            input.name.as_deref().unwrap_or(&name),
            input.subject_type.as_deref().unwrap_or(&subject_type),
            input.description.as_deref().or(description.as_deref()),
            input.teacher_id.as_deref().unwrap_or(&teacher_id),
            input.active.map(i64::from).unwrap_or(active),
            &input.subject_id,
        ),
    )?;

    let row = fetch_subject(conn, &input.subject_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "subject row missing after update"))?;
    Ok(json!({ "subject": subject_json(row) }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::SubjectWrite, None)?;
    let subject_id = required_str(req, "subjectId")?;
    let conn = db_conn(state)?;
    let deleted = conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])?;
    if deleted == 0 {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "subjects.list" => handle_list(state, req),
        "subjects.get" => handle_get(state, req),
        "subjects.create" => handle_create(state, req),
        "subjects.update" => handle_update(state, req),
        "subjects.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
