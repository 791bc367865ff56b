use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Action;
use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    authorize, db_conn, now_rfc3339, parse_params, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn list_performances(
    conn: &Connection,
    column: &str,
    key: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT p.id, p.student_id, p.subject_id, p.semester, p.level,
                p.description, p.recommendations, s.name, s.type
         FROM performances p
         JOIN subjects s ON s.id = p.subject_id
         WHERE p.{} = ?
         ORDER BY p.semester",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([key], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let subject_id: String = r.get(2)?;
            let semester: i64 = r.get(3)?;
            let level: String = r.get(4)?;
            let description: Option<String> = r.get(5)?;
            let recommendations: Option<String> = r.get(6)?;
            let subject_name: String = r.get(7)?;
            let subject_type: String = r.get(8)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "subjectId": subject_id,
                "semester": semester,
                "level": level,
                "description": description,
                "recommendations": recommendations,
                "subjectName": subject_name,
                "subjectType": subject_type,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn handle_list_by_student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(req, "studentId")?;
    authorize(req, Action::PerformanceRead, Some(&student_id))?;
    let conn = db_conn(state)?;
    Ok(json!({ "performances": list_performances(conn, "student_id", &student_id)? }))
}

fn handle_list_by_subject(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::PerformanceRead, None)?;
    let subject_id = required_str(req, "subjectId")?;
    let conn = db_conn(state)?;
    Ok(json!({ "performances": list_performances(conn, "subject_id", &subject_id)? }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePerformanceInput {
    student_id: String,
    subject_id: String,
    semester: i64,
    level: String,
    description: Option<String>,
    recommendations: Option<String>,
}

/// The evaluation is the teacher's own judgment and is stored as given.
/// When a grade already exists for the same (student, subject, semester)
/// the response also carries the level the shared classifier would
/// assign, so the host UI can flag a mismatch.
fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::PerformanceWrite, None)?;
    let conn = db_conn(state)?;
    let input: CreatePerformanceInput = parse_params(req)?;

    if !(1..=2).contains(&input.semester) {
        return Err(HandlerErr::new("validation_failed", "semester must be 1 or 2"));
    }
    let level = calc::PerformanceLevel::parse(&input.level)?;

    let type_raw: Option<String> = conn
        .query_row(
            "SELECT type FROM subjects WHERE id = ?",
            [&input.subject_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(type_raw) = type_raw else {
        return Err(HandlerErr::new("not_found", "subject not found"));
    };
    let subject_type = calc::SubjectType::parse(&type_raw)?;

    let performance_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO performances(id, student_id, subject_id, semester, level,
                description, recommendations, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &performance_id,
            &input.student_id,
            &input.subject_id,
            input.semester,
            level.as_str(),
            &input.description,
            &input.recommendations,
            now_rfc3339(),
        ),
    )?;

    let final_grade: Option<f64> = conn
        .query_row(
            "SELECT final_grade FROM grades
             WHERE student_id = ? AND subject_id = ? AND semester = ?",
            (&input.student_id, &input.subject_id, input.semester),
            |r| r.get(0),
        )
        .optional()?;
    let suggested_level =
        final_grade.map(|g| calc::classify_level(g, subject_type).as_str());

    Ok(json!({
        "performance": {
            "id": performance_id,
            "studentId": input.student_id,
            "subjectId": input.subject_id,
            "semester": input.semester,
            "level": level.as_str(),
            "description": input.description,
            "recommendations": input.recommendations,
        },
        "suggestedLevel": suggested_level,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "performances.listByStudent" => handle_list_by_student(state, req),
        "performances.listBySubject" => handle_list_by_subject(state, req),
        "performances.create" => handle_create(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
