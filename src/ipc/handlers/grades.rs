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

struct StoredGrade {
    id: String,
    student_id: String,
    subject_id: String,
    semester: i64,
    cut1: f64,
    cut2: f64,
    final_exam: f64,
    final_grade: f64,
    recovery_grade: Option<f64>,
    justified_absences: i64,
    unjustified_absences: i64,
    observations: Option<String>,
    status: String,
}

fn grade_json(g: &StoredGrade) -> serde_json::Value {
    json!({
        "id": g.id,
        "studentId": g.student_id,
        "subjectId": g.subject_id,
        "semester": g.semester,
        "cut1": g.cut1,
        "cut2": g.cut2,
        "finalExam": g.final_exam,
        "finalGrade": g.final_grade,
        "recoveryGrade": g.recovery_grade,
        "justifiedAbsences": g.justified_absences,
        "unjustifiedAbsences": g.unjustified_absences,
        "observations": g.observations,
        "status": g.status,
    })
}

fn fetch_grade(conn: &Connection, grade_id: &str) -> Result<Option<StoredGrade>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, student_id, subject_id, semester, cut1, cut2, final_exam,
                    final_grade, recovery_grade, justified_absences,
                    unjustified_absences, observations, status
             FROM grades WHERE id = ?",
            [grade_id],
            |r| {
                Ok(StoredGrade {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    subject_id: r.get(2)?,
                    semester: r.get(3)?,
                    cut1: r.get(4)?,
                    cut2: r.get(5)?,
                    final_exam: r.get(6)?,
                    final_grade: r.get(7)?,
                    recovery_grade: r.get(8)?,
                    justified_absences: r.get(9)?,
                    unjustified_absences: r.get(10)?,
                    observations: r.get(11)?,
                    status: r.get(12)?,
                })
            },
        )
        .optional()?)
}

fn subject_type_of(
    conn: &Connection,
    subject_id: &str,
) -> Result<calc::SubjectType, HandlerErr> {
    let type_raw: Option<String> = conn
        .query_row(
            "SELECT type FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(type_raw) = type_raw else {
        return Err(HandlerErr::new("not_found", "subject not found"));
    };
    Ok(calc::SubjectType::parse(&type_raw)?)
}

fn list_grades(
    conn: &Connection,
    column: &str,
    key: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT g.id, g.student_id, g.subject_id, g.semester, g.cut1, g.cut2,
                g.final_exam, g.final_grade, g.recovery_grade,
                g.justified_absences, g.unjustified_absences, g.observations,
                g.status, s.name, s.type
         FROM grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.{} = ?
         ORDER BY g.semester",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([key], |r| {
            let subject_name: String = r.get(13)?;
            let subject_type: String = r.get(14)?;
            Ok((
                StoredGrade {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    subject_id: r.get(2)?,
                    semester: r.get(3)?,
                    cut1: r.get(4)?,
                    cut2: r.get(5)?,
                    final_exam: r.get(6)?,
                    final_grade: r.get(7)?,
                    recovery_grade: r.get(8)?,
                    justified_absences: r.get(9)?,
                    unjustified_absences: r.get(10)?,
                    observations: r.get(11)?,
                    status: r.get(12)?,
                },
                subject_name,
                subject_type,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(rows
        .into_iter()
        .map(|(g, subject_name, subject_type)| {
            let mut j = grade_json(&g);
            j["subjectName"] = json!(subject_name);
            j["subjectType"] = json!(subject_type);
            j
        })
        .collect())
}

fn handle_list_by_student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(req, "studentId")?;
    authorize(req, Action::GradeRead, Some(&student_id))?;
    let conn = db_conn(state)?;
    Ok(json!({ "grades": list_grades(conn, "student_id", &student_id)? }))
}

fn handle_list_by_subject(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GradeRead, None)?;
    let subject_id = required_str(req, "subjectId")?;
    let conn = db_conn(state)?;
    Ok(json!({ "grades": list_grades(conn, "subject_id", &subject_id)? }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertGradeInput {
    student_id: String,
    subject_id: String,
    semester: i64,
    cut1: f64,
    cut2: f64,
    final_exam: f64,
    #[serde(default)]
    justified_absences: i64,
    #[serde(default)]
    unjustified_absences: i64,
    observations: Option<String>,
}

/// Create-or-update keyed on (student, subject, semester). The final
/// grade is recomputed from the submitted components on every call;
/// validation happens before the row is touched so a rejected submission
/// never applies partially.
fn handle_upsert(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GradeWrite, None)?;
    let conn = db_conn(state)?;
    let input: UpsertGradeInput = parse_params(req)?;

    if !(1..=2).contains(&input.semester) {
        return Err(HandlerErr::new("validation_failed", "semester must be 1 or 2"));
    }
    if input.justified_absences < 0 || input.unjustified_absences < 0 {
        return Err(HandlerErr::new(
            "validation_failed",
            "absence counts must not be negative",
        ));
    }
    let final_grade = calc::compute_final_grade(input.cut1, input.cut2, input.final_exam)?;

    let subject_type = subject_type_of(conn, &input.subject_id)?;
    let student: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE id = ? AND role = 'student'",
            [&input.student_id],
            |r| r.get(0),
        )
        .optional()?;
    if student.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let approved = calc::is_approved(final_grade, subject_type);
    let status = if approved { "approved" } else { "failed" };
    let now = now_rfc3339();

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades WHERE student_id = ? AND subject_id = ? AND semester = ?",
            (&input.student_id, &input.subject_id, input.semester),
            |r| r.get(0),
        )
        .optional()?;

    let grade_id = match existing {
        Some(grade_id) => {
            conn.execute(
                "UPDATE grades SET cut1 = ?, cut2 = ?, final_exam = ?, final_grade = ?,
                        justified_absences = ?, unjustified_absences = ?,
                        observations = ?, status = ?, updated_at = ?
                 WHERE id = ?",
                (
                    input.cut1,
                    input.cut2,
                    input.final_exam,
                    final_grade,
                    input.justified_absences,
                    input.unjustified_absences,
                    &input.observations,
                    status,
                    &now,
                    &grade_id,
                ),
            )?;
            grade_id
        }
        None => {
            let grade_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO grades(id, student_id, subject_id, semester, cut1, cut2,
                        final_exam, final_grade, justified_absences,
                        unjustified_absences, observations, status,
                        created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &grade_id,
                    &input.student_id,
                    &input.subject_id,
                    input.semester,
                    input.cut1,
                    input.cut2,
                    input.final_exam,
                    final_grade,
                    input.justified_absences,
                    input.unjustified_absences,
                    &input.observations,
                    status,
                    &now,
                    &now,
                ),
            )?;
            grade_id
        }
    };

    let stored = fetch_grade(conn, &grade_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "grade row missing after upsert"))?;
    let mut payload = grade_json(&stored);
    payload["approved"] = json!(approved);
    Ok(json!({ "grade": payload }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetRecoveryInput {
    grade_id: String,
    recovery_grade: f64,
}

fn handle_set_recovery(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::GradeWrite, None)?;
    let conn = db_conn(state)?;
    let input: SetRecoveryInput = parse_params(req)?;
    calc::validate_scale("recoveryGrade", input.recovery_grade)?;

    let updated = conn.execute(
        "UPDATE grades SET recovery_grade = ?, updated_at = ? WHERE id = ?",
        (input.recovery_grade, now_rfc3339(), &input.grade_id),
    )?;
    if updated == 0 {
        return Err(HandlerErr::new("not_found", "grade not found"));
    }

    let stored = fetch_grade(conn, &input.grade_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "grade row missing after update"))?;
    Ok(json!({ "grade": grade_json(&stored) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.listByStudent" => handle_list_by_student(state, req),
        "grades.listBySubject" => handle_list_by_subject(state, req),
        "grades.upsert" => handle_upsert(state, req),
        "grades.setRecovery" => handle_set_recovery(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
