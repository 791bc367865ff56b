use rusqlite::{types::Value, Connection, OptionalExtension};
use rusqlite::params_from_iter;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Action;
use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    authorize, db_conn, now_rfc3339, optional_str, parse_params, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

struct StoredRemediation {
    id: String,
    student_id: String,
    subject_id: String,
    kind: String,
    period: String,
    grade_before: f64,
    remediation_grade: f64,
    approved: Option<bool>,
    observations: Option<String>,
}

fn remediation_json(r: &StoredRemediation) -> serde_json::Value {
    json!({
        "id": r.id,
        "studentId": r.student_id,
        "subjectId": r.subject_id,
        "type": r.kind,
        "period": r.period,
        "gradeBefore": r.grade_before,
        "remediationGrade": r.remediation_grade,
        "approved": r.approved,
        "observations": r.observations,
    })
}

fn fetch_remediation(
    conn: &Connection,
    remediation_id: &str,
) -> Result<Option<StoredRemediation>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, student_id, subject_id, type, period, grade_before,
                    remediation_grade, approved, observations
             FROM remediations WHERE id = ?",
            [remediation_id],
            |r| {
                let approved: Option<i64> = r.get(7)?;
                Ok(StoredRemediation {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    subject_id: r.get(2)?,
                    kind: r.get(3)?,
                    period: r.get(4)?,
                    grade_before: r.get(5)?,
                    remediation_grade: r.get(6)?,
                    approved: approved.map(|v| v != 0),
                    observations: r.get(8)?,
                })
            },
        )
        .optional()?)
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::RemediationRead, None)?;
    let conn = db_conn(state)?;
    let period = optional_str(req, "period");
    let kind = match optional_str(req, "type") {
        Some(raw) => Some(calc::RemediationKind::parse(&raw)?),
        None => None,
    };

    let mut sql = String::from(
        "SELECT r.id, r.student_id, r.subject_id, r.type, r.period, r.grade_before,
                r.remediation_grade, r.approved, r.observations, u.name, s.name, s.type
         FROM remediations r
         JOIN users u ON u.id = r.student_id
         JOIN subjects s ON s.id = r.subject_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(ref p) = period {
        clauses.push("r.period = ?");
        bind_values.push(Value::Text(p.clone()));
    }
    if let Some(k) = kind {
        clauses.push("r.type = ?");
        bind_values.push(Value::Text(k.as_str().to_string()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY r.period, s.name");

    let mut stmt = conn.prepare(&sql)?;
    let remediations: Vec<serde_json::Value> = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let approved: Option<i64> = r.get(7)?;
            let student_name: String = r.get(9)?;
            let subject_name: String = r.get(10)?;
            let subject_type: String = r.get(11)?;
            let stored = StoredRemediation {
                id: r.get(0)?,
                student_id: r.get(1)?,
                subject_id: r.get(2)?,
                kind: r.get(3)?,
                period: r.get(4)?,
                grade_before: r.get(5)?,
                remediation_grade: r.get(6)?,
                approved: approved.map(|v| v != 0),
                observations: r.get(8)?,
            };
            let mut j = remediation_json(&stored);
            j["studentName"] = json!(student_name);
            j["subjectName"] = json!(subject_name);
            j["subjectType"] = json!(subject_type);
            Ok(j)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({ "remediations": remediations }))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let remediation_id = required_str(req, "remediationId")?;
    let conn = db_conn(state)?;
    let stored = fetch_remediation(conn, &remediation_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "remediation not found"))?;
    authorize(req, Action::RemediationRead, Some(&stored.student_id))?;
    Ok(json!({ "remediation": remediation_json(&stored) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRemediationInput {
    student_id: String,
    subject_id: String,
    #[serde(rename = "type")]
    kind: String,
    period: String,
    grade_before: f64,
    remediation_grade: f64,
    approved: Option<bool>,
    observations: Option<String>,
}

/// Kind and scales are validated before the insert; `approved` is the
/// evaluator's explicit judgment and is stored as-is, never derived.
fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::RemediationWrite, None)?;
    let conn = db_conn(state)?;
    let input: CreateRemediationInput = parse_params(req)?;

    let kind = calc::RemediationKind::parse(&input.kind)?;
    calc::validate_scale("gradeBefore", input.grade_before)?;
    calc::validate_scale("remediationGrade", input.remediation_grade)?;
    calc::parse_period(&input.period)?;

    let subject: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE id = ?",
            [&input.subject_id],
            |r| r.get(0),
        )
        .optional()?;
    if subject.is_none() {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }
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

    let remediation_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO remediations(id, student_id, subject_id, type, period,
                grade_before, remediation_grade, approved, observations, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &remediation_id,
            &input.student_id,
            &input.subject_id,
            kind.as_str(),
            &input.period,
            input.grade_before,
            input.remediation_grade,
            input.approved.map(i64::from),
            &input.observations,
            now_rfc3339(),
        ),
    )?;

    let stored = fetch_remediation(conn, &remediation_id)?.ok_or_else(|| {
        HandlerErr::new("db_query_failed", "remediation row missing after insert")
    })?;
    Ok(json!({ "remediation": remediation_json(&stored) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRemediationInput {
    remediation_id: String,
    grade_before: Option<f64>,
    remediation_grade: Option<f64>,
    approved: Option<bool>,
    observations: Option<String>,
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::RemediationWrite, None)?;
    let conn = db_conn(state)?;
    let input: UpdateRemediationInput = parse_params(req)?;

    if let Some(g) = input.grade_before {
        calc::validate_scale("gradeBefore", g)?;
    }
    if let Some(g) = input.remediation_grade {
        calc::validate_scale("remediationGrade", g)?;
    }

    let stored = fetch_remediation(conn, &input.remediation_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "remediation not found"))?;

    conn.execute(
        "UPDATE remediations SET grade_before = ?, remediation_grade = ?,
                approved = ?, observations = ?
         WHERE id = ?",
        (
            input.grade_before.unwrap_or(stored.grade_before),
            input.remediation_grade.unwrap_or(stored.remediation_grade),
            input.approved.or(stored.approved).map(i64::from),
            input.observations.as_deref().or(stored.observations.as_deref()),
            &input.remediation_id,
        ),
    )?;

    let stored = fetch_remediation(conn, &input.remediation_id)?.ok_or_else(|| {
        HandlerErr::new("db_query_failed", "remediation row missing after update")
    })?;
    Ok(json!({ "remediation": remediation_json(&stored) }))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::RemediationDelete, None)?;
    let remediation_id = required_str(req, "remediationId")?;
    let conn = db_conn(state)?;
    let deleted = conn.execute("DELETE FROM remediations WHERE id = ?", [&remediation_id])?;
    if deleted == 0 {
        return Err(HandlerErr::new("not_found", "remediation not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "remediations.list" => handle_list(state, req),
        "remediations.get" => handle_get(state, req),
        "remediations.create" => handle_create(state, req),
        "remediations.update" => handle_update(state, req),
        "remediations.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
