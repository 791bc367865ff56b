use serde_json::json;

use crate::auth::Action;
use crate::calc;
use crate::ipc::error::ok;
use crate::ipc::helpers::{authorize, db_conn, optional_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn parse_period(req: &Request) -> Result<calc::Period, HandlerErr> {
    let raw = required_str(req, "period")?;
    Ok(calc::parse_period(&raw)?)
}

fn handle_student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(req, "studentId")?;
    authorize(req, Action::ReportStudent, Some(&student_id))?;
    let period = parse_period(req)?;
    let conn = db_conn(state)?;
    let report =
        calc::compute_student_report(&calc::ReportContext { conn }, &student_id, &period)?;
    Ok(json!(report))
}

fn handle_group(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::ReportGroup, None)?;
    let group_id = required_str(req, "groupId")?;
    let period = parse_period(req)?;
    let conn = db_conn(state)?;
    let report = calc::compute_group_report(&calc::ReportContext { conn }, &group_id, &period)?;
    Ok(json!(report))
}

fn handle_subject(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::ReportSubject, None)?;
    let subject_id = required_str(req, "subjectId")?;
    let period = parse_period(req)?;
    let conn = db_conn(state)?;
    let report =
        calc::compute_subject_report(&calc::ReportContext { conn }, &subject_id, &period)?;
    Ok(json!(report))
}

fn handle_teacher_performance(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(req, "teacherId")?;
    authorize(req, Action::ReportTeacher, Some(&teacher_id))?;
    let period = parse_period(req)?;
    let conn = db_conn(state)?;
    let report =
        calc::compute_teacher_report(&calc::ReportContext { conn }, &teacher_id, &period)?;
    Ok(json!(report))
}

fn handle_remediations(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    authorize(req, Action::ReportRemediations, None)?;
    let period = optional_str(req, "period");
    let kind = match optional_str(req, "type") {
        Some(raw) => Some(calc::RemediationKind::parse(&raw)?),
        None => None,
    };
    let conn = db_conn(state)?;
    let summary = calc::compute_remediation_summary(
        &calc::ReportContext { conn },
        period.as_deref(),
        kind,
    )?;
    Ok(json!(summary))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.student" => handle_student(state, req),
        "reports.group" => handle_group(state, req),
        "reports.subject" => handle_subject(state, req),
        "reports.teacherPerformance" => handle_teacher_performance(state, req),
        "reports.remediations" => handle_remediations(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
