use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const GRADE_MIN: f64 = 1.0;
pub const GRADE_MAX: f64 = 5.0;

const CUT_WEIGHT: f64 = 0.4;
const FINAL_EXAM_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Decimal round-half-up to 2 places: `Int(100*x + 0.5) / 100`.
pub fn round_half_up_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Core,
    Modality,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::Core => "core",
            SubjectType::Modality => "modality",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CalcError> {
        match raw {
            "core" => Ok(SubjectType::Core),
            "modality" => Ok(SubjectType::Modality),
            other => Err(CalcError::new(
                "validation_failed",
                "subject type must be one of: core, modality",
            )
            .with_details(serde_json::json!({ "type": other }))),
        }
    }

    pub fn pass_threshold(self) -> f64 {
        match self {
            SubjectType::Core => 3.0,
            SubjectType::Modality => 3.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    Low,
    Basic,
    High,
    Superior,
}

impl PerformanceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceLevel::Low => "low",
            PerformanceLevel::Basic => "basic",
            PerformanceLevel::High => "high",
            PerformanceLevel::Superior => "superior",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CalcError> {
        match raw {
            "low" => Ok(PerformanceLevel::Low),
            "basic" => Ok(PerformanceLevel::Basic),
            "high" => Ok(PerformanceLevel::High),
            "superior" => Ok(PerformanceLevel::Superior),
            other => Err(CalcError::new(
                "validation_failed",
                "level must be one of: low, basic, high, superior",
            )
            .with_details(serde_json::json!({ "level": other }))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationKind {
    Leveling,
    SemesterRecovery,
    FinalRecovery,
}

impl RemediationKind {
    /// Wire values kept from the records this daemon manages.
    pub fn as_str(self) -> &'static str {
        match self {
            RemediationKind::Leveling => "nivelacion",
            RemediationKind::SemesterRecovery => "recuperacion_semestral",
            RemediationKind::FinalRecovery => "recuperacion_final",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CalcError> {
        match raw {
            "nivelacion" => Ok(RemediationKind::Leveling),
            "recuperacion_semestral" => Ok(RemediationKind::SemesterRecovery),
            "recuperacion_final" => Ok(RemediationKind::FinalRecovery),
            other => Err(CalcError::new(
                "validation_failed",
                "remediation type must be one of: nivelacion, recuperacion_semestral, recuperacion_final",
            )
            .with_details(serde_json::json!({ "type": other }))),
        }
    }
}

pub fn validate_scale(field: &str, value: f64) -> Result<(), CalcError> {
    if !value.is_finite() || value < GRADE_MIN || value > GRADE_MAX {
        return Err(CalcError::new(
            "validation_failed",
            "scores must be between 1.0 and 5.0",
        )
        .with_details(serde_json::json!({ "field": field, "value": value })));
    }
    Ok(())
}

/// Weighted final grade: 40% cut1 + 40% cut2 + 20% final exam, rounded
/// half-up to 2 decimals. Components are validated before any arithmetic
/// so a bad score never reaches the store.
pub fn compute_final_grade(cut1: f64, cut2: f64, final_exam: f64) -> Result<f64, CalcError> {
    validate_scale("cut1", cut1)?;
    validate_scale("cut2", cut2)?;
    validate_scale("finalExam", final_exam)?;
    Ok(round_half_up_2(
        cut1 * CUT_WEIGHT + cut2 * CUT_WEIGHT + final_exam * FINAL_EXAM_WEIGHT,
    ))
}

pub fn is_approved(final_grade: f64, subject_type: SubjectType) -> bool {
    final_grade >= subject_type.pass_threshold()
}

/// Four-tier ladder, highest threshold first. Core and modality differ
/// only at the basic boundary (3.0 vs 3.5).
pub fn classify_level(final_grade: f64, subject_type: SubjectType) -> PerformanceLevel {
    if final_grade >= 4.5 {
        PerformanceLevel::Superior
    } else if final_grade >= 4.0 {
        PerformanceLevel::High
    } else if final_grade >= subject_type.pass_threshold() {
        PerformanceLevel::Basic
    } else {
        PerformanceLevel::Low
    }
}

pub fn mean_2dp(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round_half_up_2(
        values.iter().sum::<f64>() / values.len() as f64,
    ))
}

#[derive(Debug, Clone)]
pub struct Period {
    pub label: String,
    pub semester: i64,
}

/// Period labels look like "2025-1"; the trailing component is the
/// semester. A bare "1"/"2" is accepted as a semester-only label.
pub fn parse_period(raw: &str) -> Result<Period, CalcError> {
    let label = raw.trim();
    let semester_part = label.rsplit('-').next().unwrap_or("");
    let semester: i64 = semester_part.parse().map_err(|_| {
        CalcError::new(
            "validation_failed",
            "period must be a semester label such as '2025-1'",
        )
        .with_details(serde_json::json!({ "period": label }))
    })?;
    if !(1..=2).contains(&semester) {
        return Err(CalcError::new(
            "validation_failed",
            "period semester must be 1 or 2",
        )
        .with_details(serde_json::json!({ "period": label })));
    }
    Ok(Period {
        label: label.to_string(),
        semester,
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LevelCounts {
    pub low: i64,
    pub basic: i64,
    pub high: i64,
    pub superior: i64,
}

impl LevelCounts {
    pub fn bump(&mut self, level: PerformanceLevel) {
        match level {
            PerformanceLevel::Low => self.low += 1,
            PerformanceLevel::Basic => self.basic += 1,
            PerformanceLevel::High => self.high += 1,
            PerformanceLevel::Superior => self.superior += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDistribution {
    pub subject_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
    pub total: i64,
    pub approved: i64,
    pub failed: i64,
    pub levels: LevelCounts,
}

impl SubjectDistribution {
    pub fn new(subject_id: String, name: String, subject_type: SubjectType) -> Self {
        Self {
            subject_id,
            name,
            subject_type,
            total: 0,
            approved: 0,
            failed: 0,
            levels: LevelCounts::default(),
        }
    }

    pub fn observe(&mut self, final_grade: f64) {
        self.total += 1;
        if is_approved(final_grade, self.subject_type) {
            self.approved += 1;
        } else {
            self.failed += 1;
        }
        self.levels
            .bump(classify_level(final_grade, self.subject_type));
    }
}

pub struct ReportContext<'a> {
    pub conn: &'a Connection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_type: SubjectType,
    pub semester: i64,
    pub cut1: f64,
    pub cut2: f64,
    pub final_exam: f64,
    pub final_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_grade: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_type: SubjectType,
    pub semester: i64,
    pub level: PerformanceLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_type: SubjectType,
    #[serde(rename = "type")]
    pub kind: String,
    pub period: String,
    pub grade_before: f64,
    pub remediation_grade: f64,
    pub approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student_id: String,
    pub period: String,
    pub average: Option<f64>,
    pub grades: Vec<GradeRow>,
    pub performances: Vec<PerformanceRow>,
    pub remediations: Vec<RemediationRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHeader {
    pub id: String,
    pub name: String,
    pub grade_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub group: GroupHeader,
    pub period: String,
    pub group_average: Option<f64>,
    pub student_averages: BTreeMap<String, Option<f64>>,
    pub subjects: Vec<SubjectDistribution>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectHeader {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectReport {
    pub subject: SubjectHeader,
    pub period: String,
    pub average: Option<f64>,
    pub total: i64,
    pub approved: i64,
    pub failed: i64,
    pub levels: LevelCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSubjectReport {
    pub subject_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
    pub average: Option<f64>,
    pub total: i64,
    pub approved: i64,
    pub failed: i64,
    pub levels: LevelCounts,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherReport {
    pub teacher_id: String,
    pub period: String,
    pub director_groups: Vec<GroupHeader>,
    pub subjects: Vec<TeacherSubjectReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationSummary {
    pub total: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_subject: BTreeMap<String, i64>,
    pub by_group: BTreeMap<String, i64>,
}

fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, CalcError> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    Ok(found.is_some())
}

/// One batch fetch of every group membership, indexed by student. Report
/// code consults the map per grade instead of issuing a lookup per row.
fn student_groups_index(
    conn: &Connection,
) -> Result<HashMap<String, Vec<(String, String)>>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT gm.student_id, gm.group_id, g.name
             FROM group_members gm
             JOIN groups g ON g.id = gm.group_id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let student_id: String = r.get(0)?;
            let group_id: String = r.get(1)?;
            let group_name: String = r.get(2)?;
            Ok((student_id, group_id, group_name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut index: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for (student_id, group_id, group_name) in rows {
        index
            .entry(student_id)
            .or_default()
            .push((group_id, group_name));
    }
    Ok(index)
}

pub fn compute_student_report(
    ctx: &ReportContext<'_>,
    student_id: &str,
    period: &Period,
) -> Result<StudentReport, CalcError> {
    let conn = ctx.conn;
    if !user_exists(conn, student_id)? {
        return Err(CalcError::new("not_found", "student not found"));
    }

    let mut grades_stmt = conn
        .prepare(
            "SELECT g.id, g.subject_id, s.name, s.type, g.semester, g.cut1, g.cut2,
                    g.final_exam, g.final_grade, g.recovery_grade, g.status
             FROM grades g
             JOIN subjects s ON s.id = g.subject_id
             WHERE g.student_id = ? AND g.semester = ?
             ORDER BY s.name",
        )
        .map_err(db_err)?;
    let grade_rows: Vec<(GradeRow, String)> = grades_stmt
        .query_map((student_id, period.semester), |r| {
            let type_raw: String = r.get(3)?;
            Ok((
                GradeRow {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    subject_type: SubjectType::Core,
                    semester: r.get(4)?,
                    cut1: r.get(5)?,
                    cut2: r.get(6)?,
                    final_exam: r.get(7)?,
                    final_grade: r.get(8)?,
                    recovery_grade: r.get(9)?,
                    status: r.get(10)?,
                },
                type_raw,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    let grades: Vec<GradeRow> = grade_rows
        .into_iter()
        .map(|(mut row, type_raw)| {
            SubjectType::parse(&type_raw).map(|t| {
                row.subject_type = t;
                row
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut perf_stmt = conn
        .prepare(
            "SELECT p.id, p.subject_id, s.name, s.type, p.semester, p.level,
                    p.description, p.recommendations
             FROM performances p
             JOIN subjects s ON s.id = p.subject_id
             WHERE p.student_id = ? AND p.semester = ?
             ORDER BY s.name",
        )
        .map_err(db_err)?;
    let perf_rows: Vec<(String, String, String, String, i64, String, Option<String>, Option<String>)> =
        perf_stmt
            .query_map((student_id, period.semester), |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
    let performances: Vec<PerformanceRow> = perf_rows
        .into_iter()
        .map(
            |(id, subject_id, subject_name, type_raw, semester, level_raw, description, recommendations)| {
                Ok(PerformanceRow {
                    id,
                    subject_id,
                    subject_name,
                    subject_type: SubjectType::parse(&type_raw)?,
                    semester,
                    level: PerformanceLevel::parse(&level_raw)?,
                    description,
                    recommendations,
                })
            },
        )
        .collect::<Result<Vec<_>, CalcError>>()?;

    let mut rem_stmt = conn
        .prepare(
            "SELECT r.id, r.subject_id, s.name, s.type, r.type, r.period,
                    r.grade_before, r.remediation_grade, r.approved, r.observations
             FROM remediations r
             JOIN subjects s ON s.id = r.subject_id
             WHERE r.student_id = ? AND r.period = ?
             ORDER BY s.name",
        )
        .map_err(db_err)?;
    let rem_rows: Vec<(RemediationRow, String)> = rem_stmt
        .query_map((student_id, period.label.as_str()), |r| {
            let type_raw: String = r.get(3)?;
            let approved: Option<i64> = r.get(8)?;
            Ok((
                RemediationRow {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    subject_type: SubjectType::Core,
                    kind: r.get(4)?,
                    period: r.get(5)?,
                    grade_before: r.get(6)?,
                    remediation_grade: r.get(7)?,
                    approved: approved.map(|v| v != 0),
                    observations: r.get(9)?,
                },
                type_raw,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    let remediations: Vec<RemediationRow> = rem_rows
        .into_iter()
        .map(|(mut row, type_raw)| {
            SubjectType::parse(&type_raw).map(|t| {
                row.subject_type = t;
                row
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let finals: Vec<f64> = grades.iter().map(|g| g.final_grade).collect();
    Ok(StudentReport {
        student_id: student_id.to_string(),
        period: period.label.clone(),
        average: mean_2dp(&finals),
        grades,
        performances,
        remediations,
    })
}

struct PeriodGrade {
    student_id: String,
    subject_id: String,
    subject_name: String,
    subject_type: SubjectType,
    final_grade: f64,
}

fn fetch_grades_for_students(
    conn: &Connection,
    student_ids: &[String],
    semester: i64,
) -> Result<Vec<PeriodGrade>, CalcError> {
    if student_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT g.student_id, g.subject_id, s.name, s.type, g.final_grade
         FROM grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.semester = ? AND g.student_id IN ({})",
        placeholders
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(student_ids.len() + 1);
    bind_values.push(Value::Integer(semester));
    for id in student_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows: Vec<(String, String, String, String, f64)> = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    rows.into_iter()
        .map(|(student_id, subject_id, subject_name, type_raw, final_grade)| {
            Ok(PeriodGrade {
                student_id,
                subject_id,
                subject_name,
                subject_type: SubjectType::parse(&type_raw)?,
                final_grade,
            })
        })
        .collect()
}

pub fn compute_group_report(
    ctx: &ReportContext<'_>,
    group_id: &str,
    period: &Period,
) -> Result<GroupReport, CalcError> {
    let conn = ctx.conn;

    let header: Option<GroupHeader> = conn
        .query_row(
            "SELECT id, name, grade_label FROM groups WHERE id = ?",
            [group_id],
            |r| {
                Ok(GroupHeader {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    grade_label: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some(header) = header else {
        return Err(CalcError::new("not_found", "group not found"));
    };

    let mut members_stmt = conn
        .prepare("SELECT student_id FROM group_members WHERE group_id = ?")
        .map_err(db_err)?;
    let member_ids: Vec<String> = members_stmt
        .query_map([group_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let grades = fetch_grades_for_students(conn, &member_ids, period.semester)?;

    // Members with no qualifying grades keep a null average and stay out
    // of the group-average denominator.
    let mut per_student: HashMap<&str, (f64, i64)> = HashMap::new();
    for g in &grades {
        let entry = per_student.entry(g.student_id.as_str()).or_insert((0.0, 0));
        entry.0 += g.final_grade;
        entry.1 += 1;
    }

    let mut student_averages: BTreeMap<String, Option<f64>> = BTreeMap::new();
    let mut group_sum = 0.0_f64;
    let mut group_count = 0_i64;
    for id in &member_ids {
        match per_student.get(id.as_str()) {
            Some((sum, count)) if *count > 0 => {
                let avg = sum / *count as f64;
                student_averages.insert(id.clone(), Some(round_half_up_2(avg)));
                group_sum += avg;
                group_count += 1;
            }
            _ => {
                student_averages.insert(id.clone(), None);
            }
        }
    }
    let group_average = if group_count > 0 {
        Some(round_half_up_2(group_sum / group_count as f64))
    } else {
        None
    };

    let mut distributions: BTreeMap<String, SubjectDistribution> = BTreeMap::new();
    for g in &grades {
        let entry = distributions.entry(g.subject_id.clone()).or_insert_with(|| {
            SubjectDistribution::new(g.subject_id.clone(), g.subject_name.clone(), g.subject_type)
        });
        entry.observe(g.final_grade);
    }

    Ok(GroupReport {
        group: header,
        period: period.label.clone(),
        group_average,
        student_averages,
        subjects: distributions.into_values().collect(),
    })
}

pub fn compute_subject_report(
    ctx: &ReportContext<'_>,
    subject_id: &str,
    period: &Period,
) -> Result<SubjectReport, CalcError> {
    let conn = ctx.conn;

    let mut stmt = conn
        .prepare(
            "SELECT s.name, s.type, g.final_grade
             FROM grades g
             JOIN subjects s ON s.id = g.subject_id
             WHERE g.subject_id = ? AND g.semester = ?",
        )
        .map_err(db_err)?;
    let rows: Vec<(String, String, f64)> = stmt
        .query_map((subject_id, period.semester), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    // Zero grades is a reportable condition here, unlike the student and
    // group reports which tolerate emptiness.
    let Some((subject_name, type_raw, _)) = rows.first() else {
        return Err(CalcError::new(
            "not_found",
            "no grade records for this subject in the period",
        ));
    };
    let subject_type = SubjectType::parse(type_raw)?;

    let mut dist =
        SubjectDistribution::new(subject_id.to_string(), subject_name.clone(), subject_type);
    let mut finals = Vec::with_capacity(rows.len());
    for (_, _, final_grade) in &rows {
        dist.observe(*final_grade);
        finals.push(*final_grade);
    }

    Ok(SubjectReport {
        subject: SubjectHeader {
            id: subject_id.to_string(),
            name: dist.name,
            subject_type,
        },
        period: period.label.clone(),
        average: mean_2dp(&finals),
        total: dist.total,
        approved: dist.approved,
        failed: dist.failed,
        levels: dist.levels,
    })
}

pub fn compute_teacher_report(
    ctx: &ReportContext<'_>,
    teacher_id: &str,
    period: &Period,
) -> Result<TeacherReport, CalcError> {
    let conn = ctx.conn;
    if !user_exists(conn, teacher_id)? {
        return Err(CalcError::new("not_found", "teacher not found"));
    }

    let mut groups_stmt = conn
        .prepare("SELECT id, name, grade_label FROM groups WHERE director_id = ? ORDER BY name")
        .map_err(db_err)?;
    let director_groups: Vec<GroupHeader> = groups_stmt
        .query_map([teacher_id], |r| {
            Ok(GroupHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_label: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut subjects_stmt = conn
        .prepare("SELECT id, name, type FROM subjects WHERE teacher_id = ? ORDER BY name")
        .map_err(db_err)?;
    let taught: Vec<(String, String, String)> = subjects_stmt
        .query_map([teacher_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let membership = student_groups_index(conn)?;

    let mut subjects = Vec::with_capacity(taught.len());
    for (subject_id, name, type_raw) in taught {
        let subject_type = SubjectType::parse(&type_raw)?;

        let mut grades_stmt = conn
            .prepare(
                "SELECT student_id, final_grade FROM grades
                 WHERE subject_id = ? AND semester = ?",
            )
            .map_err(db_err)?;
        let grades: Vec<(String, f64)> = grades_stmt
            .query_map((subject_id.as_str(), period.semester), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;

        let mut dist = SubjectDistribution::new(subject_id.clone(), name.clone(), subject_type);
        let mut finals = Vec::with_capacity(grades.len());
        let mut group_ids: BTreeSet<String> = BTreeSet::new();
        for (student_id, final_grade) in &grades {
            dist.observe(*final_grade);
            finals.push(*final_grade);
            if let Some(memberships) = membership.get(student_id.as_str()) {
                for (group_id, _) in memberships {
                    group_ids.insert(group_id.clone());
                }
            }
        }

        subjects.push(TeacherSubjectReport {
            subject_id,
            name,
            subject_type,
            average: mean_2dp(&finals),
            total: dist.total,
            approved: dist.approved,
            failed: dist.failed,
            levels: dist.levels,
            group_ids: group_ids.into_iter().collect(),
        });
    }

    Ok(TeacherReport {
        teacher_id: teacher_id.to_string(),
        period: period.label.clone(),
        director_groups,
        subjects,
    })
}

pub fn compute_remediation_summary(
    ctx: &ReportContext<'_>,
    period: Option<&str>,
    kind: Option<RemediationKind>,
) -> Result<RemediationSummary, CalcError> {
    let conn = ctx.conn;

    let mut sql = String::from(
        "SELECT r.type, r.student_id, s.name
         FROM remediations r
         JOIN subjects s ON s.id = r.subject_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(p) = period {
        clauses.push("r.period = ?");
        bind_values.push(Value::Text(p.to_string()));
    }
    if let Some(k) = kind {
        clauses.push("r.type = ?");
        bind_values.push(Value::Text(k.as_str().to_string()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let membership = student_groups_index(conn)?;

    let mut by_type: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_subject: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_group: BTreeMap<String, i64> = BTreeMap::new();
    for (kind_raw, student_id, subject_name) in &rows {
        *by_type.entry(kind_raw.clone()).or_insert(0) += 1;
        *by_subject.entry(subject_name.clone()).or_insert(0) += 1;
        if let Some(memberships) = membership.get(student_id.as_str()) {
            for (_, group_name) in memberships {
                *by_group.entry(group_name.clone()).or_insert(0) += 1;
            }
        }
    }

    Ok(RemediationSummary {
        total: rows.len() as i64,
        by_type,
        by_subject,
        by_group,
    })
}
