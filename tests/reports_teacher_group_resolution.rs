use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_notasd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn notasd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "actor": actor,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, actor, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn admin() -> serde_json::Value {
    json!({ "id": "admin-0", "role": "admin" })
}

#[test]
fn teacher_report_resolves_groups_from_graded_students() {
    let workspace = temp_dir("notasd-report-teacher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!(null),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        admin(),
        json!({ "name": "Diana Prado", "email": "diana@school.test", "role": "teacher" }),
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();
    let other_teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        admin(),
        json!({ "name": "Mario Lenis", "email": "mario@school.test", "role": "teacher" }),
    );
    let other_teacher_id = other_teacher["user"]["id"]
        .as_str()
        .expect("teacher id")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, email) in ["ana@school.test", "luis@school.test", "eva@school.test"]
        .iter()
        .enumerate()
    {
        let user = request_ok(
            &mut stdin,
            &mut reader,
            &format!("u{}", i),
            "users.create",
            admin(),
            json!({ "name": format!("Student {}", i), "email": email, "role": "student" }),
        );
        student_ids.push(user["user"]["id"].as_str().expect("user id").to_string());
    }
    let (s1, s2, s3) = (
        student_ids[0].clone(),
        student_ids[1].clone(),
        student_ids[2].clone(),
    );

    // Diana directs 10-A; 10-B belongs to another teacher. s1 and s2 sit
    // in 10-A, s3 in 10-B.
    let group_a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "groups.create",
        admin(),
        json!({
            "name": "10-A",
            "gradeLabel": "10",
            "directorId": teacher_id,
            "studentIds": [s1, s2],
        }),
    );
    let group_a_id = group_a["group"]["id"].as_str().expect("group id").to_string();
    let group_b = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "groups.create",
        admin(),
        json!({
            "name": "10-B",
            "gradeLabel": "10",
            "directorId": other_teacher_id,
            "studentIds": [s3],
        }),
    );
    let group_b_id = group_b["group"]["id"].as_str().expect("group id").to_string();

    let math = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        admin(),
        json!({ "name": "Mathematics", "type": "core", "teacherId": teacher_id }),
    );
    let math_id = math["subject"]["id"].as_str().expect("subject id").to_string();
    let drawing = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        admin(),
        json!({ "name": "Technical Drawing", "type": "modality", "teacherId": teacher_id }),
    );
    let drawing_id = drawing["subject"]["id"].as_str().expect("subject id").to_string();

    let teacher_actor = json!({ "id": teacher_id, "role": "teacher" });
    // Math grades for s1 and s3: groups resolve to {10-A, 10-B}.
    for (i, (student, score)) in [(s1.clone(), 4.0_f64), (s3.clone(), 2.0)].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.upsert",
            teacher_actor.clone(),
            json!({
                "studentId": student,
                "subjectId": math_id,
                "semester": 1,
                "cut1": score,
                "cut2": score,
                "finalExam": score,
            }),
        );
    }
    // Drawing grade for s2 only: groups resolve to {10-A}.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.upsert",
        teacher_actor.clone(),
        json!({
            "studentId": s2,
            "subjectId": drawing_id,
            "semester": 1,
            "cut1": 4.0,
            "cut2": 4.0,
            "finalExam": 4.0,
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.teacherPerformance",
        teacher_actor.clone(),
        json!({ "teacherId": teacher_id, "period": "2025-1" }),
    );

    let director_groups = report["directorGroups"].as_array().expect("directorGroups");
    assert_eq!(director_groups.len(), 1);
    assert_eq!(director_groups[0]["name"].as_str(), Some("10-A"));

    let subjects = report["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);

    let math_report = subjects
        .iter()
        .find(|s| s["name"].as_str() == Some("Mathematics"))
        .expect("math subject report");
    assert_eq!(math_report["total"].as_i64(), Some(2));
    assert_eq!(math_report["approved"].as_i64(), Some(1));
    assert_eq!(math_report["average"].as_f64(), Some(3.0));
    let mut math_groups: Vec<&str> = math_report["groupIds"]
        .as_array()
        .expect("groupIds")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    math_groups.sort_unstable();
    let mut expected = [group_a_id.as_str(), group_b_id.as_str()];
    expected.sort_unstable();
    assert_eq!(math_groups, expected);

    let drawing_report = subjects
        .iter()
        .find(|s| s["name"].as_str() == Some("Technical Drawing"))
        .expect("drawing subject report");
    assert_eq!(
        drawing_report["groupIds"].as_array().expect("groupIds").len(),
        1
    );
    assert_eq!(
        drawing_report["groupIds"][0].as_str(),
        Some(group_a_id.as_str())
    );

    // A subject with no grades in the period still shows up, empty.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.teacherPerformance",
        teacher_actor,
        json!({ "teacherId": teacher_id, "period": "2025-2" }),
    );
    let subjects = empty["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert!(subjects.iter().all(|s| s["average"].is_null()));
    assert!(subjects.iter().all(|s| s["total"].as_i64() == Some(0)));
}
