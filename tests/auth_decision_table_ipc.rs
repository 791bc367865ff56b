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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    assert_eq!(value["ok"].as_bool(), Some(false));
    value["error"]["code"].as_str()
}

fn admin() -> serde_json::Value {
    json!({ "id": "admin-0", "role": "admin" })
}

#[test]
fn roles_are_enforced_per_operation() {
    let workspace = temp_dir("notasd-auth-table");
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
    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        admin(),
        json!({ "name": "Ana Ruiz", "email": "ana@school.test", "role": "student" }),
    )["user"]["id"]
        .as_str()
        .expect("student id")
        .to_string();
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        admin(),
        json!({ "name": "Luis Vega", "email": "luis@school.test", "role": "student" }),
    )["user"]["id"]
        .as_str()
        .expect("student id")
        .to_string();

    let teacher_actor = json!({ "id": teacher_id, "role": "teacher" });
    let s1_actor = json!({ "id": s1, "role": "student" });

    // No actor on a protected method.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.listByStudent",
        json!(null),
        json!({ "studentId": s1 }),
    );
    assert_eq!(error_code(&resp), Some("unauthenticated"));

    // A student reads their own grades but nobody else's.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.listByStudent",
        s1_actor.clone(),
        json!({ "studentId": s1 }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "grades.listByStudent",
        s1_actor.clone(),
        json!({ "studentId": s2 }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));

    // Students cannot write grades; teachers cannot manage subjects.
    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "grades.upsert",
        s1_actor.clone(),
        json!({
            "studentId": s1,
            "subjectId": "irrelevant",
            "semester": 1,
            "cut1": 3.0,
            "cut2": 3.0,
            "finalExam": 3.0,
        }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.create",
        teacher_actor.clone(),
        json!({ "name": "Art", "type": "core", "teacherId": teacher_id }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));

    // Group and subject reports are teacher territory.
    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "reports.group",
        s1_actor.clone(),
        json!({ "groupId": "irrelevant", "period": "2025-1" }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));

    // The teacher performance report is self-only for teachers.
    let resp = request(
        &mut stdin,
        &mut reader,
        "11",
        "reports.teacherPerformance",
        teacher_actor.clone(),
        json!({ "teacherId": "someone-else", "period": "2025-1" }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reports.teacherPerformance",
        teacher_actor.clone(),
        json!({ "teacherId": teacher_id, "period": "2025-1" }),
    );

    // Backups are an admin concern.
    let resp = request(
        &mut stdin,
        &mut reader,
        "13",
        "backup.export",
        teacher_actor,
        json!({ "outPath": workspace.join("bundle.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));

    // Students may update their own profile, not someone else's.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "users.update",
        s1_actor.clone(),
        json!({ "userId": s1, "name": "Ana R." }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "15",
        "users.update",
        s1_actor,
        json!({ "userId": s2, "name": "Hacked" }),
    );
    assert_eq!(error_code(&resp), Some("forbidden"));
}
